use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::warn;

use super::Remote;
use crate::event::{Callback, CallbackRunner, Callbacks, SensorEvent, Trigger};
use crate::mode::Call;

fn register(callbacks: &Callbacks, trigger: Trigger, callback: Option<Callback>) {
    match callback {
        Some(cb) => callbacks.set(trigger, cb),
        None => callbacks.clear(trigger),
    }
}

// ── Touch ──

#[derive(Default)]
struct TouchState {
    touched: AtomicBool,
    long_touched: AtomicBool,
    double_touched: AtomicBool,
}

/// The touch sensor on the robot's head.
pub struct TouchSensor {
    remote: Remote,
    state: TouchState,
    callbacks: Callbacks,
}

impl TouchSensor {
    pub(crate) fn new(remote: Remote) -> Self {
        Self {
            remote,
            state: TouchState::default(),
            callbacks: Callbacks::new(),
        }
    }

    pub fn touched(&self) -> bool {
        self.state.touched.load(Ordering::SeqCst)
    }

    pub fn long_touched(&self) -> bool {
        self.state.long_touched.load(Ordering::SeqCst)
    }

    pub fn double_touched(&self) -> bool {
        self.state.double_touched.load(Ordering::SeqCst)
    }

    pub fn when_touched(&self, callback: Option<Callback>) {
        register(&self.callbacks, Trigger::Touched, callback);
    }

    pub fn when_released(&self, callback: Option<Callback>) {
        register(&self.callbacks, Trigger::Released, callback);
    }

    pub fn when_long_touched(&self, callback: Option<Callback>) {
        register(&self.callbacks, Trigger::LongTouched, callback);
    }

    pub fn when_double_touched(&self, callback: Option<Callback>) {
        register(&self.callbacks, Trigger::DoubleTouched, callback);
    }

    /// Seconds a touch must last to count as a long touch.
    pub fn long_touch_threshold(&self) -> Call<f64> {
        self.remote.get("long_press_threshold")
    }

    pub fn set_long_touch_threshold(&self, seconds: f64) -> Call<()> {
        self.remote.set("long_press_threshold", seconds)
    }

    /// Whether a held touch fires `when_long_touched` again every
    /// long-touch threshold.
    pub fn long_touch_repeat(&self) -> Call<bool> {
        self.remote.get("long_press_repeat")
    }

    pub fn set_long_touch_repeat(&self, repeat: bool) -> Call<()> {
        self.remote.set("long_press_repeat", repeat)
    }

    /// Maximum gap in seconds between the two touches of a double touch.
    pub fn double_touch_threshold(&self) -> Call<f64> {
        self.remote.get("double_press_threshold")
    }

    pub fn set_double_touch_threshold(&self, seconds: f64) -> Call<()> {
        self.remote.set("double_press_threshold", seconds)
    }

    /// Apply a touch event. Returns `false` if the event is not ours.
    pub(crate) async fn handle(&self, runner: &CallbackRunner, event: &SensorEvent) -> bool {
        let on = event.data.as_bool().unwrap_or(false);
        match event.name.as_str() {
            "pressed" => {
                if !on {
                    self.state.long_touched.store(false, Ordering::SeqCst);
                    self.state.double_touched.store(false, Ordering::SeqCst);
                }
                self.state.touched.store(on, Ordering::SeqCst);
                let trigger = if on { Trigger::Touched } else { Trigger::Released };
                runner.fire(&self.callbacks, trigger, event.data.clone()).await;
            }
            "long_pressed" => {
                self.state.long_touched.store(on, Ordering::SeqCst);
                runner
                    .fire(&self.callbacks, Trigger::LongTouched, event.data.clone())
                    .await;
            }
            "double_pressed" => {
                self.state.touched.store(on, Ordering::SeqCst);
                self.state.double_touched.store(on, Ordering::SeqCst);
                runner.fire(&self.callbacks, Trigger::Touched, event.data.clone()).await;
                runner
                    .fire(&self.callbacks, Trigger::DoubleTouched, event.data.clone())
                    .await;
            }
            _ => return false,
        }
        true
    }
}

// ── Sonar ──

/// The ultrasonic distance sensor.
pub struct Sonar {
    remote: Remote,
    callbacks: Callbacks,
}

impl Sonar {
    pub(crate) fn new(remote: Remote) -> Self {
        Self {
            remote,
            callbacks: Callbacks::new(),
        }
    }

    /// Distance to the nearest obstacle in meters.
    pub fn distance(&self) -> Call<f64> {
        self.remote.get("distance")
    }

    /// Distance below which `in_range` fires.
    pub fn threshold_distance(&self) -> Call<f64> {
        self.remote.get("threshold_distance")
    }

    pub fn set_threshold_distance(&self, meters: f64) -> Call<()> {
        self.remote.set("threshold_distance", meters)
    }

    /// Fired with the measured distance when an obstacle comes within the
    /// threshold.
    pub fn when_in_range(&self, callback: Option<Callback>) {
        register(&self.callbacks, Trigger::InRange, callback);
    }

    pub fn when_out_of_range(&self, callback: Option<Callback>) {
        register(&self.callbacks, Trigger::OutOfRange, callback);
    }

    pub(crate) async fn handle(&self, runner: &CallbackRunner, event: &SensorEvent) -> bool {
        let trigger = match event.name.as_str() {
            "in_range" => Trigger::InRange,
            "out_of_range" => Trigger::OutOfRange,
            _ => return false,
        };
        runner.fire(&self.callbacks, trigger, event.data.clone()).await;
        true
    }
}

// ── Sensor arrays ──

/// `N` binary sensors reported individually but read as one.
pub struct SensorArray<const N: usize> {
    states: Mutex<[bool; N]>,
    callbacks: Callbacks,
}

/// One element of a [`SensorArray`].
#[derive(Clone)]
pub struct SensorChild<const N: usize> {
    parent: Arc<SensorArray<N>>,
    index: usize,
}

/// The infrared line sensors: left, middle, right.
pub type Infrared = SensorArray<3>;

impl<const N: usize> SensorArray<N> {
    pub fn new() -> Self {
        Self {
            states: Mutex::new([false; N]),
            callbacks: Callbacks::new(),
        }
    }

    pub fn state(&self) -> [bool; N] {
        match self.states.lock() {
            Ok(states) => *states,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// View of sensor `index`.
    pub fn child(self: &Arc<Self>, index: usize) -> Option<SensorChild<N>> {
        (index < N).then(|| SensorChild {
            parent: self.clone(),
            index,
        })
    }

    /// View of the sensor called `name` ("left", "middle", "right").
    pub fn child_named(self: &Arc<Self>, name: &str) -> Option<SensorChild<N>> {
        let index = match (N, name) {
            (2, "left") | (3, "left") => 0,
            (2, "right") => 1,
            (3, "middle") => 1,
            (3, "right") => 2,
            _ => return None,
        };
        self.child(index)
    }

    /// Fired with the whole state array whenever one sensor changes.
    pub fn when_state_changed(&self, callback: Option<Callback>) {
        register(&self.callbacks, Trigger::InfraredChanged, callback);
    }

    /// Record sensor `index` and return the new state array.
    pub(crate) fn update(&self, index: usize, value: bool) -> Option<[bool; N]> {
        if index >= N {
            return None;
        }
        let mut states = match self.states.lock() {
            Ok(states) => states,
            Err(poisoned) => poisoned.into_inner(),
        };
        states[index] = value;
        Some(*states)
    }

    pub(crate) async fn handle(&self, runner: &CallbackRunner, event: &SensorEvent) -> bool {
        let index = match event.name.as_str() {
            "lir" => 0,
            "mir" if N == 3 => 1,
            "rir" => N.saturating_sub(1),
            _ => return false,
        };
        let Some(value) = event.data.as_bool().or_else(|| event.data.as_u64().map(|v| v != 0)) else {
            warn!("Ignoring {} event with data {}", event.name, event.data);
            return true;
        };
        if let Some(states) = self.update(index, value) {
            let data = Value::Array(states.iter().map(|s| Value::Bool(*s)).collect());
            runner.fire(&self.callbacks, Trigger::InfraredChanged, data).await;
        }
        true
    }
}

impl<const N: usize> Default for SensorArray<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> SensorChild<N> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> bool {
        self.parent.state()[self.index]
    }

    pub fn parent(&self) -> &Arc<SensorArray<N>> {
        &self.parent
    }
}
