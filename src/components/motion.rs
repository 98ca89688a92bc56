use serde_json::json;

use super::Remote;
use crate::error::Error;
use crate::mode::Call;

/// The robot's head servo.
pub struct Head {
    remote: Remote,
}

impl Head {
    pub const MIN_ANGLE: f64 = -20.0;
    pub const MAX_ANGLE: f64 = 20.0;
    pub const DEFAULT_SPEED: f64 = 60.0;

    pub(crate) fn new(remote: Remote) -> Self {
        Self { remote }
    }

    /// Current angle in degrees.
    pub fn angle(&self) -> Call<f64> {
        self.remote.get("head")
    }

    /// Move to `angle` immediately.
    pub fn set_angle_now(&self, angle: f64) -> Call<()> {
        self.remote.set("head", clamp_angle(angle))
    }

    /// Move to `angle` over `duration` seconds or at `speed` degrees per
    /// second; at most one of the two may be given.
    pub fn set_angle(&self, angle: f64, duration: Option<f64>, speed: Option<f64>) -> Call<()> {
        let remote = self.remote.clone();
        Call::new(&self.remote.adapter, async move {
            if duration.is_some() && speed.is_some() {
                return Err(Error::InvalidState("cannot set both duration and speed".into()));
            }
            let speed = match (duration, speed) {
                (None, None) => Some(Head::DEFAULT_SPEED),
                (_, speed) => speed,
            };
            let args = json!([clamp_angle(angle), duration, speed]);
            remote.transport.unary_call("head", args).await.map(|_| ())
        })
    }
}

fn clamp_angle(angle: f64) -> f64 {
    angle.clamp(Head::MIN_ANGLE, Head::MAX_ANGLE)
}

/// The two drive motors.
pub struct Motors {
    remote: Remote,
}

impl Motors {
    pub(crate) fn new(remote: Remote) -> Self {
        Self { remote }
    }

    /// Current `(left, right)` speed, each in `-1.0..=1.0`.
    pub fn speed(&self) -> Call<(f64, f64)> {
        self.remote.get("speed")
    }

    pub fn set_speed(&self, left: f64, right: f64) -> Call<()> {
        self.remote.set("speed", (clamp_speed(left), clamp_speed(right)))
    }

    pub fn forward(&self, duration: Option<f64>) -> Call<()> {
        self.drive(1.0, 1.0, duration)
    }

    pub fn backward(&self, duration: Option<f64>) -> Call<()> {
        self.drive(-1.0, -1.0, duration)
    }

    pub fn turn_left(&self, duration: Option<f64>) -> Call<()> {
        self.drive(-1.0, 1.0, duration)
    }

    pub fn turn_right(&self, duration: Option<f64>) -> Call<()> {
        self.drive(1.0, -1.0, duration)
    }

    pub fn stop(&self) -> Call<()> {
        self.remote.set("speed", (0.0, 0.0)).sync()
    }

    /// Drive at `(left, right)`; with a duration the robot stops by itself
    /// afterwards and the call resolves once it has.
    fn drive(&self, left: f64, right: f64, duration: Option<f64>) -> Call<()> {
        let args = match duration {
            Some(d) => json!([[left, right], d]),
            None => json!([[left, right]]),
        };
        self.remote.command("speed", args)
    }
}

fn clamp_speed(speed: f64) -> f64 {
    speed.clamp(-1.0, 1.0)
}
