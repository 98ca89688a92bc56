//! Sensor events pushed by the robot and the callbacks they fire.
//!
//! Events arrive on the `sensor_data` server stream as JSON
//! `[name, data]` frames. How a callback runs depends on the connection's
//! [`Mode`]: native connections run it on the worker itself, blocking and
//! deferred ones hand it to a separate executor so the event loop never
//! waits on user code.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tracing::{error, trace};

use crate::context::ExecutionContext;
use crate::endpoint::{StreamRequest, StreamSource};
use crate::error::{Error, Result};
use crate::mode::Mode;

/// One decoded sensor event.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorEvent {
    pub name: String,
    pub data: Value,
}

impl SensorEvent {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    /// Parse a `[name, data]` frame.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let (name, data): (String, Value) = serde_json::from_slice(frame)?;
        Ok(Self { name, data })
    }

    /// Encode as a `[name, data]` frame.
    pub fn encode(&self) -> Bytes {
        Bytes::from(Value::Array(vec![Value::String(self.name.clone()), self.data.clone()]).to_string())
    }
}

/// The robot's sensor event stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct SensorData;

impl StreamRequest for SensorData {
    fn method(&self) -> &'static str {
        "sensor_data"
    }
}

impl StreamSource for SensorData {
    type Item = SensorEvent;

    fn decode(&self, frame: Bytes) -> Result<SensorEvent> {
        SensorEvent::decode(&frame)
    }
}

// ── Callbacks ────────────────────────────────────────────────────────────────

/// Things a callback can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    Touched,
    Released,
    LongTouched,
    DoubleTouched,
    InRange,
    OutOfRange,
    InfraredChanged,
}

/// A user callback. Its argument is the event's data.
#[derive(Clone)]
pub enum Callback {
    Sync(Arc<dyn Fn(Value) + Send + Sync>),
    Async(Arc<dyn Fn(Value) -> BoxFuture<'static, ()> + Send + Sync>),
}

impl Callback {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        Callback::Sync(Arc::new(f))
    }

    pub fn future<F, Fut>(f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Callback::Async(Arc::new(move |v| f(v).boxed()))
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callback::Sync(_) => write!(f, "Callback::Sync"),
            Callback::Async(_) => write!(f, "Callback::Async"),
        }
    }
}

/// Registered callbacks, one per trigger.
#[derive(Default)]
pub struct Callbacks {
    table: RwLock<HashMap<Trigger, Callback>>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `trigger`, replacing any previous one.
    pub fn set(&self, trigger: Trigger, callback: Callback) {
        match self.table.write() {
            Ok(mut table) => {
                table.insert(trigger, callback);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(trigger, callback);
            }
        }
    }

    pub fn clear(&self, trigger: Trigger) {
        match self.table.write() {
            Ok(mut table) => {
                table.remove(&trigger);
            }
            Err(poisoned) => {
                poisoned.into_inner().remove(&trigger);
            }
        }
    }

    pub fn get(&self, trigger: Trigger) -> Option<Callback> {
        match self.table.read() {
            Ok(table) => table.get(&trigger).cloned(),
            Err(poisoned) => poisoned.into_inner().get(&trigger).cloned(),
        }
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.table.read().map(|t| t.len()).unwrap_or(0);
        f.debug_struct("Callbacks").field("registered", &count).finish()
    }
}

/// Runs callbacks according to the connection's mode.
#[derive(Clone, Debug)]
pub struct CallbackRunner {
    mode: Mode,
    context: ExecutionContext,
}

impl CallbackRunner {
    pub fn new(mode: Mode, context: ExecutionContext) -> Self {
        Self { mode, context }
    }

    /// Fire the callback registered for `trigger` in `callbacks`, if any.
    pub async fn fire(&self, callbacks: &Callbacks, trigger: Trigger, data: Value) {
        if let Some(callback) = callbacks.get(trigger) {
            trace!("Firing {:?} callback", trigger);
            self.run(trigger, callback, data).await;
        }
    }

    /// Run one callback. Failures are logged, never propagated.
    pub async fn run(&self, trigger: Trigger, callback: Callback, data: Value) {
        match (self.mode, callback) {
            (Mode::Native, Callback::Sync(f)) => {
                if let Err(p) = std::panic::catch_unwind(AssertUnwindSafe(|| f(data))) {
                    error!("{:?} callback failed: {}", trigger, Error::from_panic(p));
                }
            }
            (Mode::Native, Callback::Async(f)) => {
                if let Err(p) = AssertUnwindSafe(f(data)).catch_unwind().await {
                    error!("{:?} callback failed: {}", trigger, Error::from_panic(p));
                }
            }
            (_, Callback::Sync(f)) => {
                self.context.spawn_callback(move || f(data));
            }
            (_, Callback::Async(f)) => {
                let fut = AssertUnwindSafe(f(data)).catch_unwind();
                self.context.spawn(async move {
                    if let Err(p) = fut.await {
                        error!("{:?} callback failed: {}", trigger, Error::from_panic(p));
                    }
                });
            }
        }
    }
}
