//! Proxies for the robot's peripherals.
//!
//! Every remote method returns a [`Call`], so the same proxy serves native,
//! blocking and deferred callers. Streaming peripherals own a
//! [`StreamMultiplexer`](crate::StreamMultiplexer) or an
//! [`InputEndpoint`](crate::InputEndpoint).

mod camera;
mod env;
mod microphone;
mod motion;
mod sensors;
mod speaker;

pub use camera::{Camera, CameraSource};
pub use env::Env;
pub use microphone::{AudioBlock, Microphone, MicrophoneSource};
pub use motion::{Head, Motors};
pub use sensors::{Infrared, SensorArray, SensorChild, Sonar, TouchSensor};
pub use speaker::{Speaker, SpeakerRequest};

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::mode::{Call, ModeAdapter};
use crate::transport::Transport;

/// What every proxy needs to reach the robot.
#[derive(Clone)]
pub(crate) struct Remote {
    pub(crate) adapter: ModeAdapter,
    pub(crate) transport: Arc<dyn Transport>,
}

impl Remote {
    pub(crate) fn new(adapter: ModeAdapter, transport: Arc<dyn Transport>) -> Self {
        Self { adapter, transport }
    }

    /// A mode-dependent command.
    pub(crate) fn command(&self, method: &'static str, args: Value) -> Call<()> {
        let transport = self.transport.clone();
        Call::new(&self.adapter, async move {
            transport.unary_call(method, args).await.map(|_| ())
        })
    }

    /// A query whose answer decodes into `T`.
    pub(crate) fn query<T>(&self, method: &'static str, args: Value) -> Call<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let transport = self.transport.clone();
        Call::new(&self.adapter, async move {
            decode(method, transport.unary_call(method, args).await?)
        })
    }

    /// Property getter: synchronous, no deadline.
    pub(crate) fn get<T>(&self, method: &'static str) -> Call<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let transport = self.transport.clone();
        Call::property(&self.adapter, async move {
            decode(method, transport.unary_call(method, Value::Array(Vec::new())).await?)
        })
    }

    /// Property setter: synchronous, no deadline.
    pub(crate) fn set<T>(&self, method: &'static str, value: T) -> Call<()>
    where
        T: Serialize,
    {
        let transport = self.transport.clone();
        let arg = serde_json::to_value(value);
        Call::property(&self.adapter, async move {
            transport.unary_call(method, Value::Array(vec![arg?])).await.map(|_| ())
        })
    }
}

fn decode<T: DeserializeOwned>(method: &str, value: Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| Error::Protocol(format!("unexpected answer to {}: {}", method, e)))
}
