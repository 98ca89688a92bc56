use bytes::Bytes;
use serde_json::{json, Value};

use super::Remote;
use crate::config::CameraConfig;
use crate::endpoint::{StreamRequest, StreamSource};
use crate::error::{Error, Result};
use crate::mode::Call;
use crate::multiplexer::StreamMultiplexer;
use crate::subscriber::Subscriber;

/// Parameters of the camera stream. Frames are JPEG images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraSource {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
}

impl StreamRequest for CameraSource {
    fn method(&self) -> &'static str {
        "camera"
    }

    fn args(&self) -> Value {
        json!([self.width, self.height, self.framerate])
    }
}

impl StreamSource for CameraSource {
    type Item = Bytes;

    fn decode(&self, frame: Bytes) -> Result<Bytes> {
        if frame.is_empty() {
            return Err(Error::Protocol("empty camera frame".into()));
        }
        Ok(frame)
    }
}

/// The robot's camera.
pub struct Camera {
    remote: Remote,
    stream: StreamMultiplexer<CameraSource>,
    q_size: usize,
}

impl Camera {
    pub(crate) fn new(remote: Remote, config: &CameraConfig) -> Self {
        let source = CameraSource {
            width: config.width,
            height: config.height,
            framerate: config.framerate,
        };
        let stream = StreamMultiplexer::new(source, remote.transport.clone(), remote.adapter.clone());
        Self {
            remote,
            stream,
            q_size: config.q_size.max(1),
        }
    }

    pub fn resolution(&self) -> Result<(u32, u32)> {
        let source = self.stream.endpoint().source()?;
        Ok((source.width, source.height))
    }

    /// Fails with [`Error::InvalidState`] while the camera is streaming.
    pub fn set_resolution(&self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidState("resolution must be non-zero".into()));
        }
        self.stream.endpoint().configure(|s| {
            s.width = width;
            s.height = height;
        })
    }

    pub fn framerate(&self) -> Result<u32> {
        Ok(self.stream.endpoint().source()?.framerate)
    }

    /// Fails with [`Error::InvalidState`] while the camera is streaming.
    pub fn set_framerate(&self, framerate: u32) -> Result<()> {
        if framerate == 0 {
            return Err(Error::InvalidState("framerate must be non-zero".into()));
        }
        self.stream.endpoint().configure(|s| s.framerate = framerate)
    }

    /// `true` while nobody is watching.
    pub fn is_closed(&self) -> bool {
        self.stream.is_closed()
    }

    /// Frame buffer holding the configured number of frames.
    pub fn output_stream(&self) -> Call<Subscriber<Bytes>> {
        self.stream.get_buffer(self.q_size)
    }

    /// Frame buffer holding up to `capacity` frames.
    pub fn get_buffer(&self, capacity: usize) -> Call<Subscriber<Bytes>> {
        self.stream.get_buffer(capacity)
    }

    /// Take a single photo. Not available while streaming.
    pub fn capture(&self) -> Call<Bytes> {
        let transport = self.remote.transport.clone();
        let stream = self.stream.clone();
        Call::new(&self.remote.adapter, async move {
            if !stream.is_closed() {
                return Err(Error::InvalidState(
                    "cannot take a photo while the camera is streaming".into(),
                ));
            }
            let source = stream.endpoint().source()?;
            let image = transport
                .unary_call("capture", json!([source.width, source.height]))
                .await?;
            let image: Vec<u8> = serde_json::from_value(image)?;
            Ok(Bytes::from(image))
        })
    }

    pub fn multiplexer(&self) -> &StreamMultiplexer<CameraSource> {
        &self.stream
    }
}
