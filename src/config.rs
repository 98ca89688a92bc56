use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::mode::Mode;

/// Environment variable that overrides [`RobotConfig::host`].
pub const HOST_ENV: &str = "COZMARS_HOST";

/// Connection settings for one robot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotConfig {
    pub host: String,
    pub mode: Mode,
    /// Deadline for blocking calls in milliseconds; `<= 0` waits forever.
    pub call_timeout_ms: i64,
    /// How long disconnect waits for outstanding work, in milliseconds.
    pub shutdown_timeout_ms: u64,
    pub camera: CameraConfig,
    pub microphone: MicrophoneConfig,
    pub speaker: SpeakerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub q_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MicrophoneConfig {
    pub sample_rate: u32,
    /// Seconds of audio per frame.
    pub frame_duration: f64,
    /// Gain in dBFS applied by consumers.
    pub gain: f64,
    pub q_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeakerConfig {
    pub sample_rate: u32,
    /// Seconds of audio per block.
    pub block_duration: f64,
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self {
            host: "cozmars.local".to_string(),
            mode: Mode::Blocking,
            call_timeout_ms: 0,
            shutdown_timeout_ms: 5000,
            camera: CameraConfig::default(),
            microphone: MicrophoneConfig::default(),
            speaker: SpeakerConfig::default(),
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            width: 480,
            height: 360,
            framerate: 5,
            q_size: 5,
        }
    }
}

impl Default for MicrophoneConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            frame_duration: 0.1,
            gain: 25.0,
            q_size: 1,
        }
    }
}

impl Default for SpeakerConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            block_duration: 0.1,
        }
    }
}

impl RobotConfig {
    /// Defaults for `host`.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))
    }

    /// Loads config from `path`; a missing file yields the defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Apply `COZMARS_HOST` if set.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(host) = std::env::var(HOST_ENV) {
            if !host.trim().is_empty() {
                self.host = host.trim().to_string();
            }
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Config("host must not be empty".into()));
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(Error::Config("camera resolution must be non-zero".into()));
        }
        if self.camera.framerate == 0 {
            return Err(Error::Config("camera framerate must be non-zero".into()));
        }
        if self.camera.q_size == 0 || self.microphone.q_size == 0 {
            return Err(Error::Config("q_size must be at least 1".into()));
        }
        if self.microphone.sample_rate == 0 || self.speaker.sample_rate == 0 {
            return Err(Error::Config("sample_rate must be non-zero".into()));
        }
        if self.microphone.frame_duration <= 0.0 || self.speaker.block_duration <= 0.0 {
            return Err(Error::Config("frame and block durations must be positive".into()));
        }
        Ok(())
    }

    /// Deadline for blocking calls, `None` for no deadline.
    pub fn call_timeout(&self) -> Option<Duration> {
        if self.call_timeout_ms > 0 {
            Some(Duration::from_millis(self.call_timeout_ms as u64))
        } else {
            None
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}
