use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::{json, Value};

use super::Remote;
use crate::config::MicrophoneConfig;
use crate::endpoint::{StreamRequest, StreamSource};
use crate::error::{Error, Result};
use crate::mode::Call;
use crate::multiplexer::StreamMultiplexer;
use crate::subscriber::Subscriber;

/// Bytes per sample; the microphone records signed 16-bit mono.
const SAMPLE_WIDTH: usize = 2;

/// Parameters of the microphone stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MicrophoneSource {
    pub sample_rate: u32,
    pub frame_duration: f64,
}

impl StreamRequest for MicrophoneSource {
    fn method(&self) -> &'static str {
        "microphone"
    }

    fn args(&self) -> Value {
        json!([self.sample_rate, "int16", self.frame_duration])
    }
}

impl StreamSource for MicrophoneSource {
    type Item = AudioBlock;

    fn decode(&self, frame: Bytes) -> Result<AudioBlock> {
        if frame.len() % SAMPLE_WIDTH != 0 {
            return Err(Error::Protocol(format!(
                "audio frame of {} bytes is not whole samples",
                frame.len()
            )));
        }
        Ok(AudioBlock {
            data: frame,
            sample_rate: self.sample_rate,
        })
    }
}

/// One frame of 16-bit mono PCM.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBlock {
    pub data: Bytes,
    pub sample_rate: u32,
}

impl AudioBlock {
    pub fn samples(&self) -> Vec<i16> {
        self.data
            .chunks_exact(SAMPLE_WIDTH)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect()
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        let samples = (self.data.len() / SAMPLE_WIDTH) as f64;
        Duration::from_secs_f64(samples / f64::from(self.sample_rate))
    }

    /// Samples scaled by `gain_db` decibels, saturating at the i16 range.
    pub fn amplified(&self, gain_db: f64) -> Vec<i16> {
        let factor = 10f64.powf(gain_db / 20.0);
        self.samples()
            .into_iter()
            .map(|s| (f64::from(s) * factor).clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16)
            .collect()
    }
}

/// The robot's microphone.
pub struct Microphone {
    remote: Remote,
    stream: StreamMultiplexer<MicrophoneSource>,
    q_size: usize,
    gain_bits: Arc<AtomicU64>,
}

impl Microphone {
    pub(crate) fn new(remote: Remote, config: &MicrophoneConfig) -> Self {
        let source = MicrophoneSource {
            sample_rate: config.sample_rate,
            frame_duration: config.frame_duration,
        };
        let stream = StreamMultiplexer::new(source, remote.transport.clone(), remote.adapter.clone());
        Self {
            remote,
            stream,
            q_size: config.q_size.max(1),
            gain_bits: Arc::new(AtomicU64::new(config.gain.to_bits())),
        }
    }

    pub fn sample_rate(&self) -> Result<u32> {
        Ok(self.stream.endpoint().source()?.sample_rate)
    }

    /// Fails with [`Error::InvalidState`] while recording.
    pub fn set_sample_rate(&self, sample_rate: u32) -> Result<()> {
        self.stream.endpoint().configure(|s| s.sample_rate = sample_rate)
    }

    pub fn frame_duration(&self) -> Result<f64> {
        Ok(self.stream.endpoint().source()?.frame_duration)
    }

    /// Fails with [`Error::InvalidState`] while recording.
    pub fn set_frame_duration(&self, seconds: f64) -> Result<()> {
        if seconds <= 0.0 {
            return Err(Error::InvalidState("frame duration must be positive".into()));
        }
        self.stream.endpoint().configure(|s| s.frame_duration = seconds)
    }

    /// Gain in dBFS for [`AudioBlock::amplified`]. Can change at any time.
    pub fn gain(&self) -> f64 {
        f64::from_bits(self.gain_bits.load(Ordering::Relaxed))
    }

    pub fn set_gain(&self, gain: f64) {
        self.gain_bits.store(gain.to_bits(), Ordering::Relaxed);
    }

    /// Hardware volume, 0-100.
    pub fn volume(&self) -> Call<u8> {
        self.remote.get("microphone_volume")
    }

    /// Not available while recording.
    pub fn set_volume(&self, volume: u8) -> Call<()> {
        let stream = self.stream.clone();
        let set = self.remote.set("microphone_volume", volume.min(100));
        Call::property(&self.remote.adapter, async move {
            if !stream.is_closed() {
                return Err(Error::InvalidState(
                    "cannot set volume while the microphone is recording".into(),
                ));
            }
            set.await
        })
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_closed()
    }

    /// Audio buffer holding the configured number of blocks.
    pub fn output_stream(&self) -> Call<Subscriber<AudioBlock>> {
        self.stream.get_buffer(self.q_size)
    }

    pub fn get_buffer(&self, capacity: usize) -> Call<Subscriber<AudioBlock>> {
        self.stream.get_buffer(capacity)
    }

    pub fn multiplexer(&self) -> &StreamMultiplexer<MicrophoneSource> {
        &self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_and_samples() {
        let source = MicrophoneSource {
            sample_rate: 4,
            frame_duration: 0.5,
        };
        let block = source
            .decode(Bytes::from_static(&[0x01, 0x00, 0xff, 0xff]))
            .unwrap();
        assert_eq!(block.samples(), vec![1, -1]);
        assert_eq!(block.duration(), Duration::from_millis(500));
        assert!(source.decode(Bytes::from_static(&[0x01])).is_err());
    }

    #[test]
    fn test_amplified_saturates() {
        let block = AudioBlock {
            data: Bytes::from(i16::MAX.to_le_bytes().to_vec()),
            sample_rate: 16000,
        };
        assert_eq!(block.amplified(20.0), vec![i16::MAX]);
        assert_eq!(block.amplified(0.0), vec![i16::MAX]);
    }
}
