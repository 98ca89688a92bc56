use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use serde_json::{json, Value};
use tracing::debug;

use super::Remote;
use crate::config::SpeakerConfig;
use crate::endpoint::{InputEndpoint, StreamRequest};
use crate::error::{Error, Result};
use crate::mode::Call;

const SAMPLE_WIDTH: usize = 2;

/// Blocks are sent slightly faster than real time so the robot's buffer
/// never runs dry.
const PACING: f64 = 0.9;

/// Parameters of the speaker stream (16-bit mono PCM).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeakerRequest {
    pub sample_rate: u32,
    pub block_duration: f64,
}

impl SpeakerRequest {
    /// Bytes in one block.
    pub fn block_size(&self) -> usize {
        (self.block_duration * f64::from(self.sample_rate)) as usize * SAMPLE_WIDTH
    }
}

impl StreamRequest for SpeakerRequest {
    fn method(&self) -> &'static str {
        "speaker"
    }

    fn args(&self) -> Value {
        json!([self.sample_rate, "int16", self.block_duration])
    }
}

/// The robot's speaker.
pub struct Speaker {
    remote: Remote,
    input: Arc<InputEndpoint<SpeakerRequest>>,
}

impl Speaker {
    pub(crate) fn new(remote: Remote, config: &SpeakerConfig) -> Self {
        let request = SpeakerRequest {
            sample_rate: config.sample_rate,
            block_duration: config.block_duration,
        };
        let input = Arc::new(InputEndpoint::new(request, remote.transport.clone()));
        Self { remote, input }
    }

    pub fn sample_rate(&self) -> Result<u32> {
        Ok(self.input.request()?.sample_rate)
    }

    /// Fails with [`Error::InvalidState`] while playing.
    pub fn set_sample_rate(&self, sample_rate: u32) -> Result<()> {
        self.input.configure(|r| r.sample_rate = sample_rate)
    }

    pub fn block_duration(&self) -> Result<f64> {
        Ok(self.input.request()?.block_duration)
    }

    /// Fails with [`Error::InvalidState`] while playing.
    pub fn set_block_duration(&self, seconds: f64) -> Result<()> {
        if seconds <= 0.0 {
            return Err(Error::InvalidState("block duration must be positive".into()));
        }
        self.input.configure(|r| r.block_duration = seconds)
    }

    /// Volume, 0-100.
    pub fn volume(&self) -> Call<u8> {
        self.remote.get("speaker_volume")
    }

    pub fn set_volume(&self, volume: u8) -> Call<()> {
        self.remote.set("speaker_volume", volume.min(100))
    }

    /// Play pre-cut PCM blocks. The stream is open only for the duration
    /// of the call and is closed on every exit path.
    pub fn play<I>(&self, blocks: I) -> Call<()>
    where
        I: IntoIterator<Item = Bytes>,
        I::IntoIter: Send + 'static,
    {
        let input = self.input.clone();
        let blocks = blocks.into_iter();
        Call::new(&self.remote.adapter, async move {
            let request = input.request()?;
            let pace = Duration::from_secs_f64(request.block_duration * PACING);
            input
                .with_open(|| async {
                    let mut sent = 0usize;
                    for block in blocks {
                        input.send(block).await?;
                        sent += 1;
                        tokio::time::sleep(pace).await;
                    }
                    debug!("Played {} block(s)", sent);
                    Ok(())
                })
                .await
        })
    }

    pub fn is_playing(&self) -> Call<bool> {
        let input = self.input.clone();
        Call::property(&self.remote.adapter, async move { Ok(!input.is_closed().await) })
    }

    pub(crate) fn input(&self) -> Arc<InputEndpoint<SpeakerRequest>> {
        self.input.clone()
    }

    /// Play raw PCM, cut into blocks and zero-padded at the end.
    pub fn play_raw(&self, pcm: Bytes) -> Call<()> {
        let size = self
            .input
            .request()
            .map(|r| r.block_size().max(SAMPLE_WIDTH))
            .unwrap_or(SAMPLE_WIDTH);
        self.play(split_blocks(pcm, size))
    }
}

fn split_blocks(pcm: Bytes, size: usize) -> Vec<Bytes> {
    pcm.chunks(size)
        .map(|chunk| {
            if chunk.len() == size {
                Bytes::copy_from_slice(chunk)
            } else {
                let mut padded = BytesMut::zeroed(size);
                padded[..chunk.len()].copy_from_slice(chunk);
                padded.freeze()
            }
        })
        .collect()
}
