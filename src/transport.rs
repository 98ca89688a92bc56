//! The remote-procedure transport consumed by the execution core.
//!
//! The wire protocol is supplied from outside; this module only fixes the
//! three capabilities the core relies on:
//!
//! - unary request/response ([`Transport::unary_call`])
//! - server streaming ([`Transport::open_server_stream`]), cancellable
//! - client streaming ([`Transport::open_client_stream`])
//!
//! [`ServerStream::channel`] and [`ClientStream::channel`] give transport
//! implementations ready-made halves backed by tokio channels.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{Error, Result};

/// Remote-procedure stub of a connected robot.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Call `method` with `args` and return its result.
    async fn unary_call(&self, method: &str, args: Value) -> Result<Value>;

    /// Subscribe to a server-streaming `method`. Frames arrive until the
    /// remote side ends the stream or the subscription is cancelled.
    async fn open_server_stream(&self, method: &str, args: Value) -> Result<ServerStream>;

    /// Open a client-streaming `method`; frames are pushed through the
    /// returned [`ClientStream`].
    async fn open_client_stream(&self, method: &str, args: Value) -> Result<ClientStream>;
}

/// Establishes a [`Transport`] to a robot host.
///
/// Runs inside the execution context during `Robot::connect`.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, host: &str) -> Result<Arc<dyn Transport>>;
}

// ── Server streaming ─────────────────────────────────────────────────────────

/// Consumer half of a remote server-streaming subscription.
///
/// Cancelling (or dropping) it cancels the remote subscription.
pub struct ServerStream {
    frames: mpsc::Receiver<Result<Bytes>>,
    cancel: CancellationToken,
}

impl ServerStream {
    /// Create a connected feed/stream pair holding up to `buffer` frames.
    pub fn channel(buffer: usize) -> (StreamFeed, ServerStream) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let cancel = CancellationToken::new();
        (
            StreamFeed {
                tx,
                cancel: cancel.clone(),
            },
            ServerStream { frames: rx, cancel },
        )
    }

    /// Next frame. `None` means the remote side ended the stream.
    ///
    /// Returns `Some(Err(Error::Cancelled))` once cancelled.
    pub async fn next(&mut self) -> Option<Result<Bytes>> {
        if self.cancel.is_cancelled() {
            return Some(Err(Error::Cancelled));
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Some(Err(Error::Cancelled)),
            frame = self.frames.recv() => frame,
        }
    }

    /// Cancel the remote subscription.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for ServerStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Producer half of a server stream, held by the transport.
#[derive(Clone)]
pub struct StreamFeed {
    tx: mpsc::Sender<Result<Bytes>>,
    cancel: CancellationToken,
}

impl StreamFeed {
    /// Deliver a frame, waiting for buffer space.
    pub async fn send(&self, frame: Bytes) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.tx.send(Ok(frame)).await.map_err(|_| Error::Cancelled)
    }

    /// Deliver a frame without waiting. Fails if cancelled or full.
    pub fn try_send(&self, frame: Bytes) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.tx.try_send(Ok(frame)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                trace!("StreamFeed full, frame dropped");
                Error::Remote("stream buffer full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => Error::Cancelled,
        })
    }

    /// Fail the stream with `error`; the consumer sees it as a terminal error.
    pub fn fail(&self, error: Error) -> Result<()> {
        self.tx.try_send(Err(error)).map_err(|_| Error::Cancelled)
    }

    /// `true` once the consumer cancelled the subscription.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    /// Resolves when the consumer cancels the subscription.
    pub async fn cancelled(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.tx.closed() => {}
        }
    }
}

// ── Client streaming ─────────────────────────────────────────────────────────

/// Producer half of a client-streaming call, held by the caller.
pub struct ClientStream {
    frames: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

impl ClientStream {
    /// Create a connected stream/receiver pair holding up to `buffer` frames.
    pub fn channel(buffer: usize) -> (ClientStream, ClientStreamReceiver) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let cancel = CancellationToken::new();
        (
            ClientStream {
                frames: tx,
                cancel: cancel.clone(),
            },
            ClientStreamReceiver { frames: rx, cancel },
        )
    }

    /// Push a frame to the remote side.
    pub async fn send(&self, frame: Bytes) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::StreamClosed);
        }
        self.frames.send(frame).await.map_err(|_| Error::StreamClosed)
    }

    /// Abort the call.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// `true` if the remote side went away or the call was cancelled.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.frames.is_closed()
    }
}

/// Consumer half of a client stream, held by the transport.
pub struct ClientStreamReceiver {
    frames: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
}

impl ClientStreamReceiver {
    /// Next frame; `None` once the caller finished or cancelled the call.
    pub async fn recv(&mut self) -> Option<Bytes> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            frame = self.frames.recv() => frame,
        }
    }

    /// Next frame without waiting.
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.frames.try_recv().ok()
    }

    /// `true` if the caller cancelled the call.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
