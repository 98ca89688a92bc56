//! Open/closed state machines around one remote streaming subscription.
//!
//! [`StreamEndpoint`] wraps a server stream: opening it acquires the remote
//! subscription and starts a reader task on the worker that decodes frames
//! and hands them to a [`Dispatch`] sink. [`InputEndpoint`] wraps a client
//! stream the caller pushes frames into.
//!
//! ```text
//!            open()                       remote EOF / error
//!  Closed ──────────▶ Open (reader live) ──────────────────▶ Open (reader done)
//!    ▲                   │ close(): cancel + await reader          │
//!    └───────────────────┴─────────────────────────────────────────┘
//! ```
//!
//! Stream parameters live in the endpoint's source (`S`) and can only be
//! changed while closed; every open calls the transport again with the
//! current parameters.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::context::ExecutionContext;
use crate::error::{Error, Result};
use crate::subscriber::Terminal;
use crate::transport::{ClientStream, ServerStream, Transport};

/// Names a remote streaming method and the arguments it is opened with.
pub trait StreamRequest: Clone + Send + Sync + 'static {
    fn method(&self) -> &'static str;

    fn args(&self) -> Value {
        Value::Array(Vec::new())
    }
}

/// A server stream whose frames decode into `Item`s.
pub trait StreamSource: StreamRequest {
    type Item: Clone + Send + Sync + 'static;

    fn decode(&self, frame: Bytes) -> Result<Self::Item>;
}

/// Receiver of everything a stream reader produces.
pub trait Dispatch<T>: Send + Sync {
    /// Deliver one decoded item.
    fn dispatch(&self, item: T);

    /// Deliver the end of the stream.
    fn terminate(&self, terminal: Terminal);
}

fn lock_source<S>(source: &Mutex<S>) -> Result<std::sync::MutexGuard<'_, S>> {
    source
        .lock()
        .map_err(|_| Error::Panicked("stream parameters lock poisoned".to_string()))
}

// ── StreamEndpoint ───────────────────────────────────────────────────────────

enum EndpointState {
    Closed,
    Open {
        cancel: CancellationToken,
        reader: JoinHandle<Result<()>>,
    },
}

/// The open/closed state machine of one server-streaming subscription.
pub struct StreamEndpoint<S: StreamSource> {
    transport: Arc<dyn Transport>,
    context: ExecutionContext,
    source: Mutex<S>,
    state: tokio::sync::Mutex<EndpointState>,
    /// Set while a subscription is being opened or its reader is running.
    live: Arc<AtomicBool>,
    sink: Arc<dyn Dispatch<S::Item>>,
}

impl<S: StreamSource> StreamEndpoint<S> {
    pub fn new(
        source: S,
        transport: Arc<dyn Transport>,
        context: ExecutionContext,
        sink: Arc<dyn Dispatch<S::Item>>,
    ) -> Self {
        Self {
            transport,
            context,
            source: Mutex::new(source),
            state: tokio::sync::Mutex::new(EndpointState::Closed),
            live: Arc::new(AtomicBool::new(false)),
            sink,
        }
    }

    /// `true` when no subscription is active or being opened (never opened,
    /// closed, or the remote side ended it).
    pub fn is_closed(&self) -> bool {
        !self.live.load(Ordering::SeqCst)
    }

    /// Copy of the current stream parameters.
    pub fn source(&self) -> Result<S> {
        Ok(lock_source(&self.source)?.clone())
    }

    /// Change stream parameters. Fails with [`Error::InvalidState`] while
    /// the stream is open or opening.
    pub fn configure<R>(&self, f: impl FnOnce(&mut S) -> R) -> Result<R> {
        let mut source = lock_source(&self.source)?;
        if !self.is_closed() {
            return Err(Error::InvalidState(format!(
                "cannot change {} parameters while streaming",
                source.method()
            )));
        }
        Ok(f(&mut source))
    }

    /// Acquire the remote subscription and start reading. No-op while open.
    pub async fn open(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if let EndpointState::Open { reader, .. } = &*state {
            if !reader.is_finished() {
                trace!("Endpoint already open");
                return Ok(());
            }
        }
        // A previous subscription ended on its own; reap it first.
        if let EndpointState::Open { reader, .. } =
            std::mem::replace(&mut *state, EndpointState::Closed)
        {
            if let Ok(Err(e)) = reader.await {
                debug!("Previous subscription ended with: {}", e);
            }
        }

        // Parameters are frozen from the moment they are read.
        let (opening, source) = {
            let source = lock_source(&self.source)?;
            (Opening::start(&self.live), source.clone())
        };
        let method = source.method();
        let stream = self
            .transport
            .open_server_stream(method, source.args())
            .await?;

        let cancel = self.context.cancellation_token().child_token();
        let reader = self.context.spawn_joinable(pump(
            source,
            stream,
            self.sink.clone(),
            cancel.clone(),
            self.live.clone(),
        ))?;
        opening.complete();
        debug!("Opened stream {}", method);
        *state = EndpointState::Open { cancel, reader };
        Ok(())
    }

    /// Cancel the subscription and wait for the reader to acknowledge.
    ///
    /// No-op while closed. The cancellation outcome is swallowed; any other
    /// failure of the subscription propagates.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let EndpointState::Open { cancel, reader } =
            std::mem::replace(&mut *state, EndpointState::Closed)
        else {
            trace!("Endpoint already closed");
            return Ok(());
        };
        cancel.cancel();
        let outcome = match reader.await {
            Ok(Ok(())) | Ok(Err(Error::Cancelled)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(Error::from_panic(e.into_panic())),
        };
        self.live.store(false, Ordering::SeqCst);
        if let Ok(source) = self.source.lock() {
            debug!("Closed stream {}", source.method());
        }
        outcome
    }

    /// Run `body` with the stream open, closing it on every exit path.
    ///
    /// The body's error wins over a close error.
    pub async fn with_open<F, Fut, R>(&self, body: F) -> Result<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        self.open().await?;
        let outcome = body().await;
        let closed = self.close().await;
        let value = outcome?;
        closed?;
        Ok(value)
    }
}

/// Marks an endpoint live for the duration of `open()`. Unless completed,
/// dropping it (failed or abandoned open) marks the endpoint closed again.
struct Opening<'a> {
    live: &'a AtomicBool,
    done: bool,
}

impl<'a> Opening<'a> {
    fn start(live: &'a AtomicBool) -> Self {
        live.store(true, Ordering::SeqCst);
        Self { live, done: false }
    }

    fn complete(mut self) {
        self.done = true;
    }
}

impl Drop for Opening<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.live.store(false, Ordering::SeqCst);
        }
    }
}

/// Reader task: decode frames and hand them to the sink until the stream
/// ends or the endpoint cancels it.
async fn pump<S: StreamSource>(
    source: S,
    mut stream: ServerStream,
    sink: Arc<dyn Dispatch<S::Item>>,
    cancel: CancellationToken,
    live: Arc<AtomicBool>,
) -> Result<()> {
    let method = source.method();
    let (outcome, terminal) = loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break (Err(Error::Cancelled), None),
            frame = stream.next() => frame,
        };
        match frame {
            None => {
                debug!("Stream {} ended", method);
                break (Ok(()), Some(Terminal::Eof));
            }
            Some(Ok(bytes)) => {
                trace!("Stream {}: frame of {} bytes", method, bytes.len());
                match source.decode(bytes) {
                    Ok(item) => sink.dispatch(item),
                    Err(e) => warn!("Stream {}: skipping undecodable frame: {}", method, e),
                }
            }
            Some(Err(Error::Cancelled)) => break (Err(Error::Cancelled), None),
            Some(Err(e)) => {
                warn!("Stream {} failed: {}", method, e);
                break (Err(e.clone()), Some(Terminal::Error(e)));
            }
        }
    };
    stream.cancel();
    // Consumers that observe the terminal must already see the endpoint closed.
    live.store(false, Ordering::SeqCst);
    if let Some(terminal) = terminal {
        sink.terminate(terminal);
    }
    outcome
}

// ── InputEndpoint ────────────────────────────────────────────────────────────

/// The open/closed state machine of one client-streaming call.
pub struct InputEndpoint<R: StreamRequest> {
    transport: Arc<dyn Transport>,
    request: Mutex<R>,
    stream: tokio::sync::Mutex<Option<ClientStream>>,
}

impl<R: StreamRequest> InputEndpoint<R> {
    pub fn new(request: R, transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            request: Mutex::new(request),
            stream: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.stream
            .lock()
            .await
            .as_ref()
            .map_or(true, ClientStream::is_closed)
    }

    pub fn request(&self) -> Result<R> {
        Ok(lock_source(&self.request)?.clone())
    }

    /// Change call parameters. Fails with [`Error::InvalidState`] while open.
    pub fn configure<T>(&self, f: impl FnOnce(&mut R) -> T) -> Result<T> {
        let open = self
            .stream
            .try_lock()
            .map(|s| s.as_ref().is_some_and(|s| !s.is_closed()))
            .unwrap_or(true);
        let mut request = lock_source(&self.request)?;
        if open {
            return Err(Error::InvalidState(format!(
                "cannot change {} parameters while streaming",
                request.method()
            )));
        }
        Ok(f(&mut request))
    }

    /// Start the call. No-op while open.
    pub async fn open(&self) -> Result<()> {
        let mut slot = self.stream.lock().await;
        if slot.as_ref().is_some_and(|s| !s.is_closed()) {
            return Ok(());
        }
        let request = self.request()?;
        let stream = self
            .transport
            .open_client_stream(request.method(), request.args())
            .await?;
        debug!("Opened input stream {}", request.method());
        *slot = Some(stream);
        Ok(())
    }

    /// Push one frame. Fails with [`Error::StreamClosed`] while closed.
    pub async fn send(&self, frame: Bytes) -> Result<()> {
        let slot = self.stream.lock().await;
        match slot.as_ref() {
            Some(stream) => stream.send(frame).await,
            None => Err(Error::StreamClosed),
        }
    }

    /// Finish the call. Frames already sent are still delivered. No-op while
    /// closed.
    pub async fn close(&self) -> Result<()> {
        if self.stream.lock().await.take().is_some() {
            debug!("Closed input stream {}", self.request()?.method());
        }
        Ok(())
    }

    /// Run `body` with the call open, closing it on every exit path.
    pub async fn with_open<F, Fut, T>(&self, body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.open().await?;
        let outcome = body().await;
        let closed = self.close().await;
        let value = outcome?;
        closed?;
        Ok(value)
    }
}
