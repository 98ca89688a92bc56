//! The single background worker that owns a connection's I/O.
//!
//! # Design
//!
//! ```text
//!  Caller threads (blocking / deferred)      Native async callers
//!       │ submit(op) -> OperationHandle            │ handle.await
//!       ▼                                          ▼
//!  ExecutionContext ── tokio Runtime (1 worker thread, "cozmars-worker")
//!       ├── submitted operations (tracked, cancelled on shutdown)
//!       ├── stream reader tasks (one per open StreamEndpoint)
//!       ├── sensor event loop
//!       └── blocking pool (callback executor)
//! ```
//!
//! Every thread started by the runtime records the context id in a
//! thread-local, which is how [`ExecutionContext::running_in_context`]
//! detects re-entrancy.

use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::thread::Thread;
use std::time::{Duration, Instant};

use futures::task::{waker, ArcWake};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};

/// Default time `shutdown()` waits for outstanding operations to unwind.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_CONTEXT: Cell<u64> = const { Cell::new(0) };
}

// ── OperationHandle ──────────────────────────────────────────────────────────

/// Handle to an operation submitted to an [`ExecutionContext`].
///
/// Resolves exactly once: consuming it with [`wait`](Self::wait) or `.await`
/// yields the operation's outcome, or [`Error::ContextClosed`] if the context
/// was shut down before the operation finished.
pub struct OperationHandle<T> {
    rx: Option<oneshot::Receiver<Result<T>>>,
    /// Outcome already observed by `is_resolved`, or supplied at creation.
    ready: Option<Result<T>>,
}

// Neither field is ever pinned structurally.
impl<T> Unpin for OperationHandle<T> {}

impl<T: Send + 'static> OperationHandle<T> {
    fn pending(rx: oneshot::Receiver<Result<T>>) -> Self {
        Self {
            rx: Some(rx),
            ready: None,
        }
    }

    /// A handle that is already resolved with `outcome`.
    pub fn resolved(outcome: Result<T>) -> Self {
        Self {
            rx: None,
            ready: Some(outcome),
        }
    }

    /// Poll without blocking: `true` once the outcome is available.
    pub fn is_resolved(&mut self) -> bool {
        if self.ready.is_some() {
            return true;
        }
        let Some(rx) = self.rx.as_mut() else {
            return true;
        };
        match rx.try_recv() {
            Ok(outcome) => {
                self.ready = Some(outcome);
                self.rx = None;
                true
            }
            Err(oneshot::error::TryRecvError::Empty) => false,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.ready = Some(Err(Error::ContextClosed));
                self.rx = None;
                true
            }
        }
    }

    /// Block the calling thread until the operation resolves.
    ///
    /// With a `timeout`, returns `Ok(None)` when the deadline passes first.
    /// The operation keeps running in the background; only the wait is
    /// abandoned. An outcome that arrived before the context shut down is
    /// still returned afterwards.
    ///
    /// The wait parks the calling thread and needs no runtime. From async
    /// code, `.await` the handle instead of stalling the caller's executor.
    pub fn wait(mut self, timeout: Option<Duration>) -> Result<Option<T>> {
        if self.is_resolved() {
            return match self.ready.take() {
                Some(outcome) => outcome.map(Some),
                None => Err(Error::ContextClosed),
            };
        }
        let Some(mut rx) = self.rx.take() else {
            return Err(Error::ContextClosed);
        };

        let deadline = timeout.and_then(|limit| Instant::now().checked_add(limit));
        // Outside tokio's budget so a caller inside a foreign task cannot spin.
        match block_until(tokio::task::unconstrained(&mut rx), deadline) {
            Some(Ok(outcome)) => outcome.map(Some),
            Some(Err(_)) => Err(Error::ContextClosed),
            None => {
                debug!("Gave up waiting after {:?}; operation left running", timeout);
                Ok(None)
            }
        }
    }
}

/// Wakes the thread parked in [`block_until`].
struct Unpark(Thread);

impl ArcWake for Unpark {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.0.unpark();
    }
}

/// Poll `fut` on the calling thread until it completes or `deadline` passes.
fn block_until<F: Future + Unpin>(mut fut: F, deadline: Option<Instant>) -> Option<F::Output> {
    let unpark = waker(Arc::new(Unpark(std::thread::current())));
    let mut cx = Context::from_waker(&unpark);
    loop {
        if let Poll::Ready(output) = Pin::new(&mut fut).poll(&mut cx) {
            return Some(output);
        }
        match deadline {
            None => std::thread::park(),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return None;
                }
                std::thread::park_timeout(deadline - now);
            }
        }
    }
}

impl<T> Future for OperationHandle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(outcome) = this.ready.take() {
            return Poll::Ready(outcome);
        }
        let Some(rx) = this.rx.as_mut() else {
            return Poll::Ready(Err(Error::ContextClosed));
        };
        match Pin::new(rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => {
                this.rx = None;
                Poll::Ready(outcome)
            }
            Poll::Ready(Err(_)) => {
                this.rx = None;
                Poll::Ready(Err(Error::ContextClosed))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

// ── ExecutionContext ─────────────────────────────────────────────────────────

struct ContextInner {
    id: u64,
    handle: Handle,
    /// Taken exactly once by `shutdown()` (or by drop).
    runtime: Mutex<Option<Runtime>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    shutdown_timeout: Duration,
}

/// Owns the single background worker that runs all network I/O, stream
/// state mutation and callback dispatch for one connected robot.
///
/// Cloning is cheap; all clones refer to the same worker.
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<ContextInner>,
}

impl ExecutionContext {
    /// Start a new worker with the default shutdown timeout.
    pub fn new() -> Result<Self> {
        Self::with_shutdown_timeout(DEFAULT_SHUTDOWN_TIMEOUT)
    }

    /// Start a new worker; `shutdown()` waits at most `shutdown_timeout`
    /// for outstanding operations to unwind.
    pub fn with_shutdown_timeout(shutdown_timeout: Duration) -> Result<Self> {
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("cozmars-worker")
            .enable_all()
            .on_thread_start(move || CURRENT_CONTEXT.with(|c| c.set(id)))
            .on_thread_stop(|| CURRENT_CONTEXT.with(|c| c.set(0)))
            .build()?;
        let handle = runtime.handle().clone();
        debug!("Execution context {} started", id);

        Ok(Self {
            inner: Arc::new(ContextInner {
                id,
                handle,
                runtime: Mutex::new(Some(runtime)),
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
                shutdown_timeout,
            }),
        })
    }

    /// Unique id of this context.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// `true` when the calling thread belongs to this context's runtime.
    pub fn running_in_context(&self) -> bool {
        CURRENT_CONTEXT.with(|c| c.get()) == self.inner.id
    }

    /// `true` until `shutdown()` has been requested.
    pub fn is_alive(&self) -> bool {
        !self.inner.cancel.is_cancelled()
    }

    /// Runtime handle of the worker.
    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    /// Token cancelled when the context shuts down.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Run `op` to completion inside the worker, whichever thread calls this.
    ///
    /// After shutdown the returned handle resolves to
    /// [`Error::ContextClosed`]. Shutdown cancels `op` if it is still
    /// running, which also resolves the handle with `ContextClosed`.
    pub fn submit<F, T>(&self, op: F) -> OperationHandle<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        if !self.is_alive() {
            return OperationHandle::resolved(Err(Error::ContextClosed));
        }
        let (tx, rx) = oneshot::channel();
        let cancel = self.inner.cancel.clone();
        self.inner.tracker.spawn_on(
            async move {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        trace!("Submitted operation cancelled by shutdown");
                        let _ = tx.send(Err(Error::ContextClosed));
                    }
                    outcome = op => {
                        let _ = tx.send(outcome);
                    }
                }
            },
            &self.inner.handle,
        );
        OperationHandle::pending(rx)
    }

    /// Spawn a background task owned by this context.
    ///
    /// The task is dropped at its next suspension point once shutdown starts.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.is_alive() {
            trace!("Context closed, background task dropped");
            return;
        }
        let cancel = self.inner.cancel.clone();
        self.inner.tracker.spawn_on(
            async move {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {}
                    _ = task => {}
                }
            },
            &self.inner.handle,
        );
    }

    /// Spawn a tracked task and keep its join handle. Cancellation is up to
    /// the task (typically via a child of [`cancellation_token`](Self::cancellation_token)).
    pub(crate) fn spawn_joinable<F>(&self, task: F) -> Result<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if !self.is_alive() {
            return Err(Error::ContextClosed);
        }
        Ok(self.inner.tracker.spawn_on(task, &self.inner.handle))
    }

    /// Run a synchronous callback on the blocking pool so it never stalls
    /// the worker. Panics are caught and logged.
    pub fn spawn_callback<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.is_alive() {
            return;
        }
        let join = self.inner.handle.spawn_blocking(callback);
        self.inner.tracker.spawn_on(
            async move {
                if let Err(e) = join.await {
                    if e.is_panic() {
                        error!("Callback panicked: {}", Error::from_panic(e.into_panic()));
                    }
                }
            },
            &self.inner.handle,
        );
    }

    /// Cancel all outstanding operations, wait for them to unwind, and stop
    /// the worker.
    ///
    /// Idempotent. When called from inside the worker (or from any other
    /// async context, where blocking is not allowed) the final teardown is
    /// deferred to a helper thread instead of deadlocking.
    pub fn shutdown(&self) {
        let runtime = match self.inner.runtime.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(runtime) = runtime else {
            trace!("Execution context {} already shut down", self.inner.id);
            return;
        };

        debug!("Shutting down execution context {}", self.inner.id);
        self.inner.cancel.cancel();
        self.inner.tracker.close();

        let tracker = self.inner.tracker.clone();
        let limit = self.inner.shutdown_timeout;
        let id = self.inner.id;
        let teardown = move || {
            let drained = runtime.block_on(async {
                tokio::time::timeout(limit, tracker.wait()).await.is_ok()
            });
            if !drained {
                warn!("Execution context {}: tasks still running after {:?}", id, limit);
            }
            runtime.shutdown_timeout(limit);
            debug!("Execution context {} stopped", id);
        };

        if self.running_in_context() || Handle::try_current().is_ok() {
            let spawned = std::thread::Builder::new()
                .name("cozmars-shutdown".to_string())
                .spawn(teardown);
            if let Err(e) = spawned {
                error!("Failed to spawn shutdown thread: {}", e);
            }
        } else {
            teardown();
        }
    }

    /// Resolves once every task owned by this context has finished after
    /// shutdown was requested.
    pub async fn closed(&self) {
        self.inner.cancel.cancelled().await;
        self.inner.tracker.wait().await;
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        self.cancel.cancel();
        let runtime = match self.runtime.get_mut() {
            Ok(slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(runtime) = runtime {
            // Blocking teardown is not allowed here in general (we may be
            // dropped from async code), so detach the worker.
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.inner.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}
