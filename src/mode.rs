//! Calling conventions for remote operations.
//!
//! A component method is written once, as an async operation. The
//! [`ModeAdapter`] decides per call how the caller receives the result:
//!
//! - inside the worker: the operation runs in place (no indirection, no
//!   self-deadlock)
//! - [`Mode::Blocking`] (or a forced-synchronous call): submit and wait,
//!   optionally bounded by a timeout that yields [`Reply::NoAnswer`]
//! - [`Mode::Deferred`]: submit and hand back a [`Reply::Pending`] handle
//!
//! [`Call`] packages an operation with its adapter so the call site chooses
//! between `.await`, `.invoke()` and `.wait()`.

use std::fmt;
use std::future::{Future, IntoFuture};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tracing::{trace, warn};

use crate::context::{ExecutionContext, OperationHandle};
use crate::error::{Error, Result};

/// Execution policy of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Caller cooperates with the worker's scheduler (async/await).
    Native,
    /// Caller wants a synchronous result.
    #[default]
    Blocking,
    /// Caller wants a handle resolved later.
    Deferred,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Native => write!(f, "native"),
            Mode::Blocking => write!(f, "blocking"),
            Mode::Deferred => write!(f, "deferred"),
        }
    }
}

/// Per-call options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallOpts {
    /// Resolve synchronously even under [`Mode::Deferred`].
    pub force_sync: bool,
    /// Bound on a synchronous wait. `None` falls back to the adapter default.
    pub timeout: Option<Duration>,
    /// Ignore every deadline (property accessors).
    pub no_deadline: bool,
}

impl CallOpts {
    /// Options that follow the connection's mode.
    pub fn new() -> Self {
        Self::default()
    }

    /// Always resolve before returning.
    pub fn sync() -> Self {
        Self {
            force_sync: true,
            ..Self::default()
        }
    }

    /// Property-style access: synchronous and never abandoned.
    pub fn property() -> Self {
        Self {
            force_sync: true,
            timeout: None,
            no_deadline: true,
        }
    }

    /// Bound the synchronous wait.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// What a synchronous-facing call hands back.
pub enum Reply<T> {
    /// The operation finished with this value.
    Ready(T),
    /// The caller's deadline passed; the operation is still running.
    NoAnswer,
    /// Deferred mode: resolve later by polling, waiting or awaiting.
    Pending(OperationHandle<T>),
}

impl<T: Send + 'static> Reply<T> {
    /// The value if the call already finished.
    pub fn ready(self) -> Option<T> {
        match self {
            Reply::Ready(v) => Some(v),
            _ => None,
        }
    }

    /// `true` for [`Reply::NoAnswer`].
    pub fn is_no_answer(&self) -> bool {
        matches!(self, Reply::NoAnswer)
    }

    /// `true` for [`Reply::Pending`].
    pub fn is_pending(&self) -> bool {
        matches!(self, Reply::Pending(_))
    }

    /// The pending handle, if any.
    pub fn into_handle(self) -> Option<OperationHandle<T>> {
        match self {
            Reply::Pending(h) => Some(h),
            _ => None,
        }
    }

    /// Block until a final answer is available. `Ok(None)` means the
    /// caller's deadline had already passed.
    pub fn resolve(self) -> Result<Option<T>> {
        match self {
            Reply::Ready(v) => Ok(Some(v)),
            Reply::NoAnswer => Ok(None),
            Reply::Pending(h) => h.wait(None),
        }
    }
}

impl<T> fmt::Debug for Reply<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Ready(_) => write!(f, "Reply::Ready(..)"),
            Reply::NoAnswer => write!(f, "Reply::NoAnswer"),
            Reply::Pending(_) => write!(f, "Reply::Pending(..)"),
        }
    }
}

// ── ModeAdapter ──────────────────────────────────────────────────────────────

/// Resolves operations against a [`Mode`] and an [`ExecutionContext`].
#[derive(Clone, Debug)]
pub struct ModeAdapter {
    mode: Mode,
    context: ExecutionContext,
    default_timeout: Option<Duration>,
}

impl ModeAdapter {
    pub fn new(mode: Mode, context: ExecutionContext) -> Self {
        Self {
            mode,
            context,
            default_timeout: None,
        }
    }

    /// Deadline applied to synchronous waits that don't set their own.
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Synchronous entry point.
    ///
    /// Inside the worker the operation runs in place. Otherwise it is
    /// submitted; under `Blocking` (or `force_sync`) the caller waits, under
    /// `Deferred` it gets the pending handle. `Native` connections that call
    /// this from a foreign thread get blocking semantics, since there is no
    /// scheduler to cooperate with.
    pub fn call<F, T>(&self, opts: CallOpts, op: F) -> Result<Reply<T>>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        if self.context.running_in_context() {
            trace!("call: already inside context {}, running in place", self.context.id());
            return run_in_place(op).map(Reply::Ready);
        }

        let handle = self.context.submit(op);
        if self.mode == Mode::Deferred && !opts.force_sync {
            return Ok(Reply::Pending(handle));
        }

        let deadline = if opts.no_deadline {
            None
        } else {
            opts.timeout.or(self.default_timeout)
        };
        match handle.wait(deadline)? {
            Some(v) => Ok(Reply::Ready(v)),
            None => {
                warn!("No answer within {:?}; operation still running", deadline);
                Ok(Reply::NoAnswer)
            }
        }
    }

    /// Synchronous property access: always resolves, never times out.
    pub fn property<F, T>(&self, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        match self.call(CallOpts::property(), op)? {
            Reply::Ready(v) => Ok(v),
            Reply::Pending(h) => h.wait(None)?.ok_or(Error::Timeout),
            Reply::NoAnswer => Err(Error::Timeout),
        }
    }

    /// Native entry point: await the operation, running it inside the worker.
    pub async fn call_async<F, T>(&self, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        if self.context.running_in_context() {
            op.await
        } else {
            self.context.submit(op).await
        }
    }
}

/// Drive `op` to completion on the current runtime thread without letting
/// the worker starve.
fn run_in_place<F, T>(op: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let handle = Handle::try_current().map_err(|_| Error::ContextClosed)?;
    tokio::task::block_in_place(move || handle.block_on(op))
}

// ── Call ─────────────────────────────────────────────────────────────────────

/// A lazily evaluated remote operation bound to a [`ModeAdapter`].
///
/// Nothing happens until the caller picks a convention:
///
/// - `call.await`: native async
/// - `call.invoke()`: the connection's mode, returns a [`Reply`]
/// - `call.wait()`: synchronous, no deadline
#[must_use = "a Call does nothing until awaited, invoked or waited"]
pub struct Call<T> {
    adapter: ModeAdapter,
    opts: CallOpts,
    op: BoxFuture<'static, Result<T>>,
}

impl<T: Send + 'static> Call<T> {
    /// An ordinary (possibly long-running) command.
    pub fn new<F>(adapter: &ModeAdapter, op: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            adapter: adapter.clone(),
            opts: CallOpts::new(),
            op: Box::pin(op),
        }
    }

    /// A command that always resolves before returning (idempotent setters,
    /// configuration).
    pub fn sync_command<F>(adapter: &ModeAdapter, op: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Self::new(adapter, op).sync()
    }

    /// A property getter or setter: synchronous, no deadline.
    pub fn property<F>(adapter: &ModeAdapter, op: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let mut call = Self::new(adapter, op);
        call.opts = CallOpts::property();
        call
    }

    /// Force synchronous resolution.
    pub fn sync(mut self) -> Self {
        self.opts.force_sync = true;
        self
    }

    /// Bound the synchronous wait; expiry yields [`Reply::NoAnswer`].
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.opts.timeout = Some(timeout);
        self
    }

    /// Options this call will be resolved with.
    pub fn opts(&self) -> CallOpts {
        self.opts
    }

    /// Resolve according to the connection's mode.
    pub fn invoke(self) -> Result<Reply<T>> {
        self.adapter.call(self.opts, self.op)
    }

    /// Resolve synchronously regardless of mode, with no deadline.
    ///
    /// Outside the worker this parks the calling thread. It does not panic
    /// when called from async code, but it stalls that executor until the
    /// worker answers; `.await` the call there instead.
    pub fn wait(self) -> Result<T> {
        self.adapter.property(self.op)
    }
}

impl<T: Send + 'static> IntoFuture for Call<T> {
    type Output = Result<T>;
    type IntoFuture = BoxFuture<'static, Result<T>>;

    fn into_future(self) -> Self::IntoFuture {
        let adapter = self.adapter;
        let op = self.op;
        Box::pin(async move { adapter.call_async(op).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn adapter(mode: Mode) -> ModeAdapter {
        ModeAdapter::new(mode, ExecutionContext::new().unwrap())
    }

    #[test]
    fn test_blocking_call_returns_ready() {
        let a = adapter(Mode::Blocking);
        let reply = a.call(CallOpts::new(), async { Ok(5) }).unwrap();
        assert_eq!(reply.ready(), Some(5));
        a.context().shutdown();
    }

    #[test]
    fn test_deferred_call_returns_pending() {
        let a = adapter(Mode::Deferred);
        let reply = a.call(CallOpts::new(), async { Ok("later") }).unwrap();
        assert!(reply.is_pending());
        assert_eq!(reply.resolve().unwrap(), Some("later"));
        a.context().shutdown();
    }

    #[test]
    fn test_deferred_forced_sync_resolves() {
        let a = adapter(Mode::Deferred);
        let reply = a.call(CallOpts::sync(), async { Ok(1) }).unwrap();
        assert_eq!(reply.ready(), Some(1));
        a.context().shutdown();
    }

    #[test]
    fn test_blocking_timeout_yields_no_answer() {
        let a = adapter(Mode::Blocking);
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let reply = a
            .call(CallOpts::new().with_timeout(Duration::from_millis(10)), async move {
                tokio::time::sleep(Duration::from_millis(80)).await;
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        assert!(reply.is_no_answer());

        // The side effect still lands.
        std::thread::sleep(Duration::from_millis(250));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        a.context().shutdown();
    }

    #[test]
    fn test_errors_are_not_swallowed_by_timeout_path() {
        let a = adapter(Mode::Blocking);
        let outcome = a.call(CallOpts::new().with_timeout(Duration::from_secs(1)), async {
            Err::<(), _>(Error::Remote("denied".into()))
        });
        assert!(matches!(outcome, Err(Error::Remote(_))));
        a.context().shutdown();
    }

    #[test]
    fn test_blocking_call_inside_worker_runs_in_place() {
        let a = adapter(Mode::Blocking);
        let nested = a.clone();
        // A blocking call issued from inside the worker must not hang.
        let reply = a
            .call(CallOpts::new().with_timeout(Duration::from_secs(2)), async move {
                let inner = nested.call(CallOpts::new(), async { Ok(21) })?;
                Ok(inner.ready().unwrap_or(0) * 2)
            })
            .unwrap();
        assert_eq!(reply.ready(), Some(42));
        a.context().shutdown();
    }

    #[test]
    fn test_call_wait_and_invoke() {
        let a = adapter(Mode::Deferred);
        let v = Call::property(&a, async { Ok(3) }).wait().unwrap();
        assert_eq!(v, 3);
        let reply = Call::new(&a, async { Ok(4) }).invoke().unwrap();
        assert!(reply.is_pending());
        assert_eq!(reply.resolve().unwrap(), Some(4));
        let reply = Call::sync_command(&a, async { Ok(5) }).invoke().unwrap();
        assert_eq!(reply.ready(), Some(5));
        a.context().shutdown();
    }

    #[tokio::test]
    async fn test_call_is_awaitable() {
        let a = adapter(Mode::Native);
        let probe = a.context().clone();
        let inside = Call::new(&a, async move { Ok(probe.running_in_context()) })
            .await
            .unwrap();
        assert!(inside);
        a.context().shutdown();
    }

    #[tokio::test]
    async fn test_call_wait_from_async_code_does_not_panic() {
        let a = adapter(Mode::Blocking);
        let v = Call::property(&a, async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(8)
        })
        .wait()
        .unwrap();
        assert_eq!(v, 8);
        let reply = Call::new(&a, async { Ok(9) })
            .timeout(Duration::from_secs(1))
            .invoke()
            .unwrap();
        assert_eq!(reply.ready(), Some(9));
        a.context().shutdown();
    }

    #[test]
    fn test_mode_serde_names() {
        let m: Mode = serde_json::from_str("\"deferred\"").unwrap();
        assert_eq!(m, Mode::Deferred);
        assert_eq!(serde_json::to_string(&Mode::Native).unwrap(), "\"native\"");
        assert_eq!(Mode::Blocking.to_string(), "blocking");
    }
}
