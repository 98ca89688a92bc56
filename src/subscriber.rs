//! Consumer-side buffers attached to a [`StreamMultiplexer`](crate::StreamMultiplexer).
//!
//! A [`Subscriber`] is a bounded FIFO that never blocks its producer: when
//! full, the configured [`OverflowPolicy`] decides which item is lost
//! (drop-oldest by default, favoring freshness for live media). A terminal
//! marker (end-of-stream or an error) is always accepted and, once reached,
//! is returned by every later read.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::stream::{self, Stream};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::context::ExecutionContext;
use crate::error::{Error, Result};
use crate::mode::{Mode, ModeAdapter};

/// What happens when an item arrives at a full buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Evict the oldest buffered item.
    #[default]
    DropOldest,
    /// Discard the incoming item.
    DropNewest,
}

/// Capacity and overflow policy of a subscriber buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferOptions {
    pub capacity: usize,
    pub policy: OverflowPolicy,
}

impl BufferOptions {
    /// Drop-oldest buffer of `capacity` items (at least 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            policy: OverflowPolicy::DropOldest,
        }
    }

    pub fn with_policy(mut self, policy: OverflowPolicy) -> Self {
        self.policy = policy;
        self
    }
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self::new(1)
    }
}

/// End of a subscriber's stream.
#[derive(Debug, Clone)]
pub enum Terminal {
    /// The stream ended normally.
    Eof,
    /// The stream ended with an error.
    Error(Error),
}

// ── SubscriberQueue ──────────────────────────────────────────────────────────

struct QueueState<T> {
    items: VecDeque<T>,
    terminal: Option<Terminal>,
    options: BufferOptions,
    dropped: u64,
}

impl<T> QueueState<T> {
    /// Pop the next outcome without blocking. `None` means "nothing yet".
    fn take(&mut self) -> Option<Result<Option<T>>> {
        if let Some(item) = self.items.pop_front() {
            return Some(Ok(Some(item)));
        }
        match &self.terminal {
            Some(Terminal::Eof) => Some(Ok(None)),
            Some(Terminal::Error(e)) => Some(Err(e.clone())),
            None => None,
        }
    }
}

/// Shared buffer between the dispatching side and one consumer.
pub(crate) struct SubscriberQueue<T> {
    state: Mutex<QueueState<T>>,
    /// Wakes blocking readers.
    readable: Condvar,
    /// Wakes async readers.
    notify: Notify,
}

impl<T> SubscriberQueue<T> {
    pub(crate) fn new(options: BufferOptions) -> Self {
        let options = BufferOptions::new(options.capacity).with_policy(options.policy);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(options.capacity),
                terminal: None,
                options,
                dropped: 0,
            }),
            readable: Condvar::new(),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState<T>>> {
        self.state
            .lock()
            .map_err(|_| Error::Panicked("subscriber buffer lock poisoned".to_string()))
    }

    fn wake(&self) {
        self.readable.notify_all();
        self.notify.notify_waiters();
    }

    /// Enqueue an item. Never blocks; applies the overflow policy when full.
    /// Items pushed after the terminal marker are ignored.
    pub(crate) fn push(&self, item: T) -> Result<()> {
        let mut state = self.lock()?;
        if state.terminal.is_some() {
            return Ok(());
        }
        if state.items.len() >= state.options.capacity {
            state.dropped += 1;
            match state.options.policy {
                OverflowPolicy::DropOldest => {
                    state.items.pop_front();
                }
                OverflowPolicy::DropNewest => {
                    trace!("Subscriber full, incoming item dropped");
                    return Ok(());
                }
            }
        }
        state.items.push_back(item);
        drop(state);
        self.wake();
        Ok(())
    }

    /// Enqueue the terminal marker, evicting the oldest items if the buffer
    /// has no room for it. Only the first terminal marker is kept.
    pub(crate) fn push_terminal(&self, terminal: Terminal) {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.terminal.is_some() {
            return;
        }
        while !state.items.is_empty() && state.items.len() + 1 > state.options.capacity {
            state.items.pop_front();
            state.dropped += 1;
        }
        state.terminal = Some(terminal);
        drop(state);
        self.wake();
    }

    fn try_take(&self) -> Result<Option<Result<Option<T>>>> {
        Ok(self.lock()?.take())
    }

    fn take_blocking(&self, deadline: Option<Instant>) -> Result<Option<T>> {
        let mut state = self.lock()?;
        loop {
            if let Some(outcome) = state.take() {
                return outcome;
            }
            state = match deadline {
                None => self
                    .readable
                    .wait(state)
                    .map_err(|_| Error::Panicked("subscriber buffer lock poisoned".to_string()))?,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout);
                    }
                    self.readable
                        .wait_timeout(state, deadline - now)
                        .map_err(|_| Error::Panicked("subscriber buffer lock poisoned".to_string()))?
                        .0
                }
            };
        }
    }

    async fn take_async(&self) -> Result<Option<T>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(outcome) = self.try_take()? {
                return outcome;
            }
            notified.await;
        }
    }
}

// ── Detach ───────────────────────────────────────────────────────────────────

/// Something a subscriber can unregister from.
pub(crate) trait Detachable: Send + Sync {
    /// Remove subscriber `id`. Resolves to `false` if it was already gone.
    fn detach(self: Arc<Self>, id: u64) -> BoxFuture<'static, Result<bool>>;
}

pub(crate) struct Detach {
    pub(crate) registry: Weak<dyn Detachable>,
    pub(crate) context: ExecutionContext,
}

impl Detach {
    fn removal(&self, id: u64) -> Option<BoxFuture<'static, Result<bool>>> {
        self.registry.upgrade().map(|r| r.detach(id))
    }
}

// ── Subscriber ───────────────────────────────────────────────────────────────

/// A consumer's bounded view of a multiplexed stream.
///
/// Reads block (or suspend, for the async variants) until an item or the
/// terminal marker is available:
///
/// - `Ok(Some(item))`: next item
/// - `Ok(None)`: the stream ended; returned again on every later read
/// - `Err(e)`: the stream failed; returned again on every later read
///
/// Dropping the subscriber unregisters it from its multiplexer.
pub struct Subscriber<T> {
    id: u64,
    queue: Arc<SubscriberQueue<T>>,
    detach: Option<Detach>,
}

impl<T: Send + 'static> Subscriber<T> {
    pub(crate) fn new(id: u64, queue: Arc<SubscriberQueue<T>>, detach: Option<Detach>) -> Self {
        Self { id, queue, detach }
    }

    /// Subscriber id, unique within its multiplexer.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Block until the next item or the terminal marker.
    pub fn read(&self) -> Result<Option<T>> {
        self.blocking(|| self.queue.take_blocking(None))
    }

    /// Like [`read`](Self::read), failing with [`Error::Timeout`] when
    /// nothing arrives within `timeout`.
    pub fn read_timeout(&self, timeout: Duration) -> Result<Option<T>> {
        let deadline = Instant::now() + timeout;
        self.blocking(|| self.queue.take_blocking(Some(deadline)))
    }

    /// Non-blocking read: `None` when nothing is buffered and the stream has
    /// not ended.
    pub fn try_read(&self) -> Option<Result<Option<T>>> {
        match self.queue.try_take() {
            Ok(outcome) => outcome,
            Err(e) => Some(Err(e)),
        }
    }

    /// Suspend until the next item or the terminal marker.
    pub async fn recv(&self) -> Result<Option<T>> {
        self.queue.take_async().await
    }

    /// Blocking iterator over items. Yields a terminal error once, then ends.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            subscriber: self,
            done: false,
        }
    }

    /// Async stream over items. Yields a terminal error once, then ends.
    pub fn into_stream(self) -> impl Stream<Item = Result<T>> + Send
    where
        T: Send,
    {
        stream::unfold(Some(self), |state| async move {
            let subscriber = state?;
            match subscriber.recv().await {
                Ok(Some(item)) => Some((Ok(item), Some(subscriber))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    /// Number of buffered items.
    pub fn len(&self) -> usize {
        self.queue.lock().map(|s| s.items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.queue.lock().map(|s| s.options.capacity).unwrap_or(0)
    }

    /// Items lost to the overflow policy so far.
    pub fn dropped(&self) -> u64 {
        self.queue.lock().map(|s| s.dropped).unwrap_or(0)
    }

    /// `true` once the terminal marker has been enqueued.
    pub fn is_terminated(&self) -> bool {
        self.queue.lock().map(|s| s.terminal.is_some()).unwrap_or(true)
    }

    /// Unregister from the multiplexer and wait for it to settle (closing the
    /// underlying stream if this was the last subscriber).
    ///
    /// Parks the calling thread; from async code use
    /// [`close_async`](Self::close_async).
    pub fn close(mut self) -> Result<()> {
        let Some(detach) = self.detach.take() else {
            return Ok(());
        };
        let Some(removal) = detach.removal(self.id) else {
            return Ok(());
        };
        let adapter = ModeAdapter::new(Mode::Blocking, detach.context.clone());
        settle(adapter.property(removal))
    }

    /// Async counterpart of [`close`](Self::close).
    pub async fn close_async(mut self) -> Result<()> {
        let Some(detach) = self.detach.take() else {
            return Ok(());
        };
        let Some(removal) = detach.removal(self.id) else {
            return Ok(());
        };
        let adapter = ModeAdapter::new(Mode::Native, detach.context.clone());
        settle(adapter.call_async(removal).await)
    }

    fn blocking<R>(&self, f: impl FnOnce() -> R) -> R {
        match &self.detach {
            Some(d) if d.context.running_in_context() => tokio::task::block_in_place(f),
            _ => f(),
        }
    }
}

/// Unregistration tolerates a multiplexer that is already gone.
fn settle(outcome: Result<bool>) -> Result<()> {
    match outcome {
        Ok(_) | Err(Error::ContextClosed) => Ok(()),
        Err(e) => Err(e),
    }
}

impl<T> Drop for Subscriber<T> {
    fn drop(&mut self) {
        let Some(detach) = self.detach.take() else {
            return;
        };
        let Some(removal) = detach.removal(self.id) else {
            return;
        };
        let id = self.id;
        debug!("Subscriber {} dropped, detaching in background", id);
        detach.context.spawn(async move {
            if let Err(e) = removal.await {
                warn!("Detaching subscriber {} failed: {}", id, e);
            }
        });
    }
}

impl<T> fmt::Debug for Subscriber<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber").field("id", &self.id).finish()
    }
}

/// Blocking iterator returned by [`Subscriber::iter`].
pub struct Iter<'a, T> {
    subscriber: &'a Subscriber<T>,
    done: bool,
}

impl<T: Send + 'static> Iterator for Iter<'_, T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.subscriber.read() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl<'a, T: Send + 'static> IntoIterator for &'a Subscriber<T> {
    type Item = Result<T>;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn detached<T: Send + 'static>(options: BufferOptions) -> Subscriber<T> {
        Subscriber::new(1, Arc::new(SubscriberQueue::new(options)), None)
    }

    #[test]
    fn test_drop_oldest_keeps_freshest() {
        let sub = detached::<u32>(BufferOptions::new(3));
        for i in 1..=5 {
            sub.queue.push(i).unwrap();
        }
        assert_eq!(sub.len(), 3);
        assert_eq!(sub.dropped(), 2);
        let got: Vec<u32> = (0..3).map(|_| sub.read().unwrap().unwrap()).collect();
        assert_eq!(got, vec![3, 4, 5]);
    }

    #[test]
    fn test_drop_newest_keeps_oldest() {
        let sub = detached::<u32>(BufferOptions::new(2).with_policy(OverflowPolicy::DropNewest));
        for i in 1..=4 {
            sub.queue.push(i).unwrap();
        }
        assert_eq!(sub.read().unwrap(), Some(1));
        assert_eq!(sub.read().unwrap(), Some(2));
        assert!(sub.try_read().is_none());
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let sub = detached::<u8>(BufferOptions::new(0));
        assert_eq!(sub.capacity(), 1);
    }

    #[test]
    fn test_terminal_is_sticky() {
        let sub = detached::<u32>(BufferOptions::new(4));
        sub.queue.push(1).unwrap();
        sub.queue.push_terminal(Terminal::Error(Error::Remote("camera unplugged".into())));
        sub.queue.push(2).unwrap();

        assert_eq!(sub.read().unwrap(), Some(1));
        for _ in 0..3 {
            assert!(matches!(sub.read(), Err(Error::Remote(_))));
        }
        assert!(sub.is_terminated());
    }

    #[test]
    fn test_terminal_evicts_when_full() {
        let sub = detached::<u32>(BufferOptions::new(2));
        sub.queue.push(1).unwrap();
        sub.queue.push(2).unwrap();
        sub.queue.push_terminal(Terminal::Eof);
        assert_eq!(sub.read().unwrap(), Some(2));
        assert_eq!(sub.read().unwrap(), None);
        assert_eq!(sub.read().unwrap(), None);
    }

    #[test]
    fn test_first_terminal_wins() {
        let sub = detached::<u32>(BufferOptions::new(1));
        sub.queue.push_terminal(Terminal::Eof);
        sub.queue.push_terminal(Terminal::Error(Error::Cancelled));
        assert_eq!(sub.read().unwrap(), None);
    }

    #[test]
    fn test_blocking_read_wakes_on_push() {
        let sub = Arc::new(detached::<u32>(BufferOptions::new(1)));
        let queue = sub.queue.clone();
        let producer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            queue.push(9).unwrap();
        });
        assert_eq!(sub.read().unwrap(), Some(9));
        producer.join().unwrap();
    }

    #[test]
    fn test_read_timeout() {
        let sub = detached::<u32>(BufferOptions::new(1));
        assert!(matches!(sub.read_timeout(Duration::from_millis(20)), Err(Error::Timeout)));
    }

    #[test]
    fn test_iter_stops_after_terminal() {
        let sub = detached::<u32>(BufferOptions::new(4));
        sub.queue.push(1).unwrap();
        sub.queue.push(2).unwrap();
        sub.queue.push_terminal(Terminal::Error(Error::StreamClosed));
        let items: Vec<_> = sub.iter().collect();
        assert_eq!(items.len(), 3);
        assert!(matches!(items[2], Err(Error::StreamClosed)));
    }

    #[tokio::test]
    async fn test_async_recv_and_stream() {
        let sub = detached::<u32>(BufferOptions::new(8));
        let queue = sub.queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            queue.push(1).unwrap();
            queue.push(2).unwrap();
            queue.push_terminal(Terminal::Eof);
        });
        let items: Vec<u32> = sub
            .into_stream()
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(items, vec![1, 2]);
    }

    #[test]
    fn test_close_without_registry_is_noop() {
        let sub = detached::<u32>(BufferOptions::new(1));
        sub.close().unwrap();
    }
}
