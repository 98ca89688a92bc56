//! Fan-out of one remote stream to any number of [`Subscriber`]s.
//!
//! The multiplexer reference-counts its [`StreamEndpoint`]: the first
//! subscriber opens it (before it can receive anything), the last one to
//! leave closes it (after it can no longer receive anything). Structural
//! changes are serialized by an async lock and always run on the worker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures::future::BoxFuture;
use tracing::{debug, trace, warn};

use crate::context::ExecutionContext;
use crate::endpoint::{Dispatch, StreamEndpoint, StreamSource};
use crate::error::{Error, Result};
use crate::mode::{Call, ModeAdapter};
use crate::subscriber::{BufferOptions, Detach, Detachable, Subscriber, SubscriberQueue, Terminal};
use crate::transport::Transport;

// ── SubscriberSet ────────────────────────────────────────────────────────────

type Entry<T> = (u64, Arc<SubscriberQueue<T>>);

/// The current subscribers, fed by the endpoint's reader.
pub(crate) struct SubscriberSet<T> {
    entries: Mutex<Vec<Entry<T>>>,
}

impl<T> SubscriberSet<T> {
    fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, Vec<Entry<T>>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn snapshot(&self) -> Vec<Entry<T>> {
        self.entries().clone()
    }

    fn insert(&self, id: u64, queue: Arc<SubscriberQueue<T>>) {
        self.entries().push((id, queue));
    }

    fn remove(&self, id: u64) -> bool {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|(i, _)| *i != id);
        entries.len() != before
    }

    fn len(&self) -> usize {
        self.entries().len()
    }

    fn drain(&self) -> Vec<Entry<T>> {
        std::mem::take(&mut *self.entries())
    }
}

impl<T: Clone + Send + Sync + 'static> Dispatch<T> for SubscriberSet<T> {
    fn dispatch(&self, item: T) {
        let mut failed = Vec::new();
        for (id, queue) in self.snapshot() {
            if let Err(e) = queue.push(item.clone()) {
                warn!("Subscriber {} failed, detaching it: {}", id, e);
                queue.push_terminal(Terminal::Error(e));
                failed.push(id);
            }
        }
        for id in failed {
            self.remove(id);
        }
    }

    fn terminate(&self, terminal: Terminal) {
        for (_, queue) in self.snapshot() {
            queue.push_terminal(terminal.clone());
        }
    }
}

// ── StreamMultiplexer ────────────────────────────────────────────────────────

struct Shared<S: StreamSource> {
    endpoint: StreamEndpoint<S>,
    subscribers: Arc<SubscriberSet<S::Item>>,
    /// Serializes add/remove/shutdown together with the endpoint transitions
    /// they trigger.
    structure: tokio::sync::Mutex<()>,
    adapter: ModeAdapter,
    next_id: AtomicU64,
}

impl<S: StreamSource> Shared<S> {
    async fn add(self: Arc<Self>, options: BufferOptions) -> Result<Subscriber<S::Item>> {
        let method = self.endpoint.source()?.method();
        let _guard = self.structure.lock().await;
        if self.subscribers.len() == 0 || self.endpoint.is_closed() {
            self.endpoint.open().await?;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue::new(options));
        self.subscribers.insert(id, queue.clone());
        debug!(
            "Subscriber {} attached to {} ({} total)",
            id,
            method,
            self.subscribers.len()
        );

        let weak: Weak<Self> = Arc::downgrade(&self);
        let registry: Weak<dyn Detachable> = weak;
        let detach = Detach {
            registry,
            context: self.adapter.context().clone(),
        };
        Ok(Subscriber::new(id, queue, Some(detach)))
    }

    async fn remove(&self, id: u64) -> Result<bool> {
        let _guard = self.structure.lock().await;
        let removed = self.subscribers.remove(id);
        if removed {
            debug!("Subscriber {} detached ({} left)", id, self.subscribers.len());
        } else {
            trace!("Subscriber {} already detached", id);
        }
        // Also covers subscribers that dropped out of the set on their own.
        if self.subscribers.len() == 0 && !self.endpoint.is_closed() {
            self.endpoint.close().await?;
        }
        Ok(removed)
    }

    async fn shutdown(&self) -> Result<()> {
        let _guard = self.structure.lock().await;
        for (_, queue) in self.subscribers.drain() {
            queue.push_terminal(Terminal::Error(Error::StreamClosed));
        }
        self.endpoint.close().await
    }
}

impl<S: StreamSource> Detachable for Shared<S> {
    fn detach(self: Arc<Self>, id: u64) -> BoxFuture<'static, Result<bool>> {
        Box::pin(async move { self.remove(id).await })
    }
}

/// Reference-counted fan-out of a single [`StreamEndpoint`].
pub struct StreamMultiplexer<S: StreamSource> {
    shared: Arc<Shared<S>>,
}

impl<S: StreamSource> Clone for StreamMultiplexer<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<S: StreamSource> StreamMultiplexer<S> {
    pub fn new(source: S, transport: Arc<dyn Transport>, adapter: ModeAdapter) -> Self {
        let subscribers = Arc::new(SubscriberSet::new());
        let endpoint = StreamEndpoint::new(
            source,
            transport,
            adapter.context().clone(),
            subscribers.clone(),
        );
        Self {
            shared: Arc::new(Shared {
                endpoint,
                subscribers,
                structure: tokio::sync::Mutex::new(()),
                adapter,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn context(&self) -> &ExecutionContext {
        self.shared.adapter.context()
    }

    /// The endpoint this multiplexer feeds from.
    pub fn endpoint(&self) -> &StreamEndpoint<S> {
        &self.shared.endpoint
    }

    /// `true` when the underlying stream is not open.
    pub fn is_closed(&self) -> bool {
        self.shared.endpoint.is_closed()
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.len()
    }

    /// Attach a new subscriber, opening the stream if it is the first.
    pub async fn add_subscriber(&self, options: BufferOptions) -> Result<Subscriber<S::Item>> {
        let shared = self.shared.clone();
        self.shared
            .adapter
            .call_async(async move { shared.add(options).await })
            .await
    }

    /// Detach subscriber `id`, closing the stream if it was the last.
    /// Returns `false` if it was already detached.
    pub async fn remove_subscriber(&self, id: u64) -> Result<bool> {
        let shared = self.shared.clone();
        self.shared
            .adapter
            .call_async(async move { shared.remove(id).await })
            .await
    }

    /// A drop-oldest subscriber holding up to `capacity` items.
    pub fn get_buffer(&self, capacity: usize) -> Call<Subscriber<S::Item>> {
        self.subscribe(BufferOptions::new(capacity))
    }

    /// A subscriber with explicit buffer options.
    pub fn subscribe(&self, options: BufferOptions) -> Call<Subscriber<S::Item>> {
        let shared = self.shared.clone();
        Call::property(&self.shared.adapter, async move { shared.add(options).await })
    }

    /// Terminate every subscriber with [`Error::StreamClosed`] and close the
    /// stream.
    pub async fn shutdown(&self) -> Result<()> {
        let shared = self.shared.clone();
        self.shared
            .adapter
            .call_async(async move { shared.shutdown().await })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::StreamRequest;
    use crate::memory::MemoryTransport;
    use crate::mode::Mode;
    use bytes::Bytes;
    use std::time::Duration;

    #[derive(Clone)]
    struct Numbers;

    impl StreamRequest for Numbers {
        fn method(&self) -> &'static str {
            "numbers"
        }
    }

    impl StreamSource for Numbers {
        type Item = u32;

        fn decode(&self, frame: Bytes) -> Result<u32> {
            std::str::from_utf8(&frame)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| Error::Protocol("not a number".into()))
        }
    }

    fn multiplexer(transport: &Arc<MemoryTransport>) -> StreamMultiplexer<Numbers> {
        let adapter = ModeAdapter::new(Mode::Blocking, ExecutionContext::new().unwrap());
        StreamMultiplexer::new(Numbers, transport.clone(), adapter)
    }

    fn emit_all(transport: &MemoryTransport, values: &[u32]) {
        for v in values {
            transport.emit("numbers", v.to_string());
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    #[test]
    fn test_refcounted_open_and_close() {
        let transport = MemoryTransport::new();
        let mux = multiplexer(&transport);
        assert!(mux.is_closed());

        let a = mux.get_buffer(4).wait().unwrap();
        let b = mux.get_buffer(4).wait().unwrap();
        assert_eq!(transport.opened_streams("numbers"), 1);
        assert_eq!(mux.subscriber_count(), 2);

        a.close().unwrap();
        assert!(!mux.is_closed());
        assert_eq!(transport.live_streams("numbers"), 1);

        b.close().unwrap();
        assert!(mux.is_closed());
        assert_eq!(transport.live_streams("numbers"), 0);
        assert_eq!(transport.opened_streams("numbers"), 1);
        mux.context().shutdown();
    }

    #[test]
    fn test_fan_out_preserves_order() {
        let transport = MemoryTransport::new();
        let mux = multiplexer(&transport);
        let subs: Vec<_> = (0..3).map(|_| mux.get_buffer(8).wait().unwrap()).collect();
        emit_all(&transport, &[1, 2, 3]);

        for sub in &subs {
            let got: Vec<u32> = (0..3).map(|_| sub.read().unwrap().unwrap()).collect();
            assert_eq!(got, vec![1, 2, 3]);
            assert!(sub.try_read().is_none());
        }
        mux.context().shutdown();
    }

    #[test]
    fn test_slow_subscriber_does_not_block_others() {
        let transport = MemoryTransport::new();
        let mux = multiplexer(&transport);
        let slow = mux.get_buffer(2).wait().unwrap();
        let fast = mux.get_buffer(16).wait().unwrap();
        emit_all(&transport, &[1, 2, 3, 4, 5]);

        assert_eq!(fast.len(), 5);
        assert_eq!(slow.read().unwrap(), Some(4));
        assert_eq!(slow.read().unwrap(), Some(5));
        mux.context().shutdown();
    }

    #[test]
    fn test_dropping_subscriber_detaches() {
        let transport = MemoryTransport::new();
        let mux = multiplexer(&transport);
        let sub = mux.get_buffer(1).wait().unwrap();
        drop(sub);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(mux.subscriber_count(), 0);
        assert!(mux.is_closed());
        mux.context().shutdown();
    }

    #[test]
    fn test_remove_unknown_subscriber_is_tolerated() {
        let transport = MemoryTransport::new();
        let mux = multiplexer(&transport);
        let removed = mux
            .context()
            .submit({
                let mux = mux.clone();
                async move { mux.remove_subscriber(99).await }
            })
            .wait(None)
            .unwrap();
        assert_eq!(removed, Some(false));
        mux.context().shutdown();
    }

    #[test]
    fn test_shutdown_terminates_subscribers() {
        let transport = MemoryTransport::new();
        let mux = multiplexer(&transport);
        let sub = mux.get_buffer(2).wait().unwrap();
        let m = mux.clone();
        mux.context().submit(async move { m.shutdown().await }).wait(None).unwrap();

        assert!(matches!(sub.read(), Err(Error::StreamClosed)));
        assert!(mux.is_closed());
        assert_eq!(mux.subscriber_count(), 0);
        mux.context().shutdown();
    }

    #[tokio::test]
    async fn test_blocking_close_from_async_code() {
        let transport = MemoryTransport::new();
        let mux = multiplexer(&transport);
        let sub = mux.get_buffer(2).wait().unwrap();
        sub.close().unwrap();
        assert!(mux.is_closed());
        assert_eq!(mux.subscriber_count(), 0);
        mux.context().shutdown();
    }

    #[tokio::test]
    async fn test_native_subscribe_and_recv() {
        let transport = MemoryTransport::new();
        let adapter = ModeAdapter::new(Mode::Native, ExecutionContext::new().unwrap());
        let mux = StreamMultiplexer::new(Numbers, transport.clone(), adapter);

        let sub = mux.get_buffer(4).await.unwrap();
        transport.emit("numbers", "7");
        assert_eq!(sub.recv().await.unwrap(), Some(7));
        sub.close_async().await.unwrap();
        assert!(mux.is_closed());
        mux.context().shutdown();
    }
}
