//! In-process [`Transport`] used by the tests and as a robot simulator.
//!
//! Unary calls without a registered handler behave like properties: an
//! empty argument list reads the stored value, a single argument stores it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::transport::{ClientStream, Connector, ServerStream, StreamFeed, Transport};

/// Handler for one unary method.
pub type Handler = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;

const FEED_BUFFER: usize = 64;

#[derive(Default)]
struct State {
    properties: HashMap<String, Value>,
    handlers: HashMap<String, Handler>,
    delays: HashMap<String, Duration>,
    calls: Vec<(String, Value)>,
    feeds: HashMap<String, Vec<StreamFeed>>,
    opened: HashMap<String, Vec<Value>>,
}

/// A robot that lives in memory.
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<State>,
    received: Arc<Mutex<HashMap<String, Vec<Bytes>>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl MemoryTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    // ── Unary ──

    pub fn set_property(&self, name: &str, value: Value) {
        lock(&self.state).properties.insert(name.to_string(), value);
    }

    pub fn property(&self, name: &str) -> Option<Value> {
        lock(&self.state).properties.get(name).cloned()
    }

    /// Answer `method` with `handler` instead of the property store.
    pub fn on_call<F>(&self, method: &str, handler: F)
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        lock(&self.state)
            .handlers
            .insert(method.to_string(), Arc::new(handler));
    }

    /// Delay every answer to `method`, and every open of a stream named
    /// `method`.
    pub fn set_delay(&self, method: &str, delay: Duration) {
        lock(&self.state).delays.insert(method.to_string(), delay);
    }

    /// Every unary call seen so far, in order.
    pub fn calls(&self) -> Vec<(String, Value)> {
        lock(&self.state).calls.clone()
    }

    // ── Server streams ──

    /// Deliver `frame` to every live subscription of `method`. Returns the
    /// number of subscriptions that accepted it.
    pub fn emit(&self, method: &str, frame: impl Into<Bytes>) -> usize {
        let frame = frame.into();
        let mut state = lock(&self.state);
        let Some(feeds) = state.feeds.get_mut(method) else {
            return 0;
        };
        feeds.retain(|f| !f.is_cancelled());
        feeds
            .iter()
            .filter(|f| f.try_send(frame.clone()).is_ok())
            .count()
    }

    /// Deliver a JSON-encoded frame.
    pub fn emit_json(&self, method: &str, value: &Value) -> usize {
        self.emit(method, Bytes::from(value.to_string()))
    }

    /// End every subscription of `method` normally.
    pub fn end(&self, method: &str) {
        if let Some(feeds) = lock(&self.state).feeds.remove(method) {
            debug!("MemoryTransport: ending {} subscription(s) of {}", feeds.len(), method);
        }
    }

    /// Fail every subscription of `method` with `error`.
    pub fn fail(&self, method: &str, error: Error) {
        if let Some(feeds) = lock(&self.state).feeds.remove(method) {
            for feed in feeds {
                let _ = feed.fail(error.clone());
            }
        }
    }

    /// How many times `method` was opened.
    pub fn opened_streams(&self, method: &str) -> usize {
        lock(&self.state).opened.get(method).map_or(0, Vec::len)
    }

    /// Subscriptions of `method` that are still active.
    pub fn live_streams(&self, method: &str) -> usize {
        lock(&self.state)
            .feeds
            .get(method)
            .map_or(0, |feeds| feeds.iter().filter(|f| !f.is_cancelled()).count())
    }

    /// Arguments of every open of `method`, in order.
    pub fn stream_args(&self, method: &str) -> Vec<Value> {
        lock(&self.state)
            .opened
            .get(method)
            .cloned()
            .unwrap_or_default()
    }

    // ── Client streams ──

    /// Frames received on client stream `method`.
    pub fn received(&self, method: &str) -> Vec<Bytes> {
        lock(&self.received)
            .get(method)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn unary_call(&self, method: &str, args: Value) -> Result<Value> {
        let (delay, handler) = {
            let mut state = lock(&self.state);
            state.calls.push((method.to_string(), args.clone()));
            (
                state.delays.get(method).copied(),
                state.handlers.get(method).cloned(),
            )
        };
        trace!("MemoryTransport: {}({})", method, args);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(handler) = handler {
            return handler(args);
        }

        let mut state = lock(&self.state);
        match args {
            Value::Null => Ok(state.properties.get(method).cloned().unwrap_or(Value::Null)),
            Value::Array(mut values) if values.len() <= 1 => match values.pop() {
                None => Ok(state.properties.get(method).cloned().unwrap_or(Value::Null)),
                Some(value) => {
                    state.properties.insert(method.to_string(), value);
                    Ok(Value::Null)
                }
            },
            value => {
                state.properties.insert(method.to_string(), value);
                Ok(Value::Null)
            }
        }
    }

    async fn open_server_stream(&self, method: &str, args: Value) -> Result<ServerStream> {
        let delay = lock(&self.state).delays.get(method).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let (feed, stream) = ServerStream::channel(FEED_BUFFER);
        let mut state = lock(&self.state);
        state
            .opened
            .entry(method.to_string())
            .or_default()
            .push(args);
        state.feeds.entry(method.to_string()).or_default().push(feed);
        debug!("MemoryTransport: opened server stream {}", method);
        Ok(stream)
    }

    async fn open_client_stream(&self, method: &str, args: Value) -> Result<ClientStream> {
        let (stream, mut rx) = ClientStream::channel(FEED_BUFFER);
        lock(&self.state)
            .opened
            .entry(method.to_string())
            .or_default()
            .push(args);
        let received = self.received.clone();
        let method = method.to_string();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                lock(&received).entry(method.clone()).or_default().push(frame);
            }
            trace!("MemoryTransport: client stream {} finished", method);
        });
        Ok(stream)
    }
}

/// Hands out the same in-memory robot for every host.
#[async_trait]
impl Connector for Arc<MemoryTransport> {
    async fn connect(&self, host: &str) -> Result<Arc<dyn Transport>> {
        debug!("MemoryTransport: connected to {}", host);
        Ok(self.clone())
    }
}
