use crate::ensure;
use crate::transport::{CallHandler, EventHandler, Transport, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::trace;

/// An in-process transport.
///
/// Calls and events are delivered inline and in order. It enforces the message size limit like a real
/// broker would, and can redeliver every published event to exercise at-least-once handling.
pub struct MemoryTransport {
    max_message_size: usize,
    targets: DashMap<String, Arc<dyn CallHandler>>,
    subscribers: DashMap<String, Vec<Arc<dyn EventHandler>>>,
    redeliver_events: AtomicBool,
    closed: AtomicBool,
    largest_message: AtomicUsize,
    messages: AtomicUsize,
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("max_message_size", &self.max_message_size)
            .field("targets", &self.targets.len())
            .field("topics", &self.subscribers.len())
            .finish_non_exhaustive()
    }
}

impl MemoryTransport {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            targets: DashMap::new(),
            subscribers: DashMap::new(),
            redeliver_events: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            largest_message: AtomicUsize::new(0),
            messages: AtomicUsize::new(0),
        }
    }

    /// Delivers every published event twice.
    pub fn with_event_redelivery(self) -> Self {
        self.redeliver_events.store(true, Ordering::Relaxed);
        self
    }

    /// Fails every later send with [`TransportError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Largest message seen so far, calls, call responses and events alike
    pub fn largest_message(&self) -> usize {
        self.largest_message.load(Ordering::Relaxed)
    }

    /// Number of messages carried so far
    pub fn messages(&self) -> usize {
        self.messages.load(Ordering::Relaxed)
    }

    fn admit(&self, size: usize) -> Result<(), TransportError> {
        ensure!(!self.closed.load(Ordering::Acquire), TransportError::Closed);
        ensure!(
            size <= self.max_message_size,
            TransportError::MessageTooLarge { size, max_size: self.max_message_size }
        );
        self.messages.fetch_add(1, Ordering::Relaxed);
        self.largest_message.fetch_max(size, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_call(&self, target: &str, method: &str, payload: Bytes) -> Result<Bytes, TransportError> {
        self.admit(payload.len())?;
        // clone out of the map so no shard lock is held across the call
        let handler = self.targets.get(target).map(|h| Arc::clone(h.value())).ok_or_else(|| TransportError::unreachable(target))?;

        trace!(call_target = target, method, len = payload.len(), "deliver call");
        let response = handler.on_call(method, payload).await?;
        self.admit(response.len())?;
        Ok(response)
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        self.admit(payload.len())?;
        let handlers = self.subscribers.get(topic).map(|h| h.value().clone()).unwrap_or_default();
        if handlers.is_empty() {
            trace!(topic, "no subscriber, event dropped");
            return Ok(());
        }

        let deliveries = if self.redeliver_events.load(Ordering::Relaxed) { 2 } else { 1 };
        for _ in 0..deliveries {
            for handler in &handlers {
                handler.on_event(topic, payload.clone()).await;
            }
        }
        Ok(())
    }

    fn on_call_received(&self, target: &str, handler: Arc<dyn CallHandler>) {
        self.targets.insert(target.to_string(), handler);
    }

    fn subscribe(&self, topic: &str, handler: Arc<dyn EventHandler>) {
        self.subscribers.entry(topic.to_string()).or_default().push(handler);
    }

    fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}
