//! The message transport the tunnel runs over.
//!
//! The tunnel only needs call/response and fire-and-forget publish primitives with an upper bound on
//! the size of one message. Delivery is assumed at-least-once per message and in order per sender.

mod memory;

pub use memory::MemoryTransport;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("target {target} is unreachable")]
    Unreachable { target: String },

    #[error("message of {size} bytes exceeds the transport limit of {max_size}")]
    MessageTooLarge { size: usize, max_size: usize },

    #[error("transport is closed")]
    Closed,

    #[error("remote failure: {reason}")]
    Remote { reason: String },
}

impl TransportError {
    pub fn unreachable<S: ToString>(target: S) -> Self {
        Self::Unreachable { target: target.to_string() }
    }

    pub fn remote<S: ToString>(str: S) -> Self {
        Self::Remote { reason: str.to_string() }
    }
}

/// Receives inbound calls addressed to a target.
#[async_trait]
pub trait CallHandler: Send + Sync {
    async fn on_call(&self, method: &str, payload: Bytes) -> Result<Bytes, TransportError>;
}

/// Receives events published to a topic.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_event(&self, topic: &str, payload: Bytes);
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one call to `target` and returns its response.
    async fn send_call(&self, target: &str, method: &str, payload: Bytes) -> Result<Bytes, TransportError>;

    /// Publishes one event, no response is expected.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError>;

    /// Routes calls addressed to `target` to `handler`.
    fn on_call_received(&self, target: &str, handler: Arc<dyn CallHandler>);

    /// Routes events published on `topic` to `handler`.
    fn subscribe(&self, topic: &str, handler: Arc<dyn EventHandler>);

    /// Largest payload of one message
    fn max_message_size(&self) -> usize;
}
