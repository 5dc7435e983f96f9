//! Seam between the listener and a concrete push channel

use crate::Result;
use async_trait::async_trait;
use serde_json::Value;

/// A named event received from the channel
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub name: String,
    pub payload: Value,
}

impl InboundEvent {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

/// Establishes connections; cloned for every `connect()` of the listener
#[async_trait]
pub trait PushConnector: Clone + Send + 'static {
    async fn connect(&mut self) -> Result<Box<dyn PushConnection>>;
}

/// One open bidirectional channel
#[async_trait]
pub trait PushConnection: Send {
    /// Send a named event without waiting for any acknowledgment
    async fn emit(&mut self, event: &str, payload: Value) -> Result<()>;

    /// Wait for the next application event; `Ok(None)` once the peer closed
    ///
    /// Must be cancel-safe: the listener races it against outbound frames.
    async fn next_event(&mut self) -> Result<Option<InboundEvent>>;

    /// Close politely; errors are not reported
    async fn close(&mut self);
}
