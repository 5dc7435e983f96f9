//! Request/response transport for the chat session
//!
//! The session never performs I/O itself. It opens requests through a
//! [`ChatTransport`] and receives the response body back as
//! [`TransportEvent`]s on a channel, one `(chunk, is_final)` pair at a time.

pub mod http;

use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use http::{response_chunks, ChatClient, ChatClientHandle};

/// Identifies one request/response cycle within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CycleId(pub u64);

impl fmt::Display for CycleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cycle-{}", self.0)
    }
}

/// Outbound request body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Commands accepted by a transport worker
#[derive(Debug, Clone)]
pub enum TransportCommand {
    /// Start a request and stream its body back
    Open {
        /// Cycle the response events are tagged with
        cycle: CycleId,
        /// Body sent to the chat endpoint
        request: ChatRequest,
    },

    /// Stop reading the response of this cycle
    Cancel(CycleId),

    /// Stop the worker
    Shutdown,
}

/// Events produced by a transport read loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A piece of response text; `is_final` marks end of stream
    Chunk {
        /// Cycle this chunk belongs to
        cycle: CycleId,
        /// Decoded body text, possibly empty
        text: String,
        /// The body has been read to the end
        is_final: bool,
    },

    /// Connection refused, non-success status or mid-stream drop
    Failed {
        /// Cycle whose request failed
        cycle: CycleId,
        /// Human-readable cause
        error: String,
    },
}

impl TransportEvent {
    pub fn cycle(&self) -> CycleId {
        match self {
            TransportEvent::Chunk { cycle, .. } => *cycle,
            TransportEvent::Failed { cycle, .. } => *cycle,
        }
    }
}

/// Outbound side of a chat transport
pub trait ChatTransport: Send {
    /// Begin streaming the response for `cycle`
    fn open(&self, cycle: CycleId, request: ChatRequest) -> Result<()>;

    /// Release the reader of `cycle`; no-op if it already finished
    fn cancel(&self, cycle: CycleId);
}
