//! Conversation session state
//!
//! One request/response cycle at a time: a submitted message adds a user
//! entry and a streaming assistant placeholder, transport events are fed
//! through a [`StreamAssembler`](crate::stream::StreamAssembler) into that
//! placeholder, and the cycle ends as Complete or Failed.

pub mod conversation;

pub use conversation::{
    ConversationSession, CyclePhase, CANCELLED_MARKER, TRANSPORT_ERROR_MARKER,
};
