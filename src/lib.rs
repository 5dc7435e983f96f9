pub mod audio;
pub mod channel;
pub mod classify;
pub mod config;
pub mod messages;
pub mod session;
pub mod stream;
pub mod transport;

use thiserror::Error;

/// Errors produced by the madski client
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MadskiError {
    /// The chat request could not be sent or its body could not be read
    #[error("Transport error: {0}")]
    Transport(String),

    /// A frame or packet did not follow the wire format
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server reported an error inside the response stream
    #[error("Server error: {0}")]
    Server(String),

    /// The live push channel failed to connect or dropped
    #[error("Channel error: {0}")]
    Channel(String),

    /// A frame was offered with no channel worker running
    #[error("Channel is not connected")]
    NotConnected,

    /// Input arrived while a cycle is still open
    #[error("A response is already in progress")]
    SessionBusy,

    /// Input was blank after trimming
    #[error("Message is empty")]
    EmptyMessage,

    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Filesystem failure
    #[error("IO error: {0}")]
    Io(String),

    /// Unsupported or corrupt audio data
    #[error("Audio error: {0}")]
    Audio(String),
}

impl From<std::io::Error> for MadskiError {
    fn from(e: std::io::Error) -> Self {
        MadskiError::Io(e.to_string())
    }
}

impl From<reqwest::Error> for MadskiError {
    fn from(e: reqwest::Error) -> Self {
        MadskiError::Transport(e.to_string())
    }
}

impl MadskiError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            // The user resubmits; nothing is retried automatically
            MadskiError::Transport(_) => true,
            MadskiError::Protocol(_) => true,
            MadskiError::Server(_) => true,
            MadskiError::Channel(_) => true,
            MadskiError::NotConnected => true,
            MadskiError::SessionBusy => true,
            MadskiError::EmptyMessage => true,
            MadskiError::Config(_) => false,
            MadskiError::Io(_) => false,
            MadskiError::Audio(_) => false,
        }
    }

    /// Get a user-friendly description
    pub fn user_message(&self) -> String {
        match self {
            MadskiError::Transport(_) => {
                "Unable to reach the assistant. Please try again.".to_string()
            }
            MadskiError::Protocol(_) => "Received a malformed response.".to_string(),
            MadskiError::Server(msg) => format!("The server reported an error: {}", msg),
            MadskiError::Channel(_) => {
                "Live connection failed. Press reconnect to try again.".to_string()
            }
            MadskiError::NotConnected => "Live connection is not open.".to_string(),
            MadskiError::SessionBusy => {
                "Please wait for the current response to finish.".to_string()
            }
            MadskiError::EmptyMessage => "Type a message first.".to_string(),
            MadskiError::Config(_) => {
                "Configuration error. Please check settings.".to_string()
            }
            MadskiError::Io(_) => "File system error occurred.".to_string(),
            MadskiError::Audio(_) => "Could not read the audio file.".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MadskiError>;
