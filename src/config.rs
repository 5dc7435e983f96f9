//! Application configuration
//!
//! Resolved once at startup: built-in defaults, then an optional TOML file,
//! then environment variables. Endpoints are never hardcoded elsewhere.

use crate::channel::ReconnectPolicy;
use crate::{MadskiError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

pub const ENV_CHATBOT_URL: &str = "MADSKI_CHATBOT_URL";
pub const ENV_CLASSIFIER_URL: &str = "MADSKI_CLASSIFIER_URL";
pub const ENV_CONFIG_PATH: &str = "MADSKI_CONFIG";

const DEFAULT_BASE_URL: &str = "http://localhost:5000";

/// Chat service settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Base URL of the chat service
    pub base_url: String,

    /// Path of the streaming endpoint
    pub path: String,

    /// TCP connect timeout; `None` leaves it to the OS
    pub connect_timeout_ms: Option<u64>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            path: "/chat".to_string(),
            connect_timeout_ms: Some(10_000),
        }
    }
}

impl ChatConfig {
    /// Full URL the request is posted to
    pub fn endpoint(&self) -> String {
        join_url(&self.base_url, &self.path)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }
}

/// Classification service settings (live channel and file upload)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Base URL of the classification service
    pub base_url: String,

    /// Event name for outbound audio frames
    pub frame_event: String,

    /// Event name for inbound classification results
    pub result_event: String,

    /// Path of the one-shot file classification endpoint
    pub predict_path: String,

    /// Reconnect attempts after the first failure
    pub max_reconnect_attempts: u32,

    /// Delay before the first reconnect, doubled per attempt
    pub reconnect_base_delay_ms: u64,

    /// Upper bound on the reconnect delay
    pub reconnect_max_delay_ms: u64,

    /// Samples per outbound frame
    pub frame_samples: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            frame_event: "audio_chunk".to_string(),
            result_event: "prediction".to_string(),
            predict_path: "/predict".to_string(),
            max_reconnect_attempts: 3,
            reconnect_base_delay_ms: 500,
            reconnect_max_delay_ms: 8_000,
            frame_samples: 22_050,
        }
    }
}

impl ChannelConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.max_reconnect_attempts,
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
        }
    }

    pub fn predict_endpoint(&self) -> String {
        join_url(&self.base_url, &self.predict_path)
    }
}

/// Complete application configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub chat: ChatConfig,

    pub channel: ChannelConfig,

    /// Assistant message shown at the top of a fresh transcript
    pub greeting: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            chat: ChatConfig::default(),
            channel: ChannelConfig::default(),
            greeting: Some("Hello! I'm MADSKI's AI assistant. How can I help you today?".to_string()),
        }
    }
}

impl AppConfig {
    /// Parse a TOML configuration file; missing keys keep their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| MadskiError::Config(format!("Failed to read {:?}: {}", path, e)))?;
        let config: AppConfig = toml::from_str(&text)
            .map_err(|e| MadskiError::Config(format!("Invalid config {:?}: {}", path, e)))?;
        debug!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Defaults, then `MADSKI_CONFIG` if set, then URL overrides
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var(ENV_CONFIG_PATH) {
            Ok(path) if !path.is_empty() => Self::load(path)?,
            _ => Self::default(),
        };
        if let Ok(url) = std::env::var(ENV_CHATBOT_URL) {
            config.chat.base_url = url;
        }
        if let Ok(url) = std::env::var(ENV_CLASSIFIER_URL) {
            config.channel.base_url = url;
        }
        config.validate()?;
        Ok(config)
    }

    /// Set the chat service base URL
    pub fn with_chatbot_url(mut self, url: impl Into<String>) -> Self {
        self.chat.base_url = url.into();
        self
    }

    /// Set the classification service base URL
    pub fn with_classifier_url(mut self, url: impl Into<String>) -> Self {
        self.channel.base_url = url.into();
        self
    }

    /// Start transcripts empty
    pub fn without_greeting(mut self) -> Self {
        self.greeting = None;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        check_http_url("chat.base_url", &self.chat.base_url)?;
        check_http_url("channel.base_url", &self.channel.base_url)?;

        if !self.chat.path.starts_with('/') {
            return Err(MadskiError::Config(format!(
                "chat.path must start with '/': {}",
                self.chat.path
            )));
        }
        if self.channel.frame_event.is_empty() || self.channel.result_event.is_empty() {
            return Err(MadskiError::Config("Channel event names must not be empty".to_string()));
        }
        if self.channel.frame_samples == 0 {
            return Err(MadskiError::Config("channel.frame_samples must be positive".to_string()));
        }
        if self.channel.reconnect_base_delay_ms > self.channel.reconnect_max_delay_ms {
            return Err(MadskiError::Config(
                "Reconnect base delay exceeds the maximum delay".to_string(),
            ));
        }

        Ok(())
    }
}

fn check_http_url(field: &str, url: &str) -> Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(MadskiError::Config(format!(
            "{} must be an http(s) URL: {:?}",
            field, url
        )))
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}
