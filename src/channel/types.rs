use crate::{MadskiError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// One classification label with its score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: String,
    pub confidence: f32,
}

impl Prediction {
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            confidence,
        }
    }

    /// Confidence as a whole percentage, for display
    pub fn percent(&self) -> u32 {
        (self.confidence.clamp(0.0, 1.0) * 100.0).round() as u32
    }
}

/// The latest complete set of predictions, best first as sent by the server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    pub predictions: Vec<Prediction>,
}

impl ResultSet {
    pub fn new(predictions: Vec<Prediction>) -> Self {
        Self { predictions }
    }

    pub fn top(&self) -> Option<&Prediction> {
        self.predictions.first()
    }

    pub fn len(&self) -> usize {
        self.predictions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predictions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Prediction> {
        self.predictions.iter()
    }
}

/// Server body: `{ "predictions": [["rock", 0.91], ...] }` or `{ "error": "..." }`
#[derive(Debug, Deserialize)]
struct PredictionEnvelope {
    #[serde(default)]
    predictions: Option<Vec<(String, f64)>>,
    #[serde(default)]
    error: Option<String>,
}

/// Decode a prediction payload shared by the live channel and file upload
pub fn parse_predictions(payload: Value) -> Result<ResultSet> {
    let envelope: PredictionEnvelope = serde_json::from_value(payload)
        .map_err(|e| MadskiError::Protocol(format!("Invalid prediction payload: {}", e)))?;

    if let Some(error) = envelope.error {
        return Err(MadskiError::Server(error));
    }

    let predictions = envelope
        .predictions
        .ok_or_else(|| MadskiError::Protocol("Payload has no predictions".to_string()))?;

    Ok(ResultSet::new(
        predictions
            .into_iter()
            .map(|(label, confidence)| Prediction::new(label, confidence as f32))
            .collect(),
    ))
}

/// Outbound audio frame, serialized as the `audio_chunk` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioFrame {
    pub chunk: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(chunk: Vec<f32>, sample_rate: u32) -> Self {
        Self { chunk, sample_rate }
    }

    pub fn duration_seconds(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.chunk.len() as f32 / self.sample_rate as f32
    }
}

/// Connection state of the push channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    /// Not started, or stopped by `disconnect()`
    Disconnected,
    /// Opening the socket and running the handshake
    Connecting,
    /// Frames are being forwarded
    Connected,
    /// Waiting before reconnect attempt `attempt` (1-based)
    Reconnecting { attempt: u32 },
    /// Retries exhausted; only an explicit `connect()` starts over
    Failed(String),
}

impl ChannelState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ChannelState::Connected)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ChannelState::Failed(_) | ChannelState::Disconnected)
    }
}

/// Notification delivered to listener subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum ListenerEvent {
    /// The connection state moved
    StateChanged(ChannelState),
    /// A new result set replaced the previous one
    Results(Arc<ResultSet>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_predictions() {
        let set = parse_predictions(json!({
            "predictions": [["rock", 0.71], ["metal", 0.2], ["blues", 0.05]]
        }))
        .unwrap();

        assert_eq!(set.len(), 3);
        assert_eq!(set.top().unwrap().label, "rock");
        assert_eq!(set.top().unwrap().percent(), 71);
    }

    #[test]
    fn test_parse_error_body() {
        let result = parse_predictions(json!({ "error": "No file uploaded" }));
        assert_eq!(result, Err(MadskiError::Server("No file uploaded".to_string())));
    }

    #[test]
    fn test_parse_malformed() {
        assert!(matches!(
            parse_predictions(json!({ "predictions": "rock" })),
            Err(MadskiError::Protocol(_))
        ));
        assert!(matches!(parse_predictions(json!({})), Err(MadskiError::Protocol(_))));
    }

    #[test]
    fn test_frame_wire_shape() {
        let frame = AudioFrame::new(vec![0.0, 0.5], 22050);
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value, json!({ "chunk": [0.0, 0.5], "sample_rate": 22050 }));
    }

    #[test]
    fn test_frame_duration() {
        let frame = AudioFrame::new(vec![0.0; 11025], 22050);
        assert!((frame.duration_seconds() - 0.5).abs() < 1e-6);
        assert_eq!(AudioFrame::new(vec![0.0; 4], 0).duration_seconds(), 0.0);
    }
}
