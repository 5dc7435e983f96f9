//! One-shot genre classification of an audio file

use crate::channel::{parse_predictions, ResultSet};
use crate::config::ChannelConfig;
use crate::{MadskiError, Result};
use reqwest::multipart::{Form, Part};
use serde_json::Value;
use std::path::Path;
use tracing::{debug, info};

/// Uploads files to the classifier's `/predict` endpoint
#[derive(Debug, Clone)]
pub struct ClassifierClient {
    client: reqwest::Client,
    endpoint: String,
}

impl ClassifierClient {
    pub fn new(config: &ChannelConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config.predict_endpoint(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn classify_file(&self, path: impl AsRef<Path>) -> Result<ResultSet> {
        let path = path.as_ref();
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| MadskiError::Io(format!("Failed to read {}: {}", path.display(), e)))?;

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio".to_string());

        debug!("Uploading {} ({} bytes) to {}", file_name, data.len(), self.endpoint);
        let form = Form::new().part("file", Part::bytes(data).file_name(file_name));

        let response = self
            .client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| MadskiError::Transport(format!("Request to {} failed: {}", self.endpoint, e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| MadskiError::Transport(format!("Failed to read response: {}", e)))?;

        let results = interpret_response(status, &body)?;
        info!("Classified {} into {} labels", path.display(), results.len());
        Ok(results)
    }
}

/// Map a `/predict` response to a result set
///
/// An `error` field wins regardless of status; a failed status without a
/// readable body is a transport failure.
pub fn interpret_response(status: reqwest::StatusCode, body: &str) -> Result<ResultSet> {
    match serde_json::from_str::<Value>(body) {
        Ok(payload) => match parse_predictions(payload) {
            Err(MadskiError::Protocol(_)) if !status.is_success() => {
                Err(MadskiError::Transport(format!("HTTP {}", status)))
            }
            other => other,
        },
        Err(_) if !status.is_success() => Err(MadskiError::Transport(format!("HTTP {}", status))),
        Err(e) => Err(MadskiError::Protocol(format!("Invalid response body: {}", e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_success_body() {
        let results = interpret_response(
            StatusCode::OK,
            r#"{"predictions": [["classical", 0.93], ["jazz", 0.04]]}"#,
        )
        .unwrap();
        assert_eq!(results.top().unwrap().label, "classical");
    }

    #[test]
    fn test_error_body_with_failure_status() {
        let result = interpret_response(StatusCode::BAD_REQUEST, r#"{"error": "No file uploaded"}"#);
        assert_eq!(result, Err(MadskiError::Server("No file uploaded".to_string())));
    }

    #[test]
    fn test_failure_status_without_body() {
        let result = interpret_response(StatusCode::BAD_GATEWAY, "<html>bad gateway</html>");
        assert!(matches!(result, Err(MadskiError::Transport(_))));
    }

    #[test]
    fn test_garbage_success_body() {
        assert!(matches!(
            interpret_response(StatusCode::OK, "not json"),
            Err(MadskiError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_file() {
        let client = ClassifierClient::new(&ChannelConfig::default());
        let result = client.classify_file("/nonexistent/song.wav").await;
        assert!(matches!(result, Err(MadskiError::Io(_))));
    }
}
