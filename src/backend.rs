//! Conversational backend client
//!
//! One HTTP POST per finalized utterance: `{"user_query": ...}` in,
//! `{"text": ..., "audio_base64"?: ...}` out.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::config::BackendConfig;
use crate::voice::AssistantReply;
use crate::{BackendError, Result};

/// Sends a transcript to the kitchen assistant and returns its reply
#[async_trait]
pub trait Backend: Send + Sync {
    /// Exchange one utterance for one reply
    async fn send(&self, utterance: &str) -> std::result::Result<AssistantReply, BackendError>;
}

#[derive(Debug, Serialize)]
struct ConverseRequest<'a> {
    user_query: &'a str,
}

#[derive(Debug, Deserialize)]
struct ConverseResponse {
    text: Option<String>,
    response: Option<String>,
    audio_base64: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    text: Option<String>,
}

/// Backend reached over HTTP
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    url: String,
}

impl HttpBackend {
    /// Create a client for the configured endpoint
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(config: &BackendConfig) -> Result<Self> {
        Self::with_timeout(&config.url, config.timeout)
    }

    /// Create a client for `url` with a request timeout
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn with_timeout(url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    /// Endpoint URL
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn send(&self, utterance: &str) -> std::result::Result<AssistantReply, BackendError> {
        tracing::debug!(url = %self.url, query = utterance, "sending query to backend");

        let response = self
            .client
            .post(&self.url)
            .json(&ConverseRequest {
                user_query: utterance,
            })
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "backend request failed");
                BackendError::Transport(e.to_string())
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        if !status.is_success() {
            let message = error_message(&body)
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());
            tracing::error!(status = %status, message = %message, "backend returned error");
            return Err(BackendError::Status {
                status: status.as_u16(),
                message,
            });
        }

        parse_reply(&body)
    }
}

/// Pull a user-facing message out of an error body
fn error_message(body: &str) -> Option<String> {
    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    parsed
        .error
        .or(parsed.text)
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty())
}

/// Parse a success body into a reply
///
/// # Errors
///
/// Returns `Malformed` if the body is not JSON, has no reply text, or
/// carries audio that is not valid base64
pub fn parse_reply(body: &str) -> std::result::Result<AssistantReply, BackendError> {
    let parsed: ConverseResponse =
        serde_json::from_str(body).map_err(|e| BackendError::Malformed(e.to_string()))?;

    let text = parsed
        .text
        .or(parsed.response)
        .ok_or_else(|| BackendError::Malformed("reply has no text".to_string()))?;

    let audio = match parsed.audio_base64.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(encoded) => Some(
            base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| BackendError::Malformed(format!("invalid audio_base64: {e}")))?,
        ),
    };

    tracing::info!(
        reply_len = text.len(),
        audio_bytes = audio.as_ref().map_or(0, Vec::len),
        "backend replied"
    );

    Ok(AssistantReply { text, audio })
}
