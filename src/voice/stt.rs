//! Speech-to-text over a Whisper-compatible HTTP endpoint

use crate::config::SttConfig;
use crate::{Error, Result};

/// Response from a Whisper-compatible transcription endpoint
#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
}

/// Transcribes WAV audio to text
#[derive(Debug, Clone)]
pub struct Transcriber {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
    language: Option<String>,
}

impl Transcriber {
    /// Create a transcriber for `config`, hinting the primary subtag of `language_tag`
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(config: &SttConfig, language_tag: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        let language = language_tag
            .split(['-', '_'])
            .next()
            .map(str::trim)
            .filter(|lang| !lang.is_empty())
            .map(str::to_lowercase);

        Ok(Self {
            client,
            url: config.url.clone(),
            model: config.model.clone(),
            api_key: config.api_key.clone().filter(|key| !key.is_empty()),
            language,
        })
    }

    /// Transcribe WAV bytes
    ///
    /// # Errors
    ///
    /// Returns error if the request fails or the endpoint rejects it
    pub async fn transcribe(&self, audio: Vec<u8>) -> Result<String> {
        tracing::debug!(audio_bytes = audio.len(), url = %self.url, "starting transcription");

        let mut form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(audio)
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Stt(e.to_string()))?,
            )
            .text("model", self.model.clone());
        if let Some(language) = &self.language {
            form = form.text("language", language.clone());
        }

        let mut request = self.client.post(&self.url).multipart(form);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            tracing::error!(error = %e, "transcription request failed");
            e
        })?;

        let status = response.status();
        tracing::debug!(status = %status, "received response");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "transcription API error");
            return Err(Error::Stt(format!("transcription API error {status}: {body}")));
        }

        let result: WhisperResponse = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "failed to parse transcription response");
            e
        })?;

        tracing::info!(transcript = %result.text, "transcription complete");
        Ok(result.text.trim().to_string())
    }
}
