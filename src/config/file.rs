//! TOML configuration file loading
//!
//! Supports `~/.config/kitchen-voice/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{Error, Result};

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    /// Conversational backend
    #[serde(default)]
    pub backend: BackendFileConfig,

    /// Wake phrase detection
    #[serde(default)]
    pub wake: WakeFileConfig,

    /// Speech recognition engine
    #[serde(default)]
    pub recognition: RecognitionFileConfig,

    /// Transcription service used by the microphone engine
    #[serde(default)]
    pub stt: SttFileConfig,

    /// Audio output
    #[serde(default)]
    pub audio: AudioFileConfig,

    /// Restart and display delays
    #[serde(default)]
    pub timing: TimingFileConfig,

    /// Retry budget
    #[serde(default)]
    pub retry: RetryFileConfig,
}

/// Backend endpoint configuration
#[derive(Debug, Default, Deserialize)]
pub struct BackendFileConfig {
    /// Full URL of the conversational endpoint
    pub url: Option<String>,

    /// Request timeout in seconds
    pub timeout_secs: Option<u64>,
}

/// Wake phrase configuration
#[derive(Debug, Default, Deserialize)]
pub struct WakeFileConfig {
    /// Listen for the wake phrase (false = manual toggle only)
    pub enabled: Option<bool>,

    /// Phrase that starts a conversation (e.g. "hey kitchen")
    pub phrase: Option<String>,
}

/// Recognition engine configuration
#[derive(Debug, Default, Deserialize)]
pub struct RecognitionFileConfig {
    /// Input engine: "mic" or "text"
    pub input: Option<String>,

    /// Language tag (e.g. "en-US")
    pub language: Option<String>,

    /// Report interim transcripts
    pub interim_results: Option<bool>,

    /// Seconds of silence before a pass reports `no-speech`
    pub no_speech_timeout_secs: Option<u64>,

    /// RMS energy above which a frame counts as speech
    pub energy_threshold: Option<f32>,
}

/// Transcription service configuration
#[derive(Debug, Default, Deserialize)]
pub struct SttFileConfig {
    /// Whisper-compatible transcription endpoint
    pub url: Option<String>,

    /// Model name (e.g. "whisper-1")
    pub model: Option<String>,

    /// Bearer token for the transcription endpoint
    pub api_key: Option<String>,
}

/// Audio output configuration
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    /// Never open an output device; replies are text only
    pub mute: Option<bool>,

    /// Block playback until the first user gesture
    pub require_gesture: Option<bool>,
}

/// Delay configuration, all values in milliseconds
#[derive(Debug, Default, Deserialize)]
pub struct TimingFileConfig {
    pub settle_ms: Option<u64>,
    pub capture_restart_ms: Option<u64>,
    pub reply_restart_ms: Option<u64>,
    pub playback_restart_ms: Option<u64>,
    pub playback_failure_restart_ms: Option<u64>,
    pub error_exit_ms: Option<u64>,
    pub wake_error_restart_ms: Option<u64>,
    pub wake_end_restart_ms: Option<u64>,
    pub rewake_ms: Option<u64>,
    pub error_display_ms: Option<u64>,
}

/// Retry budget configuration
#[derive(Debug, Default, Deserialize)]
pub struct RetryFileConfig {
    /// Consecutive capture failures before the conversation ends
    pub max_attempts: Option<u32>,
}

/// Load the TOML config file
///
/// An explicit `path` must exist and parse. Without one, the standard path is
/// tried and any problem falls back to `ConfigFile::default()`.
///
/// # Errors
///
/// Returns error if an explicit path cannot be read or parsed
pub fn load_config_file(path: Option<&Path>) -> Result<ConfigFile> {
    if let Some(path) = path {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), "loaded config file");
        return Ok(config);
    }

    let Some(path) = config_file_path() else {
        return Ok(ConfigFile::default());
    };

    if !path.exists() {
        return Ok(ConfigFile::default());
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                Ok(config)
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                Ok(ConfigFile::default())
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            Ok(ConfigFile::default())
        }
    }
}

/// Return the config file path: `~/.config/kitchen-voice/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("kitchen-voice").join("config.toml"))
}
