//! Error types for the kitchen voice controller

use thiserror::Error;

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur outside the conversation loop
///
/// Failures inside a conversation travel as events carrying one of the
/// domain errors below and never surface here.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Recognition engine failure, named after the engine's cause code
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecognitionError {
    /// Nothing was said before the engine gave up
    #[error("no-speech")]
    NoSpeech,

    /// Microphone could not be opened or stopped delivering audio
    #[error("audio-capture: {0}")]
    AudioCapture(String),

    /// Microphone permission was refused
    #[error("not-allowed")]
    NotAllowed,

    /// Transcription service could not be reached
    #[error("network: {0}")]
    Network(String),

    /// Pass was cancelled before it produced a result
    #[error("aborted")]
    Aborted,

    /// Any other engine-specific failure
    #[error("engine: {0}")]
    Engine(String),
}

impl RecognitionError {
    /// Short cause code as reported by the engine
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NoSpeech => "no-speech",
            Self::AudioCapture(_) => "audio-capture",
            Self::NotAllowed => "not-allowed",
            Self::Network(_) => "network",
            Self::Aborted => "aborted",
            Self::Engine(_) => "engine",
        }
    }

    /// Whether the failure is expected and must not count against the retry budget
    #[must_use]
    pub const fn is_benign(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}

/// Backend exchange failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// No response: connection refused, DNS failure, timeout
    #[error("failed to reach the kitchen assistant: {0}")]
    Transport(String),

    /// The backend answered with a non-success status
    #[error("kitchen assistant returned {status}: {message}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Message extracted from the response body
        message: String,
    },

    /// The response body was not the expected JSON reply
    #[error("malformed reply from kitchen assistant: {0}")]
    Malformed(String),
}

/// Audio playback failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaybackError {
    /// Payload could not be decoded
    #[error("audio decode failed: {0}")]
    Decode(String),

    /// Output is locked until the user interacts with the assistant
    #[error("audio playback blocked until user interaction")]
    AutoplayBlocked,

    /// Output device failed
    #[error("audio output failed: {0}")]
    Device(String),

    /// Playback was stopped before it finished
    #[error("audio playback interrupted")]
    Interrupted,
}

impl PlaybackError {
    /// Message shown to the user when playback fails
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::AutoplayBlocked => {
                "Audio is locked until you interact with the assistant. Continuing with text only."
                    .to_string()
            }
            Self::Decode(_) | Self::Device(_) | Self::Interrupted => {
                format!("Audio playback failed: {self}")
            }
        }
    }
}
