//! Configuration management for the kitchen voice controller
//!
//! Layering: built-in defaults, then the TOML file, then environment
//! variables. CLI flags are applied on top by the binary.

pub mod file;

use std::path::Path;
use std::time::Duration;

use crate::{Error, Result};

use self::file::ConfigFile;

/// Default conversational endpoint
pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8000/kitchen_converse";

/// Default wake phrase
pub const DEFAULT_WAKE_PHRASE: &str = "hey kitchen";

/// Default Whisper-compatible transcription endpoint
pub const DEFAULT_STT_URL: &str = "https://api.openai.com/v1/audio/transcriptions";

/// Default consecutive failures tolerated before a conversation ends
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Controller configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Conversational backend
    pub backend: BackendConfig,

    /// Wake phrase detection
    pub wake: WakeConfig,

    /// Speech recognition
    pub recognition: RecognitionConfig,

    /// Transcription service for the microphone engine
    pub stt: SttConfig,

    /// Audio output
    pub audio: AudioConfig,

    /// Restart and display delays
    pub timing: TimingConfig,

    /// Consecutive capture failures before the conversation ends
    pub max_attempts: u32,
}

/// Backend endpoint configuration
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Full URL of the conversational endpoint
    pub url: String,

    /// Request timeout
    pub timeout: Duration,
}

/// Wake phrase configuration
#[derive(Debug, Clone)]
pub struct WakeConfig {
    /// Listen for the wake phrase; when false only the manual toggle starts a conversation
    pub enabled: bool,

    /// Phrase that starts a conversation
    pub phrase: String,
}

/// Which recognition engine feeds the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputKind {
    /// Microphone capture with HTTP transcription
    #[default]
    Mic,
    /// Lines typed on stdin
    Text,
}

impl std::str::FromStr for InputKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "mic" | "microphone" => Ok(Self::Mic),
            "text" | "stdin" => Ok(Self::Text),
            other => Err(Error::Config(format!(
                "unknown input engine '{other}' (expected 'mic' or 'text')"
            ))),
        }
    }
}

/// Speech recognition configuration
#[derive(Debug, Clone)]
pub struct RecognitionConfig {
    /// Engine to use
    pub input: InputKind,

    /// Language tag (e.g. "en-US")
    pub language: String,

    /// Report interim transcripts
    pub interim_results: bool,

    /// Silence after which a single-utterance pass reports `no-speech`
    pub no_speech_timeout: Duration,

    /// RMS energy above which a frame counts as speech
    pub energy_threshold: f32,
}

/// Transcription service configuration
#[derive(Debug, Clone)]
pub struct SttConfig {
    /// Whisper-compatible transcription endpoint
    pub url: String,

    /// Model name
    pub model: String,

    /// Bearer token, if the endpoint needs one
    pub api_key: Option<String>,
}

/// Audio output configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct AudioConfig {
    /// Never open an output device
    pub mute: bool,

    /// Block playback until the first user gesture
    pub require_gesture: bool,
}

/// Delays used by the conversation session
///
/// These are tunable backoff parameters; none of the exact values carry meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingConfig {
    /// Pause between activation and the first capture pass
    pub settle: Duration,

    /// Pause before restarting a capture pass that ended without a transcript
    pub capture_restart: Duration,

    /// Pause before listening again after a text-only reply
    pub reply_restart: Duration,

    /// Pause before listening again after a reply finished playing
    pub playback_restart: Duration,

    /// Pause before listening again after playback failed
    pub playback_failure_restart: Duration,

    /// Time a backend failure stays on screen before the conversation ends
    pub error_exit: Duration,

    /// Wake listening restart delay after an engine error
    pub wake_error_restart: Duration,

    /// Wake listening restart delay after an unsolicited end of pass
    pub wake_end_restart: Duration,

    /// Delay before wake listening resumes after a conversation ends
    pub rewake: Duration,

    /// How long error messages stay visible
    pub error_display: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(500),
            capture_restart: Duration::from_millis(1500),
            reply_restart: Duration::from_millis(2000),
            playback_restart: Duration::from_millis(800),
            playback_failure_restart: Duration::from_millis(2000),
            error_exit: Duration::from_millis(3000),
            wake_error_restart: Duration::from_millis(1000),
            wake_end_restart: Duration::from_millis(500),
            rewake: Duration::from_millis(1000),
            error_display: Duration::from_millis(5000),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendConfig {
                url: DEFAULT_BACKEND_URL.to_string(),
                timeout: Duration::from_secs(30),
            },
            wake: WakeConfig {
                enabled: true,
                phrase: DEFAULT_WAKE_PHRASE.to_string(),
            },
            recognition: RecognitionConfig {
                input: InputKind::Mic,
                language: "en-US".to_string(),
                interim_results: true,
                no_speech_timeout: Duration::from_secs(8),
                energy_threshold: 0.03,
            },
            stt: SttConfig {
                url: DEFAULT_STT_URL.to_string(),
                model: "whisper-1".to_string(),
                api_key: None,
            },
            audio: AudioConfig::default(),
            timing: TimingConfig::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl Config {
    /// Load configuration from the config file and process environment
    ///
    /// # Errors
    ///
    /// Returns error if an explicit config file is unusable or the result fails validation
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = file::load_config_file(path)?;
        Self::from_sources(file, |key| std::env::var(key).ok())
    }

    /// Build configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if a value cannot be parsed or the result fails validation
    pub fn from_sources(file: ConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let t = &mut config.timing;

        // File overlay
        if let Some(url) = file.backend.url {
            config.backend.url = url;
        }
        if let Some(secs) = file.backend.timeout_secs {
            config.backend.timeout = Duration::from_secs(secs);
        }
        if let Some(enabled) = file.wake.enabled {
            config.wake.enabled = enabled;
        }
        if let Some(phrase) = file.wake.phrase {
            config.wake.phrase = phrase;
        }
        if let Some(input) = file.recognition.input {
            config.recognition.input = input.parse()?;
        }
        if let Some(language) = file.recognition.language {
            config.recognition.language = language;
        }
        if let Some(interim) = file.recognition.interim_results {
            config.recognition.interim_results = interim;
        }
        if let Some(secs) = file.recognition.no_speech_timeout_secs {
            config.recognition.no_speech_timeout = Duration::from_secs(secs);
        }
        if let Some(threshold) = file.recognition.energy_threshold {
            config.recognition.energy_threshold = threshold;
        }
        if let Some(url) = file.stt.url {
            config.stt.url = url;
        }
        if let Some(model) = file.stt.model {
            config.stt.model = model;
        }
        config.stt.api_key = file.stt.api_key;
        if let Some(mute) = file.audio.mute {
            config.audio.mute = mute;
        }
        if let Some(require_gesture) = file.audio.require_gesture {
            config.audio.require_gesture = require_gesture;
        }

        let ms = |value: Option<u64>, slot: &mut Duration| {
            if let Some(v) = value {
                *slot = Duration::from_millis(v);
            }
        };
        ms(file.timing.settle_ms, &mut t.settle);
        ms(file.timing.capture_restart_ms, &mut t.capture_restart);
        ms(file.timing.reply_restart_ms, &mut t.reply_restart);
        ms(file.timing.playback_restart_ms, &mut t.playback_restart);
        ms(
            file.timing.playback_failure_restart_ms,
            &mut t.playback_failure_restart,
        );
        ms(file.timing.error_exit_ms, &mut t.error_exit);
        ms(file.timing.wake_error_restart_ms, &mut t.wake_error_restart);
        ms(file.timing.wake_end_restart_ms, &mut t.wake_end_restart);
        ms(file.timing.rewake_ms, &mut t.rewake);
        ms(file.timing.error_display_ms, &mut t.error_display);

        if let Some(max) = file.retry.max_attempts {
            config.max_attempts = max;
        }

        // Environment overrides
        if let Some(url) = env("KITCHEN_BACKEND_URL") {
            config.backend.url = url;
        }
        if let Some(secs) = env("KITCHEN_BACKEND_TIMEOUT_SECS") {
            let secs = secs.parse::<u64>().map_err(|e| {
                Error::Config(format!("KITCHEN_BACKEND_TIMEOUT_SECS: {e}"))
            })?;
            config.backend.timeout = Duration::from_secs(secs);
        }
        if let Some(phrase) = env("KITCHEN_WAKE_PHRASE") {
            config.wake.phrase = phrase;
        }
        if let Some(enabled) = env("KITCHEN_WAKE_ENABLED") {
            config.wake.enabled = parse_flag(&enabled);
        }
        if let Some(language) = env("KITCHEN_LANGUAGE") {
            config.recognition.language = language;
        }
        if let Some(input) = env("KITCHEN_INPUT") {
            config.recognition.input = input.parse()?;
        }
        if let Some(url) = env("KITCHEN_STT_URL") {
            config.stt.url = url;
        }
        if let Some(model) = env("KITCHEN_STT_MODEL") {
            config.stt.model = model;
        }
        if let Some(key) = env("OPENAI_API_KEY") {
            config.stt.api_key.get_or_insert(key);
        }
        if let Some(max) = env("KITCHEN_MAX_RETRIES") {
            config.max_attempts = max
                .parse()
                .map_err(|e| Error::Config(format!("KITCHEN_MAX_RETRIES: {e}")))?;
        }
        if let Some(mute) = env("KITCHEN_MUTE") {
            config.audio.mute = parse_flag(&mute);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check that the configuration can drive a conversation
    ///
    /// # Errors
    ///
    /// Returns error describing the first invalid value
    pub fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.backend.url)
            .map_err(|e| Error::Config(format!("invalid backend url '{}': {e}", self.backend.url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "backend url must be http or https, got '{}'",
                url.scheme()
            )));
        }

        if self.wake.phrase.trim().is_empty() {
            return Err(Error::Config("wake phrase must not be empty".to_string()));
        }

        if self.max_attempts == 0 {
            return Err(Error::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("yes")
}
