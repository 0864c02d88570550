//! Wake phrase detection
//!
//! Watches final transcripts from a continuous background pass and decides
//! when a conversation should start, and how soon a dead pass restarts.

use std::time::Duration;

use crate::RecognitionError;
use crate::config::TimingConfig;

/// State of the wake detector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    /// Listening pass is running
    Listening,
    /// Wake phrase was heard; the pass is being handed over
    Activated,
    /// No pass is running
    Dormant,
}

/// Detects the wake phrase in final transcripts
#[derive(Debug, Clone)]
pub struct WakeDetector {
    phrase: String,
    state: DetectorState,
    last_error: Option<RecognitionError>,
    error_restart: Duration,
    end_restart: Duration,
}

impl WakeDetector {
    /// Create a detector for `phrase` using the restart delays in `timing`
    #[must_use]
    pub fn new(phrase: &str, timing: &TimingConfig) -> Self {
        let phrase = normalize(phrase);
        tracing::debug!(wake_phrase = %phrase, "wake detector initialized");

        Self {
            phrase,
            state: DetectorState::Dormant,
            last_error: None,
            error_restart: timing.wake_error_restart,
            end_restart: timing.wake_end_restart,
        }
    }

    /// Check if a transcript contains the wake phrase
    #[must_use]
    pub fn matches(&self, transcript: &str) -> bool {
        normalize(transcript).contains(&self.phrase)
    }

    /// A new listening pass started
    pub fn pass_started(&mut self) {
        self.state = DetectorState::Listening;
        self.last_error = None;
    }

    /// Process a final transcript from the listening pass
    ///
    /// Returns true exactly once per activation: only while listening and
    /// only when the caller reports that no conversation is under way.
    pub fn observe_final(&mut self, transcript: &str, idle: bool) -> bool {
        if self.state != DetectorState::Listening || !idle {
            tracing::trace!(transcript, state = ?self.state, "ignoring transcript");
            return false;
        }

        if !self.matches(transcript) {
            tracing::trace!(transcript, "no wake phrase");
            return false;
        }

        tracing::info!(
            wake_phrase = %self.phrase,
            transcript,
            command = %extract_command(transcript, &self.phrase),
            "wake phrase detected"
        );
        self.state = DetectorState::Activated;
        true
    }

    /// Record an engine error on the listening pass
    pub fn observe_error(&mut self, error: RecognitionError) {
        tracing::warn!(error = %error, "wake listening error");
        self.last_error = Some(error);
    }

    /// The listening pass ended
    ///
    /// Returns the delay before listening should restart, or `None` when a
    /// conversation has begun and the detector must stay quiet.
    pub fn pass_ended(&mut self, idle: bool) -> Option<Duration> {
        let had_error = self.last_error.take().is_some();
        let activated = self.state == DetectorState::Activated;
        self.state = DetectorState::Dormant;

        if activated || !idle {
            return None;
        }

        Some(if had_error {
            self.error_restart
        } else {
            self.end_restart
        })
    }

    /// Reset to dormant, dropping any recorded error
    pub fn reset(&mut self) {
        self.state = DetectorState::Dormant;
        self.last_error = None;
    }

    /// Get current state
    #[must_use]
    pub const fn state(&self) -> DetectorState {
        self.state
    }

    /// Get the normalized wake phrase
    #[must_use]
    pub fn phrase(&self) -> &str {
        &self.phrase
    }
}

/// Lowercase and collapse whitespace so "Hey  Kitchen" matches "hey kitchen"
fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Extract the command spoken after the wake phrase
#[must_use]
pub fn extract_command(transcript: &str, wake_phrase: &str) -> String {
    let lower = normalize(transcript);
    let wake_lower = normalize(wake_phrase);

    lower.find(&wake_lower).map_or_else(
        || lower.clone(),
        |pos| {
            lower[pos + wake_lower.len()..]
                .trim_start_matches(|c: char| c.is_whitespace() || c == ',' || c == '.')
                .to_string()
        },
    )
}
