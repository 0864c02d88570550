//! Conversation data model
//!
//! The phase of the assistant, the retry budget, and the values that flow
//! through one conversation turn.

use std::fmt;

/// Current phase of the assistant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConversationState {
    /// Nothing is listening; waiting for a manual trigger
    #[default]
    Idle,
    /// Background pass is listening for the wake phrase
    WakeListening,
    /// Conversation is active and settling before the next capture pass
    Activating,
    /// A capture pass is recording the user's command
    Recording,
    /// A transcript was sent to the backend; waiting for the reply
    AwaitingReply,
    /// The reply audio is playing
    Speaking,
    /// The backend failed; the error is on screen until the conversation ends
    ErrorRecovering,
}

impl ConversationState {
    /// Whether a conversation is in progress
    #[must_use]
    pub const fn in_conversation(self) -> bool {
        !matches!(self, Self::Idle | Self::WakeListening)
    }

    /// Whether the user's speech is being captured for a command
    #[must_use]
    pub const fn is_recording(self) -> bool {
        matches!(self, Self::Recording)
    }

    /// Whether reply audio is playing
    #[must_use]
    pub const fn is_speaking(self) -> bool {
        matches!(self, Self::Speaking)
    }

    /// Human-readable label
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::WakeListening => "waiting for wake phrase",
            Self::Activating => "getting ready",
            Self::Recording => "listening",
            Self::AwaitingReply => "thinking",
            Self::Speaking => "speaking",
            Self::ErrorRecovering => "recovering from error",
        }
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Bounded counter of consecutive capture failures
///
/// `attempts` saturates at `max`; once there the conversation must end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    attempts: u32,
    max: u32,
}

impl RetryBudget {
    /// Create a budget allowing `max` consecutive failures
    #[must_use]
    pub const fn new(max: u32) -> Self {
        Self { attempts: 0, max }
    }

    /// Record one failure; returns true when the budget is now exhausted
    pub fn record_failure(&mut self) -> bool {
        self.attempts = (self.attempts + 1).min(self.max);
        self.is_exhausted()
    }

    /// Forget all failures
    pub const fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Whether no further restart is allowed
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.attempts >= self.max
    }

    /// Failures recorded since the last reset
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Maximum consecutive failures
    #[must_use]
    pub const fn max(&self) -> u32 {
        self.max
    }
}

/// One user speech turn
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Utterance {
    /// Latest interim transcript
    pub interim_text: String,
    /// Finalized transcript, empty until `is_final`
    pub final_text: String,
    /// Whether the engine reported a final result
    pub is_final: bool,
}

impl Utterance {
    /// Record an interim transcript
    pub fn interim(&mut self, text: &str) {
        text.clone_into(&mut self.interim_text);
    }

    /// Record the final transcript
    pub fn finalize(&mut self, text: &str) {
        text.clone_into(&mut self.final_text);
        self.is_final = true;
    }
}

/// One backend response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssistantReply {
    /// Reply text for display
    pub text: String,
    /// Decoded audio payload, if the backend synthesized one
    pub audio: Option<Vec<u8>>,
}

impl AssistantReply {
    /// Reply with text only
    #[must_use]
    pub fn text_only(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            audio: None,
        }
    }

    /// Reply with text and audio
    #[must_use]
    pub fn with_audio(text: impl Into<String>, audio: Vec<u8>) -> Self {
        Self {
            text: text.into(),
            audio: Some(audio),
        }
    }
}

macro_rules! handle_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }
    };
}

handle_id!(
    /// Identity of one speech capture pass
    PassId,
    "pass"
);
handle_id!(
    /// Identity of one audio playback
    PlaybackId,
    "playback"
);
handle_id!(
    /// Identity of one backend exchange
    TurnId,
    "turn"
);
handle_id!(
    /// Identity of one armed timer
    TimerId,
    "timer"
);
