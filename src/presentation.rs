//! Presentation surface
//!
//! Projects the conversation onto an indicator, a status popup and a results
//! panel. The surface only renders what the session tells it; the one thing
//! it sends back is the start/stop toggle, which the daemon reads from the
//! console.

use std::fmt::Write as _;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::time::Instant;

use crate::voice::ConversationState;

/// Something the user should see
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Conversation phase changed
    State(ConversationState),
    /// Labelled status message
    Status {
        /// Short heading
        label: String,
        /// Detail line
        text: String,
    },
    /// Wake phrase was heard
    WakeDetected,
    /// Interim transcript of what the user is saying
    Transcript(String),
    /// Finalized command sent to the backend
    Query(String),
    /// Backend reply for the results panel
    Reply {
        /// Command that produced the reply
        query: String,
        /// Reply text
        text: String,
    },
    /// User-visible error; dismissed after the display time
    Error(String),
    /// Conversation stopped by the user
    Stopped,
}

/// Indicator shown on the toggle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indicator {
    /// Waiting for the wake phrase
    Waiting,
    /// Capturing a command
    Listening,
    /// Conversation active between captures
    Active,
    /// Reply audio is playing
    Speaking,
    /// Nothing running; press the toggle to start
    Inactive,
}

impl Indicator {
    /// Project a state onto the indicator
    #[must_use]
    pub const fn for_state(state: ConversationState, wake_mode: bool) -> Self {
        match state {
            ConversationState::Speaking => Self::Speaking,
            ConversationState::Recording => Self::Listening,
            ConversationState::Activating
            | ConversationState::AwaitingReply
            | ConversationState::ErrorRecovering => Self::Active,
            ConversationState::WakeListening => Self::Waiting,
            ConversationState::Idle if wake_mode => Self::Waiting,
            ConversationState::Idle => Self::Inactive,
        }
    }

    /// Icon for the indicator
    #[must_use]
    pub const fn icon(self) -> &'static str {
        match self {
            Self::Waiting => "👂",
            Self::Listening | Self::Inactive => "🎤",
            Self::Active => "💬",
            Self::Speaking => "🔊",
        }
    }
}

/// Message in the status popup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    /// Short heading
    pub label: String,
    /// Detail line
    pub text: String,
    /// Errors are dismissed automatically
    pub is_error: bool,
    shown_at: Instant,
}

/// Contents of the results panel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultsPanel {
    /// What the user asked
    pub query: String,
    /// Reply formatted for display
    pub reply: String,
}

/// Everything currently on screen
#[derive(Debug, Clone)]
pub struct Surface {
    wake_mode: bool,
    error_display: Duration,
    state: ConversationState,
    popup: Option<StatusMessage>,
    results: Option<ResultsPanel>,
}

impl Surface {
    /// Create an empty surface
    #[must_use]
    pub const fn new(wake_mode: bool, error_display: Duration) -> Self {
        Self {
            wake_mode,
            error_display,
            state: ConversationState::Idle,
            popup: None,
            results: None,
        }
    }

    /// Apply a notice at time `now`
    pub fn apply(&mut self, notice: &Notice, now: Instant) {
        match notice {
            Notice::State(state) => self.state = *state,
            Notice::Status { label, text } => self.show(label, text, false, now),
            Notice::WakeDetected => self.show("Wake phrase heard", "Starting conversation...", false, now),
            Notice::Transcript(text) => self.show("You are saying:", text, false, now),
            Notice::Query(text) => self.show("Processing...", text, false, now),
            Notice::Reply { query, text } => {
                self.results = Some(ResultsPanel {
                    query: query.clone(),
                    reply: format_reply(text),
                });
            }
            Notice::Error(message) => self.show("Error", message, true, now),
            Notice::Stopped => self.show("Conversation stopped", "Press the toggle to start again", false, now),
        }
    }

    fn show(&mut self, label: &str, text: &str, is_error: bool, now: Instant) {
        self.popup = Some(StatusMessage {
            label: label.to_string(),
            text: text.to_string(),
            is_error,
            shown_at: now,
        });
    }

    /// Current indicator
    #[must_use]
    pub const fn indicator(&self) -> Indicator {
        Indicator::for_state(self.state, self.wake_mode)
    }

    /// Popup visible at `now`; errors disappear after the display time
    #[must_use]
    pub fn popup(&self, now: Instant) -> Option<&StatusMessage> {
        self.popup.as_ref().filter(|message| {
            !message.is_error || now.duration_since(message.shown_at) < self.error_display
        })
    }

    /// Whether the speaking indicator is lit
    #[must_use]
    pub const fn is_speaking(&self) -> bool {
        self.state.is_speaking()
    }

    /// Results panel
    #[must_use]
    pub const fn results(&self) -> Option<&ResultsPanel> {
        self.results.as_ref()
    }
}

/// Renders notices for the user
pub trait Presenter {
    /// Show a notice
    fn present(&mut self, notice: &Notice);
}

/// Presenter writing to the terminal
#[derive(Debug)]
pub struct ConsolePresenter {
    surface: Surface,
}

impl ConsolePresenter {
    /// Create a console presenter
    #[must_use]
    pub const fn new(wake_mode: bool, error_display: Duration) -> Self {
        Self {
            surface: Surface::new(wake_mode, error_display),
        }
    }
}

impl Presenter for ConsolePresenter {
    fn present(&mut self, notice: &Notice) {
        let now = Instant::now();
        self.surface.apply(notice, now);
        let icon = self.surface.indicator().icon();

        match notice {
            Notice::State(state) => println!("{icon} [{state}]"),
            Notice::Reply { .. } => {
                if let Some(panel) = self.surface.results() {
                    println!("\nYou asked: {}\n\nKitchen Assistant:\n{}\n", panel.query, panel.reply);
                }
            }
            Notice::Error(_) => {
                if let Some(message) = self.surface.popup(now) {
                    eprintln!("{icon} {}: {}", message.label, message.text);
                }
            }
            _ => {
                if let Some(message) = self.surface.popup(now) {
                    println!("{icon} {}  {}", message.label, message.text);
                }
            }
        }
    }
}

static BOLD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\*(.*?)\*\*|__(.*?)__").expect("valid regex"));

static ITALIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*([^*\s][^*]*?)\*|\b_([^_]+?)_\b").expect("valid regex"));

static NUMBERED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)[.)]\s+(.*)$").expect("valid regex"));

static BULLET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[-•*]\s+(.*)$").expect("valid regex"));

/// Format reply text for the results panel
///
/// Strips markdown emphasis, indents list items with a uniform marker and
/// keeps paragraph breaks.
#[must_use]
pub fn format_reply(text: &str) -> String {
    let mut out = String::new();
    let mut blank = false;

    for line in text.trim().lines() {
        let line = line.trim();
        if line.is_empty() {
            blank = true;
            continue;
        }
        if !out.is_empty() {
            out.push('\n');
            if blank {
                out.push('\n');
            }
        }
        blank = false;

        if let Some(caps) = NUMBERED.captures(line) {
            let _ = write!(out, "  {}. {}", &caps[1], strip_emphasis(&caps[2]));
        } else if let Some(caps) = BULLET.captures(line) {
            let _ = write!(out, "  • {}", strip_emphasis(&caps[1]));
        } else {
            out.push_str(&strip_emphasis(line));
        }
    }

    out
}

fn strip_emphasis(line: &str) -> String {
    let line = BOLD.replace_all(line, "$1$2");
    ITALIC.replace_all(&line, "$1$2").into_owned()
}
