//! Conversation session state machine
//!
//! The session owns the conversation: which phase it is in, the retry budget,
//! and the identity of every resource it has started (capture pass, playback,
//! backend turn, timer). It performs no I/O. Each call to [`Session::handle`]
//! consumes one [`Event`] and returns the [`Effect`]s the daemon must carry
//! out, so every transition is a function of the current state and one event.
//!
//! Events from a resource the session no longer owns are dropped, which is
//! how late callbacks from cancelled passes, playbacks and exchanges are
//! made harmless.

use std::time::Duration;

use crate::config::TimingConfig;
use crate::presentation::Notice;
use crate::voice::recognizer::{CaptureMode, RecognitionEvent};
use crate::voice::state::{
    AssistantReply, ConversationState, PassId, PlaybackId, RetryBudget, TimerId, TurnId, Utterance,
};
use crate::voice::wake_word::WakeDetector;
use crate::{BackendError, PlaybackError};

/// What starts a conversation
#[derive(Debug, Clone)]
pub enum ActivationSource {
    /// Background listening for a wake phrase, plus the manual toggle
    Wake(WakeDetector),
    /// Only the manual toggle
    Manual,
}

impl ActivationSource {
    /// Whether a wake detector is attached
    #[must_use]
    pub const fn is_wake(&self) -> bool {
        matches!(self, Self::Wake(_))
    }
}

/// Input to the session
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Manual trigger: start a conversation
    Activate,
    /// Explicit stop: end everything now
    Stop,
    /// The presentation toggle: stop if a conversation is active, otherwise start one
    Toggle,
    /// Callback from a capture pass
    Recognition {
        /// Pass that produced the event
        pass: PassId,
        /// What happened
        event: RecognitionEvent,
    },
    /// Backend exchange finished
    Reply {
        /// Exchange that finished
        turn: TurnId,
        /// Reply or failure
        result: Result<AssistantReply, BackendError>,
    },
    /// Playback finished or failed
    Playback {
        /// Playback that finished
        id: PlaybackId,
        /// Completion or failure
        result: Result<(), PlaybackError>,
    },
    /// An armed timer elapsed
    Timer(TimerId),
}

/// Work the daemon performs on behalf of the session
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Start a capture pass
    StartCapture {
        /// Identity the pass must report its events under
        pass: PassId,
        /// Continuous (wake listening) or single utterance (command)
        mode: CaptureMode,
    },
    /// Ask a capture pass to stop; it still reports `Ended`
    StopCapture {
        /// Pass to stop
        pass: PassId,
    },
    /// Send a finalized transcript to the backend
    Send {
        /// Identity the reply must be reported under
        turn: TurnId,
        /// Transcript
        text: String,
    },
    /// Abandon a backend exchange whose reply is no longer wanted
    CancelTurn {
        /// Exchange to abandon
        turn: TurnId,
    },
    /// Play decoded reply audio
    Play {
        /// Identity the completion must be reported under
        id: PlaybackId,
        /// Audio payload
        audio: Vec<u8>,
    },
    /// Stop and dispose a playback
    StopPlayback {
        /// Playback to stop
        id: PlaybackId,
    },
    /// Deliver `Event::Timer(id)` after `delay`
    ArmTimer {
        /// Timer identity
        id: TimerId,
        /// Delay
        delay: Duration,
    },
    /// Forget a previously armed timer
    CancelTimer {
        /// Timer identity
        id: TimerId,
    },
    /// Update the presentation surface
    Notify(Notice),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Purpose {
    Wake,
    Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassOutcome {
    Pending,
    Final,
    Failed,
    Benign,
}

#[derive(Debug, Clone, Copy)]
struct CaptureSlot {
    pass: PassId,
    purpose: Purpose,
    stopping: bool,
    outcome: PassOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerPurpose {
    /// Enter Recording from Activating
    Settle,
    /// Resume wake listening
    Listen,
    /// End the conversation after a backend failure
    Exit,
}

#[derive(Debug, Clone, Copy)]
struct ArmedTimer {
    id: TimerId,
    purpose: TimerPurpose,
}

#[derive(Debug, Clone)]
struct Turn {
    id: TurnId,
    query: String,
}

#[derive(Debug, Clone, Copy)]
enum ExitReason {
    RetriesExhausted,
    BackendFailure,
}

impl ExitReason {
    const fn message(self) -> &'static str {
        match self {
            Self::RetriesExhausted => "I couldn't hear you, so I stopped listening.",
            Self::BackendFailure => "The kitchen assistant is unavailable right now.",
        }
    }
}

/// The conversation state machine
#[derive(Debug)]
pub struct Session {
    source: ActivationSource,
    timing: TimingConfig,
    state: ConversationState,
    retry: RetryBudget,
    capture: Option<CaptureSlot>,
    playback: Option<PlaybackId>,
    turn: Option<Turn>,
    timer: Option<ArmedTimer>,
    utterance: Option<Utterance>,
    start_pending: bool,
    next_id: u64,
}

impl Session {
    /// Create a session in `Idle`
    #[must_use]
    pub const fn new(source: ActivationSource, timing: TimingConfig, max_attempts: u32) -> Self {
        Self {
            source,
            timing,
            state: ConversationState::Idle,
            retry: RetryBudget::new(max_attempts),
            capture: None,
            playback: None,
            turn: None,
            timer: None,
            utterance: None,
            start_pending: false,
            next_id: 0,
        }
    }

    /// Initial effects: announce the state and, with a wake detector, start listening
    pub fn start(&mut self) -> Vec<Effect> {
        let mut fx = vec![Effect::Notify(Notice::State(self.state))];
        if self.source.is_wake() {
            self.begin_wake_listening(&mut fx);
        } else {
            fx.push(Effect::Notify(Notice::Status {
                label: "Conversation mode".to_string(),
                text: "Press the toggle to start a conversation".to_string(),
            }));
        }
        fx
    }

    /// Apply one event and return the effects to perform
    pub fn handle(&mut self, event: Event) -> Vec<Effect> {
        let mut fx = Vec::new();
        match event {
            Event::Activate => self.activate(&mut fx),
            Event::Stop => self.stop(&mut fx),
            Event::Toggle => {
                if self.state.in_conversation() {
                    self.stop(&mut fx);
                } else {
                    self.activate(&mut fx);
                }
            }
            Event::Recognition { pass, event } => self.on_recognition(pass, event, &mut fx),
            Event::Reply { turn, result } => self.on_reply(turn, result, &mut fx),
            Event::Playback { id, result } => self.on_playback(id, result, &mut fx),
            Event::Timer(id) => self.on_timer(id, &mut fx),
        }
        fx
    }

    /// Current phase
    #[must_use]
    pub const fn state(&self) -> ConversationState {
        self.state
    }

    /// Retry budget
    #[must_use]
    pub const fn retry(&self) -> RetryBudget {
        self.retry
    }

    /// Capture pass the session currently owns, stopping or not
    #[must_use]
    pub fn capture_pass(&self) -> Option<PassId> {
        self.capture.map(|slot| slot.pass)
    }

    /// Whether a command capture pass is live (owned and not being stopped)
    #[must_use]
    pub fn is_capturing_command(&self) -> bool {
        self.capture
            .is_some_and(|slot| slot.purpose == Purpose::Command && !slot.stopping)
    }

    /// Playback the session currently owns
    #[must_use]
    pub const fn playback(&self) -> Option<PlaybackId> {
        self.playback
    }

    /// Backend exchange in flight
    #[must_use]
    pub fn pending_turn(&self) -> Option<TurnId> {
        self.turn.as_ref().map(|t| t.id)
    }

    /// Armed timer
    #[must_use]
    pub fn armed_timer(&self) -> Option<TimerId> {
        self.timer.map(|t| t.id)
    }

    /// Whether a wake detector is attached
    #[must_use]
    pub const fn is_wake_mode(&self) -> bool {
        self.source.is_wake()
    }

    const fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn set_state(&mut self, next: ConversationState, fx: &mut Vec<Effect>) {
        if self.state == next {
            return;
        }
        tracing::debug!(from = %self.state, to = %next, "state transition");
        self.state = next;
        fx.push(Effect::Notify(Notice::State(next)));
    }

    fn notify(fx: &mut Vec<Effect>, notice: Notice) {
        fx.push(Effect::Notify(notice));
    }

    fn arm(&mut self, purpose: TimerPurpose, delay: Duration, fx: &mut Vec<Effect>) {
        self.cancel_timer(fx);
        let id = TimerId(self.next_id());
        tracing::trace!(timer = %id, ?purpose, ?delay, "timer armed");
        self.timer = Some(ArmedTimer { id, purpose });
        fx.push(Effect::ArmTimer { id, delay });
    }

    fn cancel_timer(&mut self, fx: &mut Vec<Effect>) {
        if let Some(timer) = self.timer.take() {
            fx.push(Effect::CancelTimer { id: timer.id });
        }
    }

    fn on_timer(&mut self, id: TimerId, fx: &mut Vec<Effect>) {
        let Some(timer) = self.timer.filter(|t| t.id == id) else {
            tracing::trace!(timer = %id, "ignoring stale timer");
            return;
        };
        self.timer = None;

        match timer.purpose {
            TimerPurpose::Settle => self.begin_recording(fx),
            TimerPurpose::Listen => self.begin_wake_listening(fx),
            TimerPurpose::Exit => self.exit_conversation(ExitReason::BackendFailure, fx),
        }
    }

    fn begin_wake_listening(&mut self, fx: &mut Vec<Effect>) {
        if !self.source.is_wake() || self.state.in_conversation() {
            return;
        }
        if let Some(slot) = self.capture {
            tracing::debug!(pass = %slot.pass, "capture still owned, not starting wake listening");
            return;
        }

        let pass = PassId(self.next_id());
        let phrase = match &mut self.source {
            ActivationSource::Wake(detector) => {
                detector.pass_started();
                detector.phrase().to_string()
            }
            ActivationSource::Manual => return,
        };

        self.capture = Some(CaptureSlot {
            pass,
            purpose: Purpose::Wake,
            stopping: false,
            outcome: PassOutcome::Pending,
        });
        self.set_state(ConversationState::WakeListening, fx);
        fx.push(Effect::StartCapture {
            pass,
            mode: CaptureMode::Continuous,
        });
        Self::notify(
            fx,
            Notice::Status {
                label: "Wake word mode".to_string(),
                text: format!("Say \"{phrase}\" to start a conversation"),
            },
        );
    }

    fn activate(&mut self, fx: &mut Vec<Effect>) {
        if self.state.in_conversation() {
            tracing::trace!(state = %self.state, "already in a conversation");
            return;
        }

        self.cancel_timer(fx);
        if let Some(slot) = self.capture.as_mut() {
            if !slot.stopping {
                slot.stopping = true;
                fx.push(Effect::StopCapture { pass: slot.pass });
            }
        }

        self.retry.reset();
        self.utterance = None;
        self.set_state(ConversationState::Activating, fx);
        Self::notify(
            fx,
            Notice::Status {
                label: "Conversation active".to_string(),
                text: "Listening for your command...".to_string(),
            },
        );
        self.arm(TimerPurpose::Settle, self.timing.settle, fx);
    }

    fn begin_recording(&mut self, fx: &mut Vec<Effect>) {
        if self.state != ConversationState::Activating {
            tracing::trace!(state = %self.state, "not settling, skipping capture start");
            return;
        }

        if self.retry.is_exhausted() {
            tracing::warn!(
                attempts = self.retry.attempts(),
                "retry budget exhausted, ending conversation"
            );
            self.exit_conversation(ExitReason::RetriesExhausted, fx);
            return;
        }

        if let Some(slot) = self.capture {
            if slot.stopping {
                tracing::debug!(pass = %slot.pass, "previous pass still stopping, deferring start");
                self.start_pending = true;
            } else {
                tracing::warn!(pass = %slot.pass, "capture already active, refusing duplicate start");
            }
            return;
        }

        let pass = PassId(self.next_id());
        self.capture = Some(CaptureSlot {
            pass,
            purpose: Purpose::Command,
            stopping: false,
            outcome: PassOutcome::Pending,
        });
        self.utterance = Some(Utterance::default());
        self.set_state(ConversationState::Recording, fx);
        fx.push(Effect::StartCapture {
            pass,
            mode: CaptureMode::SingleUtterance,
        });
    }

    fn resume_pending_start(&mut self, fx: &mut Vec<Effect>) {
        if self.start_pending && self.capture.is_none() {
            self.start_pending = false;
            self.begin_recording(fx);
        }
    }

    fn on_recognition(&mut self, pass: PassId, event: RecognitionEvent, fx: &mut Vec<Effect>) {
        let Some(purpose) = self
            .capture
            .filter(|slot| slot.pass == pass)
            .map(|slot| slot.purpose)
        else {
            tracing::trace!(%pass, ?event, "ignoring event from released pass");
            return;
        };

        match purpose {
            Purpose::Wake => self.on_wake_event(event, fx),
            Purpose::Command => self.on_command_event(event, fx),
        }
    }

    fn on_wake_event(&mut self, event: RecognitionEvent, fx: &mut Vec<Effect>) {
        let listening = self.state == ConversationState::WakeListening;

        match event {
            RecognitionEvent::Started => tracing::debug!("listening for wake phrase"),
            RecognitionEvent::Interim(_) => {}
            RecognitionEvent::Final(text) => {
                let woke = match &mut self.source {
                    ActivationSource::Wake(detector) => detector.observe_final(&text, listening),
                    ActivationSource::Manual => false,
                };
                if woke {
                    Self::notify(fx, Notice::WakeDetected);
                    self.activate(fx);
                }
            }
            RecognitionEvent::Error(error) => {
                if let ActivationSource::Wake(detector) = &mut self.source {
                    detector.observe_error(error);
                }
            }
            RecognitionEvent::Ended => {
                self.capture = None;
                let idle = !self.state.in_conversation();
                let restart = match &mut self.source {
                    ActivationSource::Wake(detector) => detector.pass_ended(idle),
                    ActivationSource::Manual => None,
                };

                if let Some(delay) = restart {
                    tracing::debug!(?delay, "wake listening ended, restarting");
                    self.set_state(ConversationState::Idle, fx);
                    self.arm(TimerPurpose::Listen, delay, fx);
                } else {
                    self.resume_pending_start(fx);
                }
            }
        }
    }

    fn on_command_event(&mut self, event: RecognitionEvent, fx: &mut Vec<Effect>) {
        let recording = self.state == ConversationState::Recording;

        match event {
            RecognitionEvent::Started => {
                if recording {
                    self.retry.reset();
                    tracing::debug!("capture started");
                    Self::notify(
                        fx,
                        Notice::Status {
                            label: "Listening...".to_string(),
                            text: "Speak now...".to_string(),
                        },
                    );
                }
            }
            RecognitionEvent::Interim(text) => {
                let pending = self
                    .capture
                    .is_some_and(|slot| slot.outcome == PassOutcome::Pending);
                if recording && pending {
                    if let Some(utterance) = self.utterance.as_mut() {
                        utterance.interim(&text);
                    }
                    Self::notify(fx, Notice::Transcript(text));
                }
            }
            RecognitionEvent::Final(text) => self.on_final(&text, fx),
            RecognitionEvent::Error(error) => {
                let Some(slot) = self.capture.as_mut() else {
                    return;
                };
                if !recording || slot.stopping || slot.outcome != PassOutcome::Pending {
                    tracing::trace!(error = %error, "ignoring error after pass was settled");
                    return;
                }

                if error.is_benign() {
                    tracing::debug!(error = %error, "capture aborted");
                    slot.outcome = PassOutcome::Benign;
                } else {
                    tracing::warn!(error = %error, "capture failed");
                    slot.outcome = PassOutcome::Failed;
                    Self::notify(fx, Notice::Error(error.to_string()));
                }
            }
            RecognitionEvent::Ended => {
                let Some(slot) = self.capture.take() else {
                    return;
                };

                if !recording {
                    self.resume_pending_start(fx);
                    return;
                }

                // Ended while still recording: the pass produced no transcript
                if slot.outcome != PassOutcome::Benign {
                    self.retry.record_failure();
                }
                tracing::debug!(
                    attempts = self.retry.attempts(),
                    max = self.retry.max(),
                    outcome = ?slot.outcome,
                    "capture ended without transcript"
                );

                if self.retry.is_exhausted() {
                    tracing::warn!(
                        attempts = self.retry.attempts(),
                        "retry budget exhausted, ending conversation"
                    );
                    self.exit_conversation(ExitReason::RetriesExhausted, fx);
                } else {
                    self.set_state(ConversationState::Activating, fx);
                    self.arm(TimerPurpose::Settle, self.timing.capture_restart, fx);
                }
            }
        }
    }

    fn on_final(&mut self, text: &str, fx: &mut Vec<Effect>) {
        if self.state != ConversationState::Recording {
            tracing::trace!(state = %self.state, "ignoring transcript outside recording");
            return;
        }

        let text = text.trim();
        if text.is_empty() {
            return;
        }

        let Some(slot) = self.capture.as_mut() else {
            return;
        };
        if slot.outcome != PassOutcome::Pending {
            return;
        }
        slot.outcome = PassOutcome::Final;
        slot.stopping = true;
        fx.push(Effect::StopCapture { pass: slot.pass });

        let mut utterance = self.utterance.take().unwrap_or_default();
        utterance.finalize(text);
        tracing::info!(transcript = %utterance.final_text, "command received");

        let turn = TurnId(self.next_id());
        self.turn = Some(Turn {
            id: turn,
            query: utterance.final_text.clone(),
        });
        self.set_state(ConversationState::AwaitingReply, fx);
        Self::notify(fx, Notice::Query(utterance.final_text.clone()));
        fx.push(Effect::Send {
            turn,
            text: utterance.final_text,
        });
    }

    fn on_reply(
        &mut self,
        turn: TurnId,
        result: Result<AssistantReply, BackendError>,
        fx: &mut Vec<Effect>,
    ) {
        let Some(current) = self.turn.take_if(|t| t.id == turn) else {
            tracing::trace!(%turn, "ignoring stale reply");
            return;
        };
        if self.state != ConversationState::AwaitingReply {
            return;
        }

        match result {
            Ok(reply) => {
                self.retry.reset();
                tracing::info!(
                    %turn,
                    reply_len = reply.text.len(),
                    audio_bytes = reply.audio.as_ref().map_or(0, Vec::len),
                    "reply received"
                );
                Self::notify(
                    fx,
                    Notice::Reply {
                        query: current.query,
                        text: reply.text,
                    },
                );

                match reply.audio {
                    Some(audio) if !audio.is_empty() => {
                        if let Some(previous) = self.playback.take() {
                            fx.push(Effect::StopPlayback { id: previous });
                        }
                        let id = PlaybackId(self.next_id());
                        self.playback = Some(id);
                        self.set_state(ConversationState::Speaking, fx);
                        fx.push(Effect::Play { id, audio });
                    }
                    _ => {
                        tracing::debug!("reply has no audio, continuing with text only");
                        self.set_state(ConversationState::Activating, fx);
                        self.arm(TimerPurpose::Settle, self.timing.reply_restart, fx);
                    }
                }
            }
            Err(error) => {
                tracing::error!(%turn, error = %error, "backend exchange failed");
                self.set_state(ConversationState::ErrorRecovering, fx);
                Self::notify(fx, Notice::Error(error.to_string()));
                self.arm(TimerPurpose::Exit, self.timing.error_exit, fx);
            }
        }
    }

    fn on_playback(
        &mut self,
        id: PlaybackId,
        result: Result<(), PlaybackError>,
        fx: &mut Vec<Effect>,
    ) {
        if self.playback != Some(id) {
            tracing::trace!(playback = %id, "ignoring stale playback event");
            return;
        }
        self.playback = None;

        if self.state != ConversationState::Speaking {
            return;
        }

        let delay = match result {
            Ok(()) => {
                tracing::debug!(playback = %id, "playback finished");
                self.timing.playback_restart
            }
            Err(error) => {
                tracing::warn!(playback = %id, error = %error, "playback failed, continuing with text only");
                Self::notify(fx, Notice::Error(error.user_message()));
                self.timing.playback_failure_restart
            }
        };

        self.set_state(ConversationState::Activating, fx);
        self.arm(TimerPurpose::Settle, delay, fx);
    }

    /// Cancel every owned resource; late events from them will be ignored
    fn release_all(&mut self, fx: &mut Vec<Effect>) {
        self.cancel_timer(fx);
        if let Some(slot) = self.capture.take() {
            if !slot.stopping {
                fx.push(Effect::StopCapture { pass: slot.pass });
            }
        }
        if let Some(id) = self.playback.take() {
            fx.push(Effect::StopPlayback { id });
        }
        if let Some(turn) = self.turn.take() {
            fx.push(Effect::CancelTurn { turn: turn.id });
        }
        self.utterance = None;
        self.start_pending = false;
        if let ActivationSource::Wake(detector) = &mut self.source {
            detector.reset();
        }
    }

    fn exit_conversation(&mut self, reason: ExitReason, fx: &mut Vec<Effect>) {
        tracing::info!(?reason, "ending conversation");
        self.release_all(fx);
        self.retry.reset();
        self.set_state(ConversationState::Idle, fx);
        Self::notify(
            fx,
            Notice::Status {
                label: "Conversation ended".to_string(),
                text: reason.message().to_string(),
            },
        );
        if self.source.is_wake() {
            self.arm(TimerPurpose::Listen, self.timing.rewake, fx);
        }
    }

    fn stop(&mut self, fx: &mut Vec<Effect>) {
        let was_active = self.state.in_conversation();
        tracing::info!(state = %self.state, "stop requested");
        self.release_all(fx);
        self.retry.reset();
        self.set_state(ConversationState::Idle, fx);
        Self::notify(fx, Notice::Stopped);
        if was_active && self.source.is_wake() {
            self.arm(TimerPurpose::Listen, self.timing.rewake, fx);
        }
    }
}
