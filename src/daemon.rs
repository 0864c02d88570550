//! Daemon - drives the conversation session
//!
//! Owns the session and every device it talks to. Events from engines,
//! the backend, playback and timers arrive on one queue and are applied to
//! the session one at a time; the effects it returns are carried out here.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backend::{Backend, HttpBackend};
use crate::config::{Config, InputKind};
use crate::presentation::{ConsolePresenter, Presenter};
use crate::voice::{
    ActivationSource, AudioGate, AudioSink, CpalPlayback, Effect, Event, EventSender,
    MicRecognizer, RecognitionEvent, Session, SilentPlayback, SpeechEngine, TextRecognizer,
    TimerId, Transcriber, TurnId, WakeDetector,
};
use crate::Result;

/// Inbound control from the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Start a conversation, or stop the current one
    Toggle,
    /// Start a conversation
    Activate,
    /// Stop everything
    Stop,
    /// Leave the event loop
    Shutdown,
}

impl Control {
    const fn into_event(self) -> Option<Event> {
        match self {
            Self::Toggle => Some(Event::Toggle),
            Self::Activate => Some(Event::Activate),
            Self::Stop => Some(Event::Stop),
            Self::Shutdown => None,
        }
    }
}

/// The voice controller
pub struct Daemon {
    session: Session,
    engine: Box<dyn SpeechEngine>,
    backend: Arc<dyn Backend>,
    sink: Box<dyn AudioSink>,
    presenter: Box<dyn Presenter>,
    events_tx: EventSender,
    events_rx: mpsc::UnboundedReceiver<Event>,
    timer: Option<(TimerId, JoinHandle<()>)>,
    turn: Option<(TurnId, JoinHandle<()>)>,
}

impl Daemon {
    /// Assemble a daemon from its parts
    #[must_use]
    pub fn new(
        session: Session,
        engine: Box<dyn SpeechEngine>,
        backend: Arc<dyn Backend>,
        sink: Box<dyn AudioSink>,
        presenter: Box<dyn Presenter>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            session,
            engine,
            backend,
            sink,
            presenter,
            events_tx,
            events_rx,
            timer: None,
            turn: None,
        }
    }

    /// Build the daemon described by `config`
    ///
    /// `typed_lines` feeds the text engine and is ignored for microphone input.
    ///
    /// # Errors
    ///
    /// Returns error if an HTTP client cannot be built or text input has no line source
    pub fn from_config(
        config: &Config,
        typed_lines: Option<mpsc::UnboundedReceiver<String>>,
    ) -> Result<Self> {
        let source = if config.wake.enabled {
            ActivationSource::Wake(WakeDetector::new(&config.wake.phrase, &config.timing))
        } else {
            ActivationSource::Manual
        };
        let session = Session::new(source, config.timing, config.max_attempts);

        let engine: Box<dyn SpeechEngine> = match config.recognition.input {
            InputKind::Mic => {
                let transcriber = Transcriber::new(&config.stt, &config.recognition.language)?;
                Box::new(MicRecognizer::new(transcriber, &config.recognition))
            }
            InputKind::Text => {
                let lines = typed_lines.ok_or_else(|| {
                    crate::Error::Config("text input needs a line source".to_string())
                })?;
                Box::new(TextRecognizer::new(
                    lines,
                    config.recognition.no_speech_timeout,
                    config.recognition.interim_results,
                ))
            }
        };

        let backend = Arc::new(HttpBackend::new(&config.backend)?);

        let sink: Box<dyn AudioSink> = if config.audio.mute {
            Box::new(SilentPlayback)
        } else {
            Box::new(CpalPlayback::new(AudioGate::new(config.audio.require_gesture)))
        };

        let presenter = Box::new(ConsolePresenter::new(
            config.wake.enabled,
            config.timing.error_display,
        ));

        tracing::info!(
            backend = %config.backend.url,
            wake = config.wake.enabled,
            wake_phrase = %config.wake.phrase,
            input = ?config.recognition.input,
            mute = config.audio.mute,
            "voice controller configured"
        );

        Ok(Self::new(session, engine, backend, sink, presenter))
    }

    /// The session being driven
    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    /// Run until `Control::Shutdown` or the control channel closes
    ///
    /// # Errors
    ///
    /// Does not currently fail
    pub async fn run(&mut self, mut controls: mpsc::Receiver<Control>) -> Result<()> {
        tracing::info!(wake = self.session.is_wake_mode(), "voice controller running");
        let effects = self.session.start();
        self.execute(effects);

        loop {
            tokio::select! {
                control = controls.recv() => {
                    let Some(event) = control.and_then(Control::into_event) else {
                        tracing::info!("shutdown requested");
                        break;
                    };
                    // Any control counts as a user gesture
                    self.sink.unlock();
                    self.dispatch(event);
                }
                Some(event) = self.events_rx.recv() => self.dispatch(event),
            }
        }

        self.shutdown();
        Ok(())
    }

    fn dispatch(&mut self, event: Event) {
        let effects = self.session.handle(event);
        self.execute(effects);
    }

    fn execute(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::StartCapture { pass, mode } => {
                    tracing::debug!(%pass, ?mode, "starting capture");
                    if let Err(error) = self.engine.start(pass, mode, self.events_tx.clone()) {
                        tracing::warn!(%pass, error = %error, "capture failed to start");
                        self.post(Event::Recognition {
                            pass,
                            event: RecognitionEvent::Error(error),
                        });
                        self.post(Event::Recognition {
                            pass,
                            event: RecognitionEvent::Ended,
                        });
                    }
                }
                Effect::StopCapture { pass } => self.engine.stop(pass),
                Effect::Send { turn, text } => {
                    tracing::debug!(%turn, "sending to backend");
                    let backend = Arc::clone(&self.backend);
                    let events = self.events_tx.clone();
                    self.abort_turn();
                    let handle = tokio::spawn(async move {
                        let result = backend.send(&text).await;
                        if events.send(Event::Reply { turn, result }).is_err() {
                            tracing::trace!(%turn, "event queue closed");
                        }
                    });
                    self.turn = Some((turn, handle));
                }
                Effect::CancelTurn { turn } => {
                    if self.turn.as_ref().is_some_and(|(sent, _)| *sent == turn) {
                        tracing::debug!(%turn, "abandoning backend request");
                        self.abort_turn();
                    }
                }
                Effect::Play { id, audio } => {
                    tracing::debug!(playback = %id, bytes = audio.len(), "playing reply");
                    self.sink.play(id, audio, self.events_tx.clone());
                }
                Effect::StopPlayback { id } => self.sink.stop(id),
                Effect::ArmTimer { id, delay } => {
                    self.abort_timer();
                    let events = self.events_tx.clone();
                    let handle = tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = events.send(Event::Timer(id));
                    });
                    self.timer = Some((id, handle));
                }
                Effect::CancelTimer { id } => {
                    if self.timer.as_ref().is_some_and(|(armed, _)| *armed == id) {
                        self.abort_timer();
                    }
                }
                Effect::Notify(notice) => self.presenter.present(&notice),
            }
        }
    }

    fn post(&self, event: Event) {
        if self.events_tx.send(event).is_err() {
            tracing::trace!("event queue closed");
        }
    }

    fn abort_timer(&mut self) {
        if let Some((_, handle)) = self.timer.take() {
            handle.abort();
        }
    }

    fn abort_turn(&mut self) {
        if let Some((_, handle)) = self.turn.take() {
            handle.abort();
        }
    }

    fn shutdown(&mut self) {
        let effects = self.session.handle(Event::Stop);
        for effect in effects {
            match effect {
                Effect::StopCapture { pass } => self.engine.stop(pass),
                Effect::StopPlayback { id } => self.sink.stop(id),
                _ => {}
            }
        }
        self.abort_timer();
        self.abort_turn();
        tracing::info!("voice controller stopped");
    }
}
