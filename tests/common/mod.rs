//! Shared test utilities
//!
//! In-memory stand-ins for the speech engine, backend, speaker and screen,
//! so the daemon can be driven end to end without devices or network.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kitchen_voice::config::TimingConfig;
use kitchen_voice::voice::{
    ActivationSource, AssistantReply, AudioSink, CaptureMode, ConversationState, Event,
    EventSender, PassId, PlaybackId, RecognitionEvent, Session, SpeechEngine, WakeDetector,
};
use kitchen_voice::{Backend, BackendError, Daemon, Notice, Presenter, RecognitionError};

/// Wake phrase used by the fixtures
pub const WAKE_PHRASE: &str = "hey kitchen";

#[derive(Default)]
struct EngineLog {
    starts: Vec<(PassId, CaptureMode)>,
    stops: Vec<PassId>,
    events: Option<EventSender>,
}

/// Engine whose passes are driven by the test
///
/// Stopping a pass reports `Ended` right away, like a real engine would
/// once its audio stream closes.
#[derive(Clone, Default)]
pub struct ScriptedEngine(Arc<Mutex<EngineLog>>);

impl ScriptedEngine {
    /// Passes started so far
    pub fn starts(&self) -> Vec<(PassId, CaptureMode)> {
        self.0.lock().unwrap().starts.clone()
    }

    /// Passes stopped so far
    pub fn stops(&self) -> Vec<PassId> {
        self.0.lock().unwrap().stops.clone()
    }

    /// Most recently started pass
    pub fn last_pass(&self) -> Option<PassId> {
        self.0.lock().unwrap().starts.last().map(|(pass, _)| *pass)
    }

    /// Report an event for `pass`
    pub fn emit(&self, pass: PassId, event: RecognitionEvent) {
        let log = self.0.lock().unwrap();
        let events = log.events.as_ref().expect("no pass was ever started");
        events.send(Event::Recognition { pass, event }).unwrap();
    }

    /// Report a final transcript and let the pass end
    pub fn say(&self, pass: PassId, text: &str) {
        self.emit(pass, RecognitionEvent::Started);
        self.emit(pass, RecognitionEvent::Final(text.to_string()));
    }

    /// Report a failed pass
    pub fn fail(&self, pass: PassId, error: RecognitionError) {
        self.emit(pass, RecognitionEvent::Error(error));
        self.emit(pass, RecognitionEvent::Ended);
    }
}

impl SpeechEngine for ScriptedEngine {
    fn start(
        &mut self,
        pass: PassId,
        mode: CaptureMode,
        events: EventSender,
    ) -> Result<(), RecognitionError> {
        let mut log = self.0.lock().unwrap();
        log.starts.push((pass, mode));
        log.events = Some(events);
        Ok(())
    }

    fn stop(&mut self, pass: PassId) {
        let mut log = self.0.lock().unwrap();
        log.stops.push(pass);
        if let Some(events) = &log.events {
            let _ = events.send(Event::Recognition {
                pass,
                event: RecognitionEvent::Ended,
            });
        }
    }
}

#[derive(Default)]
struct BackendLog {
    replies: VecDeque<Result<AssistantReply, BackendError>>,
    queries: Vec<String>,
}

/// Backend answering from a queue of canned replies
#[derive(Clone, Default)]
pub struct FakeBackend(Arc<Mutex<BackendLog>>);

impl FakeBackend {
    /// Queue the next reply
    pub fn reply(&self, result: Result<AssistantReply, BackendError>) -> &Self {
        self.0.lock().unwrap().replies.push_back(result);
        self
    }

    /// Queries received so far
    pub fn queries(&self) -> Vec<String> {
        self.0.lock().unwrap().queries.clone()
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn send(&self, utterance: &str) -> Result<AssistantReply, BackendError> {
        let mut log = self.0.lock().unwrap();
        log.queries.push(utterance.to_string());
        log.replies
            .pop_front()
            .unwrap_or_else(|| Ok(AssistantReply::text_only("ok")))
    }
}

#[derive(Default)]
struct SinkLog {
    plays: Vec<(PlaybackId, Vec<u8>)>,
    stops: Vec<PlaybackId>,
}

/// Speaker that records what it was asked to play
///
/// Each playback completes after `duration` of (virtual) time.
#[derive(Clone)]
pub struct RecordingSink {
    log: Arc<Mutex<SinkLog>>,
    duration: Duration,
}

impl RecordingSink {
    /// Sink whose playbacks last `duration`
    pub fn new(duration: Duration) -> Self {
        Self {
            log: Arc::default(),
            duration,
        }
    }

    /// Playbacks started so far
    pub fn plays(&self) -> Vec<(PlaybackId, Vec<u8>)> {
        self.log.lock().unwrap().plays.clone()
    }

    /// Playbacks stopped so far
    pub fn stops(&self) -> Vec<PlaybackId> {
        self.log.lock().unwrap().stops.clone()
    }
}

impl AudioSink for RecordingSink {
    fn play(&mut self, id: PlaybackId, audio: Vec<u8>, events: EventSender) {
        self.log.lock().unwrap().plays.push((id, audio));
        let duration = self.duration;
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = events.send(Event::Playback { id, result: Ok(()) });
        });
    }

    fn stop(&mut self, id: PlaybackId) {
        self.log.lock().unwrap().stops.push(id);
    }
}

/// Presenter that keeps every notice
#[derive(Clone, Default)]
pub struct RecordingPresenter(Arc<Mutex<Vec<Notice>>>);

impl RecordingPresenter {
    /// All notices so far
    pub fn notices(&self) -> Vec<Notice> {
        self.0.lock().unwrap().clone()
    }

    /// State changes so far
    pub fn states(&self) -> Vec<ConversationState> {
        self.notices()
            .into_iter()
            .filter_map(|n| match n {
                Notice::State(state) => Some(state),
                _ => None,
            })
            .collect()
    }

    /// Most recent state
    pub fn state(&self) -> Option<ConversationState> {
        self.states().last().copied()
    }

    /// User-visible errors so far
    pub fn errors(&self) -> Vec<String> {
        self.notices()
            .into_iter()
            .filter_map(|n| match n {
                Notice::Error(message) => Some(message),
                _ => None,
            })
            .collect()
    }
}

impl Presenter for RecordingPresenter {
    fn present(&mut self, notice: &Notice) {
        self.0.lock().unwrap().push(notice.clone());
    }
}

/// Handles onto the fakes inside a daemon
pub struct Harness {
    pub engine: ScriptedEngine,
    pub backend: FakeBackend,
    pub sink: RecordingSink,
    pub screen: RecordingPresenter,
}

/// Build a daemon on fakes; `wake` attaches a wake detector
pub fn daemon(wake: bool, playback: Duration) -> (Daemon, Harness) {
    let sink = RecordingSink::new(playback);
    daemon_with_sink(wake, sink.clone(), Box::new(sink))
}

/// Build a daemon on fakes that plays through `output` instead of the recording sink
pub fn daemon_with_sink(
    wake: bool,
    sink: RecordingSink,
    output: Box<dyn AudioSink>,
) -> (Daemon, Harness) {
    let harness = Harness {
        engine: ScriptedEngine::default(),
        backend: FakeBackend::default(),
        sink,
        screen: RecordingPresenter::default(),
    };
    let daemon = Daemon::new(
        session(wake),
        Box::new(harness.engine.clone()),
        Arc::new(harness.backend.clone()),
        output,
        Box::new(harness.screen.clone()),
    );
    (daemon, harness)
}

/// Session with default timing and a budget of three
pub fn session(wake: bool) -> Session {
    let timing = TimingConfig::default();
    let source = if wake {
        ActivationSource::Wake(WakeDetector::new(WAKE_PHRASE, &timing))
    } else {
        ActivationSource::Manual
    };
    Session::new(source, timing, 3)
}

/// Advance virtual time until the engine has seen `count` starts
pub async fn wait_for_starts(engine: &ScriptedEngine, count: usize) -> PassId {
    for _ in 0..600 {
        if engine.starts().len() >= count {
            return engine.last_pass().unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("expected {count} capture starts, saw {:?}", engine.starts());
}

/// Let pending events settle
pub async fn settle(duration: Duration) {
    tokio::time::sleep(duration).await;
}

/// A reply with audio
pub fn spoken(text: &str, audio: &[u8]) -> Result<AssistantReply, BackendError> {
    Ok(AssistantReply::with_audio(text, audio.to_vec()))
}
