//! Conversation flows driven end to end through the daemon
//!
//! Runs on a paused clock so the restart delays elapse instantly.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_test::assert_ok;

use kitchen_voice::voice::{
    AssistantReply, AudioGate, CaptureMode, ConversationState, CpalPlayback, EventSender, PassId,
    RecognitionEvent, SpeechEngine,
};
use kitchen_voice::{Backend, BackendError, Control, Daemon, RecognitionError};

mod common;

use common::{Harness, RecordingSink};
use ConversationState::{
    Activating, AwaitingReply, ErrorRecovering, Idle, Recording, Speaking, WakeListening,
};

const QUERY: &str = "what can I cook with chicken and rice";

async fn wait_for_plays(harness: &Harness, count: usize) {
    for _ in 0..600 {
        if harness.sink.plays().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("expected {count} playbacks");
}

#[tokio::test(start_paused = true)]
async fn round_trip_plays_reply_then_listens_again() {
    let (mut daemon, h) = common::daemon(false, Duration::from_secs(1));
    h.backend.reply(common::spoken("Try fried rice", &[0xFF, 0xFB, 0x90, 0x00]));
    let (controls, rx) = mpsc::channel(8);

    let script = async {
        controls.send(Control::Activate).await.unwrap();
        let pass = common::wait_for_starts(&h.engine, 1).await;
        h.engine.say(pass, QUERY);
        common::wait_for_starts(&h.engine, 2).await;
        controls.send(Control::Shutdown).await.unwrap();
    };
    let (result, ()) = tokio::join!(daemon.run(rx), script);
    assert_ok!(result);

    assert_eq!(h.backend.queries(), vec![QUERY.to_string()]);
    let plays = h.sink.plays();
    assert_eq!(plays.len(), 1);
    assert_eq!(plays[0].1, vec![0xFF, 0xFB, 0x90, 0x00]);
    assert_eq!(
        h.screen.states(),
        vec![Idle, Activating, Recording, AwaitingReply, Speaking, Activating, Recording]
    );
}

#[tokio::test(start_paused = true)]
async fn text_only_reply_returns_to_recording() {
    let (mut daemon, h) = common::daemon(false, Duration::from_secs(1));
    h.backend.reply(Ok(AssistantReply::text_only("Try fried rice")));
    let (controls, rx) = mpsc::channel(8);

    let script = async {
        controls.send(Control::Activate).await.unwrap();
        let pass = common::wait_for_starts(&h.engine, 1).await;
        h.engine.say(pass, QUERY);
        common::wait_for_starts(&h.engine, 2).await;
        controls.send(Control::Shutdown).await.unwrap();
    };
    let (result, ()) = tokio::join!(daemon.run(rx), script);
    assert_ok!(result);

    assert!(h.sink.plays().is_empty());
    assert_eq!(
        h.screen.states(),
        vec![Idle, Activating, Recording, AwaitingReply, Activating, Recording]
    );
}

#[tokio::test(start_paused = true)]
async fn backend_error_surfaces_once_and_goes_idle() {
    let (mut daemon, h) = common::daemon(false, Duration::from_secs(1));
    h.backend.reply(Err(BackendError::Status {
        status: 500,
        message: "Internal Server Error".into(),
    }));
    let (controls, rx) = mpsc::channel(8);

    let script = async {
        controls.send(Control::Activate).await.unwrap();
        let pass = common::wait_for_starts(&h.engine, 1).await;
        h.engine.say(pass, QUERY);
        common::settle(Duration::from_secs(10)).await;
        controls.send(Control::Shutdown).await.unwrap();
    };
    let (result, ()) = tokio::join!(daemon.run(rx), script);
    assert_ok!(result);

    assert_eq!(h.screen.errors().len(), 1);
    assert!(h.sink.plays().is_empty());
    assert_eq!(h.engine.starts().len(), 1);
    assert_eq!(
        h.screen.states(),
        vec![Idle, Activating, Recording, AwaitingReply, ErrorRecovering, Idle]
    );
}

#[tokio::test(start_paused = true)]
async fn wake_mode_returns_to_wake_listening_after_backend_error() {
    let (mut daemon, h) = common::daemon(true, Duration::from_secs(1));
    h.backend
        .reply(Err(BackendError::Transport("connection refused".into())));
    let (controls, rx) = mpsc::channel(8);

    let script = async {
        let wake_pass = common::wait_for_starts(&h.engine, 1).await;
        h.engine.say(wake_pass, "please hey kitchen can you help");
        let pass = common::wait_for_starts(&h.engine, 2).await;
        h.engine.say(pass, QUERY);
        common::wait_for_starts(&h.engine, 3).await;
        controls.send(Control::Shutdown).await.unwrap();
    };
    let (result, ()) = tokio::join!(daemon.run(rx), script);
    assert_ok!(result);

    let modes: Vec<CaptureMode> = h.engine.starts().into_iter().map(|(_, mode)| mode).collect();
    assert_eq!(
        modes,
        vec![
            CaptureMode::Continuous,
            CaptureMode::SingleUtterance,
            CaptureMode::Continuous
        ]
    );
    assert_eq!(h.screen.errors().len(), 1);
    assert_eq!(h.screen.state(), Some(WakeListening));
}

#[tokio::test(start_paused = true)]
async fn near_miss_does_not_wake() {
    let (mut daemon, h) = common::daemon(true, Duration::from_secs(1));
    let (controls, rx) = mpsc::channel(8);

    let script = async {
        let wake_pass = common::wait_for_starts(&h.engine, 1).await;
        h.engine.say(wake_pass, "hey kitten");
        common::settle(Duration::from_secs(5)).await;
        controls.send(Control::Shutdown).await.unwrap();
    };
    let (result, ()) = tokio::join!(daemon.run(rx), script);
    assert_ok!(result);

    assert_eq!(h.engine.starts().len(), 1);
    assert_eq!(h.screen.states(), vec![Idle, WakeListening]);
}

#[tokio::test(start_paused = true)]
async fn stop_while_speaking_is_immediate() {
    let (mut daemon, h) = common::daemon(false, Duration::from_secs(30));
    h.backend.reply(common::spoken("A long recipe", &[1, 2, 3]));
    let (controls, rx) = mpsc::channel(8);

    let script = async {
        controls.send(Control::Activate).await.unwrap();
        let pass = common::wait_for_starts(&h.engine, 1).await;
        h.engine.say(pass, QUERY);
        wait_for_plays(&h, 1).await;
        controls.send(Control::Stop).await.unwrap();
        // The cancelled playback still reports completion at 30s
        common::settle(Duration::from_secs(60)).await;
        controls.send(Control::Shutdown).await.unwrap();
    };
    let (result, ()) = tokio::join!(daemon.run(rx), script);
    assert_ok!(result);

    let played = h.sink.plays()[0].0;
    assert_eq!(h.sink.stops(), vec![played]);
    assert_eq!(h.engine.starts().len(), 1);
    assert_eq!(
        h.screen.states(),
        vec![Idle, Activating, Recording, AwaitingReply, Speaking, Idle]
    );
}

#[tokio::test(start_paused = true)]
async fn toggle_starts_and_stops() {
    let (mut daemon, h) = common::daemon(false, Duration::from_secs(1));
    let (controls, rx) = mpsc::channel(8);

    let script = async {
        controls.send(Control::Toggle).await.unwrap();
        let pass = common::wait_for_starts(&h.engine, 1).await;
        controls.send(Control::Toggle).await.unwrap();
        common::settle(Duration::from_secs(5)).await;
        controls.send(Control::Shutdown).await.unwrap();
        pass
    };
    let (result, pass) = tokio::join!(daemon.run(rx), script);
    assert_ok!(result);

    assert_eq!(h.engine.stops(), vec![pass]);
    assert_eq!(h.engine.starts().len(), 1);
    assert_eq!(h.screen.state(), Some(Idle));
}

#[tokio::test(start_paused = true)]
async fn passes_that_fail_before_starting_end_the_conversation() {
    let (mut daemon, h) = common::daemon(false, Duration::from_secs(1));
    let (controls, rx) = mpsc::channel(8);

    let script = async {
        controls.send(Control::Activate).await.unwrap();
        for attempt in 1..=3 {
            let pass = common::wait_for_starts(&h.engine, attempt).await;
            h.engine.fail(pass, RecognitionError::NoSpeech);
        }
        common::settle(Duration::from_secs(10)).await;
        controls.send(Control::Shutdown).await.unwrap();
    };
    let (result, ()) = tokio::join!(daemon.run(rx), script);
    assert_ok!(result);

    assert_eq!(h.engine.starts().len(), 3);
    assert_eq!(h.screen.errors().len(), 3);
    assert_eq!(h.screen.state(), Some(Idle));
    assert!(h.backend.queries().is_empty());
}

#[tokio::test(start_paused = true)]
async fn started_passes_that_hear_nothing_keep_restarting() {
    let (mut daemon, h) = common::daemon(false, Duration::from_secs(1));
    let (controls, rx) = mpsc::channel(8);

    let script = async {
        controls.send(Control::Activate).await.unwrap();
        for attempt in 1..=5 {
            let pass = common::wait_for_starts(&h.engine, attempt).await;
            h.engine.emit(pass, RecognitionEvent::Started);
            h.engine.fail(pass, RecognitionError::NoSpeech);
        }
        common::wait_for_starts(&h.engine, 6).await;
        controls.send(Control::Shutdown).await.unwrap();
    };
    let (result, ()) = tokio::join!(daemon.run(rx), script);
    assert_ok!(result);

    // Opening the microphone counts as progress, so the budget never runs out
    assert_eq!(h.screen.errors().len(), 5);
    assert_eq!(h.screen.state(), Some(Recording));
    assert!(!h.screen.states()[1..].contains(&Idle));
}

#[tokio::test(start_paused = true)]
async fn aborted_passes_do_not_use_up_retries() {
    let (mut daemon, h) = common::daemon(false, Duration::from_secs(1));
    let (controls, rx) = mpsc::channel(8);

    let script = async {
        controls.send(Control::Activate).await.unwrap();
        for attempt in 1..=4 {
            let pass = common::wait_for_starts(&h.engine, attempt).await;
            h.engine.fail(pass, RecognitionError::Aborted);
        }
        common::wait_for_starts(&h.engine, 5).await;
        controls.send(Control::Shutdown).await.unwrap();
    };
    let (result, ()) = tokio::join!(daemon.run(rx), script);
    assert_ok!(result);

    assert!(h.screen.errors().is_empty());
    assert_eq!(h.screen.state(), Some(Recording));
}

#[tokio::test(start_paused = true)]
async fn blocked_audio_continues_with_text_only() {
    let sink = RecordingSink::new(Duration::from_secs(1));
    let output = Box::new(CpalPlayback::new(AudioGate::new(true)));
    let (mut daemon, h) = common::daemon_with_sink(true, sink, output);
    h.backend.reply(common::spoken("Try fried rice", &[1, 2, 3]));
    let (controls, rx) = mpsc::channel(8);

    let script = async {
        let wake_pass = common::wait_for_starts(&h.engine, 1).await;
        h.engine.say(wake_pass, "hey kitchen");
        let pass = common::wait_for_starts(&h.engine, 2).await;
        h.engine.say(pass, QUERY);
        common::wait_for_starts(&h.engine, 3).await;
        controls.send(Control::Shutdown).await.unwrap();
    };
    let (result, ()) = tokio::join!(daemon.run(rx), script);
    assert_ok!(result);

    let errors = h.screen.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("text only"));
    assert_eq!(h.screen.state(), Some(Recording));
}

/// Engine that can never open the microphone
struct RefusingEngine;

impl SpeechEngine for RefusingEngine {
    fn start(
        &mut self,
        _pass: PassId,
        _mode: CaptureMode,
        _events: EventSender,
    ) -> Result<(), RecognitionError> {
        Err(RecognitionError::NotAllowed)
    }

    fn stop(&mut self, _pass: PassId) {}
}

#[tokio::test(start_paused = true)]
async fn engine_that_cannot_start_exhausts_retries() {
    let screen = common::RecordingPresenter::default();
    let mut daemon = Daemon::new(
        common::session(false),
        Box::new(RefusingEngine),
        Arc::new(common::FakeBackend::default()),
        Box::new(RecordingSink::new(Duration::from_secs(1))),
        Box::new(screen.clone()),
    );
    let (controls, rx) = mpsc::channel(8);

    let script = async {
        controls.send(Control::Activate).await.unwrap();
        common::settle(Duration::from_secs(10)).await;
        controls.send(Control::Shutdown).await.unwrap();
    };
    let (result, ()) = tokio::join!(daemon.run(rx), script);
    assert_ok!(result);

    assert_eq!(screen.errors().len(), 3);
    assert_eq!(screen.state(), Some(Idle));
    assert_eq!(daemon.session().state(), Idle);
}

/// Backend that never answers and flags when its request is dropped
#[derive(Clone, Default)]
struct HangingBackend(Arc<AtomicBool>);

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Backend for HangingBackend {
    async fn send(&self, _utterance: &str) -> Result<AssistantReply, BackendError> {
        let _flag = DropFlag(Arc::clone(&self.0));
        std::future::pending().await
    }
}

#[tokio::test(start_paused = true)]
async fn stop_abandons_pending_backend_request() {
    let engine = common::ScriptedEngine::default();
    let backend = HangingBackend::default();
    let screen = common::RecordingPresenter::default();
    let mut daemon = Daemon::new(
        common::session(false),
        Box::new(engine.clone()),
        Arc::new(backend.clone()),
        Box::new(RecordingSink::new(Duration::from_secs(1))),
        Box::new(screen.clone()),
    );
    let (controls, rx) = mpsc::channel(8);

    let script = async {
        controls.send(Control::Activate).await.unwrap();
        let pass = common::wait_for_starts(&engine, 1).await;
        engine.say(pass, QUERY);
        common::settle(Duration::from_secs(1)).await;
        let pending_before_stop = !backend.0.load(Ordering::SeqCst);

        controls.send(Control::Stop).await.unwrap();
        common::settle(Duration::from_secs(1)).await;
        controls.send(Control::Shutdown).await.unwrap();
        pending_before_stop
    };
    let (result, pending_before_stop) = tokio::join!(daemon.run(rx), script);
    assert_ok!(result);

    assert!(pending_before_stop);
    assert!(backend.0.load(Ordering::SeqCst));
    assert_eq!(
        screen.states(),
        vec![Idle, Activating, Recording, AwaitingReply, Idle]
    );
}
