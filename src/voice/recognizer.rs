//! Speech recognition engines
//!
//! An engine runs one capture pass at a time and reports what it hears as
//! [`RecognitionEvent`]s tagged with the pass id. Every pass ends with exactly
//! one `Ended`, whether it finished, failed or was stopped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::RecognitionError;
use crate::voice::session::Event;
use crate::voice::state::PassId;

/// Sender half of the daemon's event queue
pub type EventSender = mpsc::UnboundedSender<Event>;

/// How long a capture pass runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Keep listening until stopped (wake phrase detection)
    Continuous,
    /// End after the first final transcript (a command)
    SingleUtterance,
}

/// Something a capture pass reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    /// Audio capture began
    Started,
    /// Partial transcript
    Interim(String),
    /// Final transcript
    Final(String),
    /// The pass failed
    Error(RecognitionError),
    /// The pass is over; always the last event
    Ended,
}

/// Post a recognition event for `pass`
pub fn emit(events: &EventSender, pass: PassId, event: RecognitionEvent) {
    if events.send(Event::Recognition { pass, event }).is_err() {
        tracing::trace!(%pass, "event queue closed");
    }
}

/// A speech recognition engine
pub trait SpeechEngine {
    /// Begin a capture pass
    ///
    /// # Errors
    ///
    /// Returns error if a pass is still running or the engine cannot start;
    /// in that case no events are emitted for `pass`
    fn start(
        &mut self,
        pass: PassId,
        mode: CaptureMode,
        events: EventSender,
    ) -> Result<(), RecognitionError>;

    /// Ask a pass to stop; it still reports `Ended`, and no error
    fn stop(&mut self, pass: PassId);
}

struct ActivePass {
    pass: PassId,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Engine that treats typed lines as final transcripts
///
/// Lines come from a shared channel fed by the console. A single-utterance
/// pass ends after one line, or reports `no-speech` if nothing is typed
/// before the timeout.
pub struct TextRecognizer {
    lines: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    no_speech_timeout: Duration,
    interim_results: bool,
    active: Option<ActivePass>,
}

impl TextRecognizer {
    /// Create an engine reading from `lines`
    #[must_use]
    pub fn new(
        lines: mpsc::UnboundedReceiver<String>,
        no_speech_timeout: Duration,
        interim_results: bool,
    ) -> Self {
        Self {
            lines: Arc::new(Mutex::new(lines)),
            no_speech_timeout,
            interim_results,
            active: None,
        }
    }
}

impl SpeechEngine for TextRecognizer {
    fn start(
        &mut self,
        pass: PassId,
        mode: CaptureMode,
        events: EventSender,
    ) -> Result<(), RecognitionError> {
        if let Some(active) = &self.active {
            if !active.task.is_finished() {
                tracing::warn!(running = %active.pass, requested = %pass, "capture pass already running");
                return Err(RecognitionError::Engine(format!(
                    "{} is still running",
                    active.pass
                )));
            }
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let lines = Arc::clone(&self.lines);
        let timeout = self.no_speech_timeout;
        let interim = self.interim_results;

        let task = tokio::spawn(async move {
            emit(&events, pass, RecognitionEvent::Started);
            let mut lines = lines.lock().await;
            let deadline = tokio::time::sleep(timeout);
            tokio::pin!(deadline);

            loop {
                let line = tokio::select! {
                    () = token.cancelled() => break,
                    () = &mut deadline, if mode == CaptureMode::SingleUtterance => {
                        emit(&events, pass, RecognitionEvent::Error(RecognitionError::NoSpeech));
                        break;
                    }
                    line = lines.recv() => line,
                };

                let Some(line) = line else {
                    emit(
                        &events,
                        pass,
                        RecognitionEvent::Error(RecognitionError::AudioCapture(
                            "input closed".to_string(),
                        )),
                    );
                    break;
                };

                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                if interim {
                    emit(&events, pass, RecognitionEvent::Interim(text.to_string()));
                }
                emit(&events, pass, RecognitionEvent::Final(text.to_string()));

                if mode == CaptureMode::SingleUtterance {
                    break;
                }
            }

            emit(&events, pass, RecognitionEvent::Ended);
        });

        tracing::debug!(%pass, ?mode, "text capture started");
        self.active = Some(ActivePass { pass, cancel, task });
        Ok(())
    }

    fn stop(&mut self, pass: PassId) {
        if let Some(active) = self.active.as_ref().filter(|a| a.pass == pass) {
            tracing::debug!(%pass, "stopping text capture");
            active.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<RecognitionEvent> {
        let mut out = Vec::new();
        while let Some(event) = rx.recv().await {
            if let Event::Recognition { event, .. } = event {
                let done = event == RecognitionEvent::Ended;
                out.push(event);
                if done {
                    break;
                }
            }
        }
        out
    }

    #[tokio::test]
    async fn single_utterance_ends_after_one_line() {
        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut engine = TextRecognizer::new(line_rx, Duration::from_secs(8), false);

        line_tx.send("what's for dinner".to_string()).unwrap();
        engine.start(PassId(1), CaptureMode::SingleUtterance, tx).unwrap();

        assert_eq!(
            collect(&mut rx).await,
            vec![
                RecognitionEvent::Started,
                RecognitionEvent::Final("what's for dinner".to_string()),
                RecognitionEvent::Ended,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn silence_reports_no_speech() {
        let (_line_tx, line_rx) = mpsc::unbounded_channel::<String>();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut engine = TextRecognizer::new(line_rx, Duration::from_secs(8), true);

        engine.start(PassId(1), CaptureMode::SingleUtterance, tx).unwrap();

        assert_eq!(
            collect(&mut rx).await,
            vec![
                RecognitionEvent::Started,
                RecognitionEvent::Error(RecognitionError::NoSpeech),
                RecognitionEvent::Ended,
            ]
        );
    }

    #[tokio::test]
    async fn stop_ends_without_error() {
        let (_line_tx, line_rx) = mpsc::unbounded_channel::<String>();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut engine = TextRecognizer::new(line_rx, Duration::from_secs(8), false);

        engine.start(PassId(3), CaptureMode::Continuous, tx).unwrap();
        engine.stop(PassId(3));

        assert_eq!(
            collect(&mut rx).await,
            vec![RecognitionEvent::Started, RecognitionEvent::Ended]
        );
    }

    #[tokio::test]
    async fn second_start_is_refused_while_running() {
        let (_line_tx, line_rx) = mpsc::unbounded_channel::<String>();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut engine = TextRecognizer::new(line_rx, Duration::from_secs(8), false);

        engine
            .start(PassId(1), CaptureMode::Continuous, tx.clone())
            .unwrap();
        assert!(engine.start(PassId(2), CaptureMode::Continuous, tx).is_err());
    }
}
