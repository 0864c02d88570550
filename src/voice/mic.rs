//! Microphone recognition engine
//!
//! A capture thread owns the cpal stream and cuts the signal into
//! utterances; an async task transcribes each utterance over HTTP and
//! reports it as a final transcript. The task reports `Ended` once the
//! thread has finished and the last utterance is transcribed, or as soon as
//! the pass is stopped, abandoning any transcription still in flight.

use std::sync::Arc;
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::RecognitionError;
use crate::config::RecognitionConfig;
use crate::voice::capture::{Microphone, SAMPLE_RATE, samples_to_wav};
use crate::voice::recognizer::{CaptureMode, EventSender, RecognitionEvent, SpeechEngine, emit};
use crate::voice::segmenter::{Segment, Segmenter};
use crate::voice::state::PassId;
use crate::voice::stt::Transcriber;

/// How long the capture thread waits for audio before checking for a stop
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Interim text shown while an utterance is being transcribed
const INTERIM_PLACEHOLDER: &str = "...";

struct ActivePass {
    pass: PassId,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Engine backed by the default microphone and a transcription endpoint
pub struct MicRecognizer {
    transcriber: Arc<Transcriber>,
    energy_threshold: f32,
    no_speech_timeout: Duration,
    interim_results: bool,
    active: Option<ActivePass>,
}

impl MicRecognizer {
    /// Create a microphone engine
    #[must_use]
    pub fn new(transcriber: Transcriber, config: &RecognitionConfig) -> Self {
        Self {
            transcriber: Arc::new(transcriber),
            energy_threshold: config.energy_threshold,
            no_speech_timeout: config.no_speech_timeout,
            interim_results: config.interim_results,
            active: None,
        }
    }
}

impl SpeechEngine for MicRecognizer {
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
        let (segment_tx, segment_rx) = mpsc::unbounded_channel::<Vec<f32>>();

        let timeout = match mode {
            CaptureMode::SingleUtterance => Some(self.no_speech_timeout),
            CaptureMode::Continuous => None,
        };
        let segmenter = Segmenter::new(SAMPLE_RATE, self.energy_threshold, timeout);

        let thread_cancel = cancel.clone();
        let thread_events = events.clone();
        let interim = self.interim_results;
        std::thread::Builder::new()
            .name(format!("capture-{pass}"))
            .spawn(move || {
                capture_loop(
                    pass,
                    mode,
                    segmenter,
                    &thread_cancel,
                    &thread_events,
                    &segment_tx,
                    interim,
                );
            })
            .map_err(|e| RecognitionError::AudioCapture(e.to_string()))?;

        let task = tokio::spawn(transcribe_segments(
            pass,
            mode,
            Arc::clone(&self.transcriber),
            segment_rx,
            cancel.clone(),
            events,
        ));

        tracing::debug!(%pass, ?mode, "microphone capture started");
        self.active = Some(ActivePass { pass, cancel, task });
        Ok(())
    }

    fn stop(&mut self, pass: PassId) {
        if let Some(active) = self.active.as_ref().filter(|a| a.pass == pass) {
            tracing::debug!(%pass, "stopping microphone capture");
            active.cancel.cancel();
        }
    }
}

/// Transcribe each segment of `pass` until the capture thread is done or the pass is stopped
async fn transcribe_segments(
    pass: PassId,
    mode: CaptureMode,
    transcriber: Arc<Transcriber>,
    mut segments: mpsc::UnboundedReceiver<Vec<f32>>,
    cancel: CancellationToken,
    events: EventSender,
) {
    loop {
        let samples = tokio::select! {
            () = cancel.cancelled() => break,
            samples = segments.recv() => match samples {
                Some(samples) => samples,
                None => break,
            },
        };

        let result = tokio::select! {
            () = cancel.cancelled() => {
                tracing::debug!(%pass, "pass stopped, abandoning transcription");
                break;
            }
            result = transcribe(&transcriber, &samples) => result,
        };

        match result {
            Ok(text) if !text.is_empty() => {
                emit(&events, pass, RecognitionEvent::Final(text));
            }
            Ok(_) => {
                if mode == CaptureMode::SingleUtterance {
                    emit(&events, pass, RecognitionEvent::Error(RecognitionError::NoSpeech));
                }
            }
            Err(error) => emit(&events, pass, RecognitionEvent::Error(error)),
        }
    }
    emit(&events, pass, RecognitionEvent::Ended);
}

async fn transcribe(transcriber: &Transcriber, samples: &[f32]) -> Result<String, RecognitionError> {
    let wav = samples_to_wav(samples, SAMPLE_RATE)
        .map_err(|e| RecognitionError::Engine(e.to_string()))?;
    transcriber
        .transcribe(wav)
        .await
        .map_err(|e| RecognitionError::Network(e.to_string()))
}

/// Runs on the capture thread; dropping `segments` on return ends the pass
fn capture_loop(
    pass: PassId,
    mode: CaptureMode,
    mut segmenter: Segmenter,
    cancel: &CancellationToken,
    events: &EventSender,
    segments: &mpsc::UnboundedSender<Vec<f32>>,
    interim: bool,
) {
    let opened = Microphone::open().and_then(|mut microphone| {
        let chunks = microphone.listen()?;
        Ok((microphone, chunks))
    });
    let (mut microphone, chunks) = match opened {
        Ok(opened) => opened,
        Err(e) => {
            tracing::error!(%pass, error = %e, "failed to open microphone");
            emit(events, pass, RecognitionEvent::Error(RecognitionError::AudioCapture(e.to_string())));
            return;
        }
    };

    emit(events, pass, RecognitionEvent::Started);
    let mut was_speaking = false;

    while !cancel.is_cancelled() {
        let mut samples = match chunks.recv_timeout(POLL_INTERVAL) {
            Ok(chunk) => chunk,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                let error = RecognitionError::AudioCapture("input stream closed".to_string());
                emit(events, pass, RecognitionEvent::Error(error));
                break;
            }
        };
        samples.extend(chunks.try_iter().flatten());

        match segmenter.push(&samples) {
            Some(Segment::Utterance(utterance)) => {
                was_speaking = false;
                if segments.send(utterance).is_err() || mode == CaptureMode::SingleUtterance {
                    break;
                }
            }
            Some(Segment::NoSpeech) => {
                emit(events, pass, RecognitionEvent::Error(RecognitionError::NoSpeech));
                break;
            }
            None => {
                let speaking = segmenter.in_speech();
                if interim && speaking && !was_speaking {
                    emit(events, pass, RecognitionEvent::Interim(INTERIM_PLACEHOLDER.to_string()));
                }
                was_speaking = speaking;
            }
        }
    }

    microphone.close();
    tracing::debug!(%pass, "capture thread finished");
}
