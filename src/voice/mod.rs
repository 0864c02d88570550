//! Voice processing module
//!
//! The conversation session and the engines it drives: speech capture
//! (microphone or typed lines), wake phrase detection and reply playback.

mod capture;
mod mic;
mod playback;
pub mod recognizer;
mod segmenter;
pub mod session;
pub mod state;
mod stt;
mod wake_word;

pub use capture::{Microphone, SAMPLE_RATE, samples_to_wav};
pub use mic::MicRecognizer;
pub use playback::{AudioGate, AudioSink, CpalPlayback, SilentPlayback, decode_mp3, play_samples, tone};
pub use recognizer::{CaptureMode, EventSender, RecognitionEvent, SpeechEngine, TextRecognizer};
pub use segmenter::{DEFAULT_ENERGY_THRESHOLD, MAX_UTTERANCE, Segment, Segmenter, calculate_energy};
pub use session::{ActivationSource, Effect, Event, Session};
pub use state::{
    AssistantReply, ConversationState, PassId, PlaybackId, RetryBudget, TimerId, TurnId, Utterance,
};
pub use stt::Transcriber;
pub use wake_word::{DetectorState, WakeDetector, extract_command};
