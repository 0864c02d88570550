//! Energy-based utterance segmentation
//!
//! Splits a microphone stream into utterances: speech starts when a chunk's
//! RMS energy crosses the threshold and ends after half a second of silence.

use std::time::Duration;

/// Default RMS energy above which a chunk counts as speech
pub const DEFAULT_ENERGY_THRESHOLD: f32 = 0.03;

/// Longest utterance handed to transcription; longer speech is cut here
pub const MAX_UTTERANCE: Duration = Duration::from_secs(30);

/// Outcome of feeding audio to the segmenter
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    /// A complete utterance: speech followed by silence
    Utterance(Vec<f32>),
    /// Nothing was said within the no-speech timeout
    NoSpeech,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Waiting,
    Speaking,
}

/// Accumulates audio and reports complete utterances
#[derive(Debug)]
pub struct Segmenter {
    threshold: f32,
    min_speech: usize,
    end_silence: usize,
    max_utterance: usize,
    no_speech_limit: Option<usize>,
    phase: Phase,
    buffer: Vec<f32>,
    voiced: usize,
    silence: usize,
    waited: usize,
}

impl Segmenter {
    /// Create a segmenter for audio at `sample_rate`
    ///
    /// With a `no_speech_timeout`, [`Segment::NoSpeech`] is reported once that
    /// much audio has passed without any speech.
    #[must_use]
    pub fn new(sample_rate: u32, threshold: f32, no_speech_timeout: Option<Duration>) -> Self {
        let rate = sample_rate as usize;
        #[allow(clippy::cast_possible_truncation)]
        let max_utterance = rate * MAX_UTTERANCE.as_secs() as usize;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let no_speech_limit = no_speech_timeout
            .map(|timeout| (timeout.as_secs_f64() * f64::from(sample_rate)) as usize);

        Self {
            threshold,
            min_speech: rate * 3 / 10,
            end_silence: rate / 2,
            max_utterance,
            no_speech_limit,
            phase: Phase::Waiting,
            buffer: Vec::new(),
            voiced: 0,
            silence: 0,
            waited: 0,
        }
    }

    /// Feed a chunk of samples
    pub fn push(&mut self, samples: &[f32]) -> Option<Segment> {
        if samples.is_empty() {
            return None;
        }

        let energy = calculate_energy(samples);
        let is_speech = energy > self.threshold;

        match self.phase {
            Phase::Waiting => {
                if is_speech {
                    tracing::trace!(energy, "speech detected");
                    self.phase = Phase::Speaking;
                    self.buffer.clear();
                    self.buffer.extend_from_slice(samples);
                    self.voiced = samples.len();
                    self.silence = 0;
                    return None;
                }

                self.waited += samples.len();
                if let Some(limit) = self.no_speech_limit {
                    if self.waited >= limit {
                        tracing::debug!(waited = self.waited, "no speech before timeout");
                        self.reset();
                        return Some(Segment::NoSpeech);
                    }
                }
            }
            Phase::Speaking => {
                self.buffer.extend_from_slice(samples);
                if is_speech {
                    self.voiced += samples.len();
                    self.silence = 0;
                } else {
                    self.silence += samples.len();
                }

                // Steady noise above the threshold never goes quiet
                if self.buffer.len() >= self.max_utterance {
                    tracing::debug!(samples = self.buffer.len(), "utterance reached length cap");
                    let utterance = std::mem::take(&mut self.buffer);
                    self.reset();
                    return Some(Segment::Utterance(utterance));
                }

                if self.silence > self.end_silence {
                    if self.voiced >= self.min_speech {
                        tracing::debug!(samples = self.buffer.len(), "utterance complete");
                        let utterance = std::mem::take(&mut self.buffer);
                        self.reset();
                        return Some(Segment::Utterance(utterance));
                    }

                    // A blip too short to be speech
                    tracing::trace!(voiced = self.voiced, "discarding short noise");
                    self.waited += self.buffer.len();
                    self.phase = Phase::Waiting;
                    self.buffer.clear();
                    self.voiced = 0;
                    self.silence = 0;
                }
            }
        }

        None
    }

    /// Whether speech is currently being accumulated
    #[must_use]
    pub fn in_speech(&self) -> bool {
        self.phase == Phase::Speaking
    }

    /// Drop buffered audio and restart the no-speech clock
    pub fn reset(&mut self) {
        self.phase = Phase::Waiting;
        self.buffer.clear();
        self.voiced = 0;
        self.silence = 0;
        self.waited = 0;
    }
}

/// Calculate RMS energy of audio samples
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn calculate_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}
