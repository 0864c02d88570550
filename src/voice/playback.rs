//! Audio playback to speakers
//!
//! Every `play` call reports exactly one `Event::Playback` for its id,
//! whether the audio finished, failed or was interrupted.

use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use cpal::SampleRate;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use crate::PlaybackError;
use crate::voice::recognizer::EventSender;
use crate::voice::session::Event;
use crate::voice::state::PlaybackId;

/// Plays reply audio
pub trait AudioSink {
    /// Stop any active playback and start playing `audio`
    fn play(&mut self, id: PlaybackId, audio: Vec<u8>, events: EventSender);

    /// Stop a playback; its completion is still reported
    fn stop(&mut self, id: PlaybackId);

    /// The user interacted with the assistant; audio may play from now on
    fn unlock(&mut self) {}
}

/// Output lock released by the first user gesture
#[derive(Debug, Clone)]
pub struct AudioGate(Arc<AtomicBool>);

impl AudioGate {
    /// Create a gate; locked when `require_gesture` is set
    #[must_use]
    pub fn new(require_gesture: bool) -> Self {
        Self(Arc::new(AtomicBool::new(!require_gesture)))
    }

    /// Allow playback from now on
    pub fn unlock(&self) {
        if !self.0.swap(true, Ordering::SeqCst) {
            tracing::info!("audio unlocked");
        }
    }

    /// Whether playback is allowed
    #[must_use]
    pub fn is_unlocked(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

fn report(events: &EventSender, id: PlaybackId, result: Result<(), PlaybackError>) {
    if events.send(Event::Playback { id, result }).is_err() {
        tracing::trace!(playback = %id, "event queue closed");
    }
}

/// Plays MP3 replies on the default output device
#[derive(Debug)]
pub struct CpalPlayback {
    gate: AudioGate,
    active: Option<(PlaybackId, Arc<AtomicBool>)>,
}

impl CpalPlayback {
    /// Create a player guarded by `gate`
    #[must_use]
    pub const fn new(gate: AudioGate) -> Self {
        Self { gate, active: None }
    }
}

impl AudioSink for CpalPlayback {
    fn play(&mut self, id: PlaybackId, audio: Vec<u8>, events: EventSender) {
        if let Some(previous) = self.active.as_ref().map(|(active, _)| *active) {
            self.stop(previous);
        }

        if !self.gate.is_unlocked() {
            tracing::warn!(playback = %id, "audio locked until user interaction");
            report(&events, id, Err(PlaybackError::AutoplayBlocked));
            return;
        }

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let thread_events = events.clone();

        let spawned = std::thread::Builder::new()
            .name(format!("playback-{id}"))
            .spawn(move || {
                let result = decode_mp3(&audio)
                    .and_then(|(samples, rate)| play_samples(&samples, rate, &thread_stop));
                match &result {
                    Ok(()) => tracing::debug!(playback = %id, "playback complete"),
                    Err(e) => tracing::warn!(playback = %id, error = %e, "playback failed"),
                }
                report(&thread_events, id, result);
            });

        match spawned {
            Ok(_) => {
                tracing::debug!(playback = %id, "playback started");
                self.active = Some((id, stop));
            }
            Err(e) => report(&events, id, Err(PlaybackError::Device(e.to_string()))),
        }
    }

    fn stop(&mut self, id: PlaybackId) {
        if let Some((_, stop)) = self.active.take_if(|(active, _)| *active == id) {
            tracing::debug!(playback = %id, "stopping playback");
            stop.store(true, Ordering::SeqCst);
        }
    }

    fn unlock(&mut self) {
        self.gate.unlock();
    }
}

/// Sink for muted operation: replies complete immediately without sound
#[derive(Debug, Default)]
pub struct SilentPlayback;

impl AudioSink for SilentPlayback {
    fn play(&mut self, id: PlaybackId, audio: Vec<u8>, events: EventSender) {
        tracing::debug!(playback = %id, bytes = audio.len(), "audio muted, skipping playback");
        report(&events, id, Ok(()));
    }

    fn stop(&mut self, _id: PlaybackId) {}
}

/// Play mono samples on the default output device, blocking until done
///
/// # Errors
///
/// Returns `Interrupted` if `stop` is raised, `Device` on output failures
pub fn play_samples(samples: &[f32], sample_rate: u32, stop: &AtomicBool) -> Result<(), PlaybackError> {
    if samples.is_empty() {
        return Ok(());
    }

    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| PlaybackError::Device("no output device available".to_string()))?;

    let rate_fits = |c: &cpal::SupportedStreamConfigRange| {
        c.min_sample_rate() <= SampleRate(sample_rate) && c.max_sample_rate() >= SampleRate(sample_rate)
    };
    let supported = device
        .supported_output_configs()
        .map_err(|e| PlaybackError::Device(e.to_string()))?
        .find(|c| c.channels() == 1 && rate_fits(c))
        .or_else(|| {
            // Fallback: try stereo
            device
                .supported_output_configs()
                .ok()?
                .find(|c| c.channels() == 2 && rate_fits(c))
        })
        .ok_or_else(|| {
            PlaybackError::Device(format!("no output config for {sample_rate} Hz"))
        })?;

    let config = supported.with_sample_rate(SampleRate(sample_rate)).config();
    let channels = usize::from(config.channels.max(1));

    let samples: Arc<Vec<f32>> = Arc::new(samples.to_vec());
    let position = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicBool::new(false));

    let stream = {
        let samples = Arc::clone(&samples);
        let position = Arc::clone(&position);
        let finished = Arc::clone(&finished);
        device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut pos = position.load(Ordering::Relaxed);
                    for frame in data.chunks_mut(channels) {
                        let sample = samples.get(pos).copied().unwrap_or(0.0);
                        frame.fill(sample);
                        if pos < samples.len() {
                            pos += 1;
                        } else {
                            finished.store(true, Ordering::Relaxed);
                        }
                    }
                    position.store(pos, Ordering::Relaxed);
                },
                |err| {
                    tracing::error!(error = %err, "audio playback error");
                },
                None,
            )
            .map_err(|e| PlaybackError::Device(e.to_string()))?
    };

    stream.play().map_err(|e| PlaybackError::Device(e.to_string()))?;

    let duration_ms = (samples.len() as u64 * 1000) / u64::from(sample_rate.max(1));
    let start = Instant::now();
    let timeout = Duration::from_millis(duration_ms + 500);

    while !finished.load(Ordering::Relaxed) {
        if stop.load(Ordering::SeqCst) {
            return Err(PlaybackError::Interrupted);
        }
        if start.elapsed() > timeout {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    // Let the device drain its last buffer
    std::thread::sleep(Duration::from_millis(100));
    drop(stream);
    Ok(())
}

/// Decode MP3 bytes to mono f32 samples and their sample rate
///
/// # Errors
///
/// Returns `Decode` if the payload is not MP3 or contains no frames
pub fn decode_mp3(mp3_data: &[u8]) -> Result<(Vec<f32>, u32), PlaybackError> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = 0u32;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                sample_rate = u32::try_from(frame.sample_rate).unwrap_or(sample_rate);
                if frame.channels == 2 {
                    samples.extend(frame.data.chunks(2).map(|chunk| {
                        let left = f32::from(chunk[0]) / 32768.0;
                        let right = f32::from(chunk.get(1).copied().unwrap_or(chunk[0])) / 32768.0;
                        f32::midpoint(left, right)
                    }));
                } else {
                    samples.extend(frame.data.iter().map(|&s| f32::from(s) / 32768.0));
                }
            }
            Err(minimp3::Error::Eof) => break,
            // Tags and junk ahead of the first frame
            Err(minimp3::Error::SkippedData) => {}
            Err(e) => return Err(PlaybackError::Decode(e.to_string())),
        }
    }

    if samples.is_empty() || sample_rate == 0 {
        return Err(PlaybackError::Decode("no audio frames".to_string()));
    }

    Ok((samples, sample_rate))
}

/// Sine tone for speaker checks
#[must_use]
pub fn tone(frequency: f32, duration: Duration, sample_rate: u32) -> Vec<f32> {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let count = (duration.as_secs_f64() * f64::from(sample_rate)) as usize;
    #[allow(clippy::cast_precision_loss)]
    let rate = sample_rate as f32;

    (0..count)
        .map(|i| {
            #[allow(clippy::cast_precision_loss)]
            let t = i as f32 / rate;
            (t * frequency * std::f32::consts::TAU).sin() * 0.3
        })
        .collect()
}
