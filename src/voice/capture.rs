//! Microphone input
//!
//! The cpal callback forwards each buffer as a mono chunk over a channel;
//! whoever opened the microphone drains it at its own pace.

use std::sync::mpsc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, Stream, StreamConfig};

use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Default input device opened at [`SAMPLE_RATE`]
///
/// The cpal stream is not `Send`; keep this on the thread that opened it.
pub struct Microphone {
    device: Device,
    config: StreamConfig,
    stream: Option<Stream>,
}

impl Microphone {
    /// Open the default input device
    ///
    /// # Errors
    ///
    /// Returns error if there is no input device or none of its configs runs at 16kHz
    pub fn open() -> Result<Self> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| Error::Audio("no input device available".to_string()))?;
        let config = speech_config(&device)?;

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = SAMPLE_RATE,
            channels = config.channels,
            "microphone opened"
        );

        Ok(Self {
            device,
            config,
            stream: None,
        })
    }

    /// Start the input stream and return the receiving end of its chunks
    ///
    /// Calling this again replaces the previous stream; its receiver then
    /// reports disconnection.
    ///
    /// # Errors
    ///
    /// Returns error if the input stream cannot be built or started
    pub fn listen(&mut self) -> Result<mpsc::Receiver<Vec<f32>>> {
        self.close();

        let (tx, rx) = mpsc::channel();
        let channels = usize::from(self.config.channels.max(1));

        let stream = self
            .device
            .build_input_stream(
                &self.config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    // Receiver gone means nobody is listening any more
                    let _ = tx.send(downmix(data, channels));
                },
                |err| tracing::error!(error = %err, "microphone stream error"),
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;
        self.stream = Some(stream);

        tracing::debug!("microphone listening");
        Ok(rx)
    }

    /// Stop the input stream
    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            tracing::debug!("microphone closed");
        }
    }
}

impl Drop for Microphone {
    fn drop(&mut self) {
        self.close();
    }
}

/// Pick a 16kHz input config, mono if the device offers one
fn speech_config(device: &Device) -> Result<StreamConfig> {
    let at_speech_rate = |c: &cpal::SupportedStreamConfigRange| {
        (c.min_sample_rate()..=c.max_sample_rate()).contains(&SampleRate(SAMPLE_RATE))
    };

    let range = device
        .supported_input_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .filter(at_speech_rate)
        .min_by_key(cpal::SupportedStreamConfigRange::channels)
        .ok_or_else(|| Error::Audio("no input config supports 16kHz".to_string()))?;

    Ok(range.with_sample_rate(SampleRate(SAMPLE_RATE)).config())
}

/// Average interleaved frames down to one channel
#[allow(clippy::cast_precision_loss)]
fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Convert f32 samples to 16-bit mono WAV bytes for transcription
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let wav_err = |e: hound::Error| Error::Audio(e.to_string());

    let mut cursor = std::io::Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    let mut writer = hound::WavWriter::new(&mut cursor, spec).map_err(wav_err)?;
    for &sample in samples {
        #[allow(clippy::cast_possible_truncation)]
        writer
            .write_sample((sample * 32767.0).clamp(-32768.0, 32767.0) as i16)
            .map_err(wav_err)?;
    }
    writer.finalize().map_err(wav_err)?;

    Ok(cursor.into_inner())
}
