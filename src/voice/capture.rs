//! Microphone capture pipeline
//!
//! Frames raw input into fixed-size blocks, meters each block, encodes it
//! and hands it to the live session's outbound queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, SampleRate, Stream, StreamConfig};

use super::codec::{self, AudioFrame};
use super::resample::StreamResampler;
use crate::live::OutboundSender;
use crate::{Error, Result};

/// Sample rate sent to the remote service (16kHz mono speech)
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Samples per outbound block
pub const BLOCK_SIZE: usize = 4096;

/// Callback receiving mono samples at the device rate
pub type SampleCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// Source of microphone devices
pub trait AudioInput {
    /// Request microphone access and open the device
    ///
    /// # Errors
    ///
    /// Returns `Error::PermissionDenied` if access is refused or no device exists
    fn acquire(&self) -> Result<Box<dyn InputDevice>>;
}

/// An opened microphone
pub trait InputDevice {
    /// Native sample rate of delivered samples
    fn sample_rate(&self) -> u32;

    /// Begin delivering mono samples to `on_samples`
    ///
    /// # Errors
    ///
    /// Returns error if the stream cannot be started
    fn start(&mut self, on_samples: SampleCallback) -> Result<()>;

    /// Stop delivery and release the device
    fn stop(&mut self);
}

/// Most recent input level in [0, 1], shared with the UI
#[derive(Debug, Clone, Default)]
pub struct LevelMeter(Arc<AtomicU32>);

impl LevelMeter {
    /// Create a meter reading zero
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current level
    #[must_use]
    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    /// Store a new level
    pub fn set(&self, level: f32) {
        self.0.store(level.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    /// Reset to silence
    pub fn reset(&self) {
        self.set(0.0);
    }
}

/// Mean absolute amplitude of a block, in [0, 1]
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn mean_abs_level(block: &[f32]) -> f32 {
    if block.is_empty() {
        return 0.0;
    }
    let sum: f32 = block.iter().map(|s| s.abs().min(1.0)).sum();
    (sum / block.len() as f32).clamp(0.0, 1.0)
}

/// Splits a continuous sample stream into fixed-size blocks
#[derive(Debug)]
pub struct BlockFramer {
    block_size: usize,
    pending: Vec<f32>,
}

impl BlockFramer {
    /// Create a framer emitting blocks of `block_size` samples
    #[must_use]
    pub fn new(block_size: usize) -> Self {
        let block_size = block_size.max(1);
        Self {
            block_size,
            pending: Vec::with_capacity(block_size),
        }
    }

    /// Push samples, invoking `on_block` for every completed block
    pub fn push(&mut self, mut samples: &[f32], mut on_block: impl FnMut(&[f32])) {
        while !samples.is_empty() {
            if self.pending.is_empty() && samples.len() >= self.block_size {
                let (block, rest) = samples.split_at(self.block_size);
                on_block(block);
                samples = rest;
                continue;
            }

            let take = (self.block_size - self.pending.len()).min(samples.len());
            self.pending.extend_from_slice(&samples[..take]);
            samples = &samples[take..];

            if self.pending.len() == self.block_size {
                on_block(&self.pending);
                self.pending.clear();
            }
        }
    }

    /// Samples waiting for a full block
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Per-block work done on the capture thread
pub struct CaptureProcessor {
    framer: BlockFramer,
    resampler: Option<StreamResampler>,
    outbound: OutboundSender,
    level: LevelMeter,
    blocks: u64,
}

impl CaptureProcessor {
    /// Create a processor for a device running at `device_rate`
    ///
    /// # Errors
    ///
    /// Returns error if a resampler is needed and cannot be built
    pub fn new(device_rate: u32, outbound: OutboundSender, level: LevelMeter) -> Result<Self> {
        let resampler = if device_rate == INPUT_SAMPLE_RATE {
            None
        } else {
            tracing::debug!(
                from = device_rate,
                to = INPUT_SAMPLE_RATE,
                "capture resampling enabled"
            );
            Some(StreamResampler::new(device_rate, INPUT_SAMPLE_RATE)?)
        };

        Ok(Self {
            framer: BlockFramer::new(BLOCK_SIZE),
            resampler,
            outbound,
            level,
            blocks: 0,
        })
    }

    /// Consume raw device samples
    pub fn process(&mut self, samples: &[f32]) {
        let resampled;
        let input = match self.resampler.as_mut() {
            Some(resampler) => {
                resampled = resampler.process(samples);
                resampled.as_slice()
            }
            None => samples,
        };

        let level = &self.level;
        let outbound = &self.outbound;
        let blocks = &mut self.blocks;
        self.framer.push(input, |block| {
            level.set(mean_abs_level(block));
            let envelope = codec::encode(block, INPUT_SAMPLE_RATE);
            if let Err(e) = outbound.send(envelope) {
                tracing::trace!(error = %e, "outbound block not sent");
            }
            *blocks += 1;
        });
    }

    /// Blocks handed to the outbound queue so far
    #[must_use]
    pub const fn blocks_sent(&self) -> u64 {
        self.blocks
    }
}

/// A running capture; owns the device between `start` and `stop`
pub struct CaptureHandle {
    device: Option<Box<dyn InputDevice>>,
    level: LevelMeter,
}

impl CaptureHandle {
    /// Start streaming `device` into `outbound`
    ///
    /// # Errors
    ///
    /// Returns error if the processor or the device stream cannot start
    pub fn start(
        mut device: Box<dyn InputDevice>,
        outbound: OutboundSender,
        level: LevelMeter,
    ) -> Result<Self> {
        let mut processor = CaptureProcessor::new(device.sample_rate(), outbound, level.clone())?;
        device.start(Box::new(move |samples| processor.process(samples)))?;

        tracing::debug!(
            sample_rate = INPUT_SAMPLE_RATE,
            block_size = BLOCK_SIZE,
            "capture pipeline started"
        );

        Ok(Self {
            device: Some(device),
            level,
        })
    }

    /// Stop capturing and release the device; no-op once stopped
    pub fn stop(&mut self) {
        if let Some(mut device) = self.device.take() {
            device.stop();
            self.level.reset();
            tracing::debug!("capture pipeline stopped");
        }
    }

    /// Whether the device is still held
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.device.is_some()
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Default input device via cpal
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalInput;

impl AudioInput for CpalInput {
    fn acquire(&self) -> Result<Box<dyn InputDevice>> {
        Ok(Box::new(CpalInputDevice::open()?))
    }
}

/// Microphone opened through cpal
pub struct CpalInputDevice {
    device: Device,
    config: StreamConfig,
    stream: Option<Stream>,
}

impl CpalInputDevice {
    /// Open the default input device, preferring 16kHz mono
    ///
    /// # Errors
    ///
    /// Returns `Error::PermissionDenied` if no usable input device exists
    pub fn open() -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| Error::PermissionDenied("no input device available".to_string()))?;

        let native = device
            .supported_input_configs()
            .map_err(|e| Error::PermissionDenied(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.sample_format() == SampleFormat::F32
                    && c.min_sample_rate() <= SampleRate(INPUT_SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(INPUT_SAMPLE_RATE)
            });

        let config = if let Some(supported) = native {
            supported
                .with_sample_rate(SampleRate(INPUT_SAMPLE_RATE))
                .config()
        } else {
            // Fallback: device default, resampled to 16kHz
            let fallback = device
                .default_input_config()
                .map_err(|e| Error::PermissionDenied(e.to_string()))?;
            if fallback.sample_format() != SampleFormat::F32 {
                return Err(Error::Audio(format!(
                    "unsupported input sample format: {:?}",
                    fallback.sample_format()
                )));
            }
            fallback.config()
        };

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            "audio capture initialized"
        );

        Ok(Self {
            device,
            config,
            stream: None,
        })
    }
}

impl InputDevice for CpalInputDevice {
    fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    fn start(&mut self, mut on_samples: SampleCallback) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let channels = usize::from(self.config.channels.max(1));
        let mut mono = Vec::new();

        let stream = self
            .device
            .build_input_stream(
                &self.config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if channels == 1 {
                        on_samples(data);
                        return;
                    }
                    mono.clear();
                    #[allow(clippy::cast_precision_loss)]
                    mono.extend(
                        data.chunks_exact(channels)
                            .map(|frame| frame.iter().sum::<f32>() / channels as f32),
                    );
                    on_samples(&mono);
                },
                |err| {
                    tracing::error!(error = %err, "audio capture error");
                },
                None,
            )
            .map_err(|e| Error::PermissionDenied(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;
        self.stream = Some(stream);

        tracing::debug!("audio capture started");
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            tracing::debug!("audio capture stopped");
        }
    }
}

/// Convert f32 samples to 16-bit mono WAV bytes
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

    let frame = AudioFrame::from_f32(samples, sample_rate, 1);
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in frame.samples() {
            writer
                .write_sample(sample)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framer_emits_fixed_blocks_and_keeps_remainder() {
        let mut framer = BlockFramer::new(4);
        let mut blocks = Vec::new();

        framer.push(&[1.0, 2.0, 3.0], |b| blocks.push(b.to_vec()));
        assert!(blocks.is_empty());
        assert_eq!(framer.pending_len(), 3);

        framer.push(&[4.0, 5.0, 6.0, 7.0, 8.0, 9.0], |b| blocks.push(b.to_vec()));
        assert_eq!(blocks, vec![vec![1.0, 2.0, 3.0, 4.0], vec![5.0, 6.0, 7.0, 8.0]]);
        assert_eq!(framer.pending_len(), 1);
    }

    #[test]
    fn framer_passes_aligned_input_through() {
        let mut framer = BlockFramer::new(2);
        let mut count = 0;
        framer.push(&[0.0; 8], |b| {
            assert_eq!(b.len(), 2);
            count += 1;
        });
        assert_eq!(count, 4);
        assert_eq!(framer.pending_len(), 0);
    }

    #[test]
    fn level_is_mean_absolute_amplitude() {
        assert!((mean_abs_level(&[0.5, -0.5, 0.0, 0.0]) - 0.25).abs() < 1e-6);
        assert!(mean_abs_level(&[]).abs() < f32::EPSILON);
        assert!((mean_abs_level(&[-4.0, 4.0]) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn processor_sends_one_envelope_per_block() {
        let (outbound, mut rx) = OutboundSender::channel(8);
        let level = LevelMeter::new();
        let mut processor = CaptureProcessor::new(INPUT_SAMPLE_RATE, outbound, level.clone()).unwrap();

        processor.process(&vec![0.5; BLOCK_SIZE + 100]);

        let envelope = rx.try_recv().unwrap();
        assert_eq!(envelope.mime_type, "audio/pcm;rate=16000");
        assert_eq!(envelope.to_bytes().unwrap().len(), BLOCK_SIZE * 2);
        assert!(rx.try_recv().is_err());
        assert_eq!(processor.blocks_sent(), 1);
        assert!((level.get() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn wav_has_riff_header() {
        let wav = samples_to_wav(&[0.0, 0.5, -0.5], INPUT_SAMPLE_RATE).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
    }
}
