//! Scheduled playback of model speech
//!
//! Inbound frames are decoded up front and placed on a shared audio clock at
//! `max(cursor, now)`, so consecutive frames play back-to-back in arrival
//! order no matter how the network spaced them. The cpal output callback owns
//! a [`Mixer`] that renders whatever is scheduled; it never blocks on the
//! control side, which talks to it through a command channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, Stream};
use tokio::sync::mpsc;

use super::codec::AudioFrame;
use super::resample;
use crate::{Error, Result};

/// Sample rate of model speech (and preferred output rate)
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Identifies one scheduled buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(u64);

impl UnitId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Notification from the output device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// A unit finished playing on its own
    Ended(UnitId),
    /// The output device failed
    Failed(String),
}

/// Decoded mono samples at the output rate
#[derive(Debug, Clone)]
pub struct PlaybackBuffer {
    samples: Arc<[f32]>,
    sample_rate: u32,
}

impl PlaybackBuffer {
    /// Wrap samples already at `sample_rate`
    #[must_use]
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    /// Decode a frame for an output running at `output_rate`
    ///
    /// # Errors
    ///
    /// Returns `Error::Playback` if resampling fails
    pub fn from_frame(frame: &AudioFrame, output_rate: u32) -> Result<Self> {
        let mono = frame.to_mono_f32();
        let samples = resample::resample(&mono, frame.sample_rate(), output_rate)
            .map_err(|e| Error::Playback(e.to_string()))?;
        Ok(Self::new(samples, output_rate))
    }

    #[must_use]
    pub fn samples(&self) -> &Arc<[f32]> {
        &self.samples
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration in seconds
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / f64::from(self.sample_rate)
    }
}

/// A buffer bound to a start time on the audio clock
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackUnit {
    pub id: UnitId,
    /// Scheduled start, seconds on the output clock
    pub start_time: f64,
    /// Length in seconds
    pub duration: f64,
}

impl PlaybackUnit {
    #[must_use]
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }
}

/// Audio output with a monotonic clock and one shared gain stage
pub trait AudioOutput {
    /// Rate buffers must be supplied at
    fn sample_rate(&self) -> u32;

    /// Current position of the output clock, in seconds
    fn current_time(&self) -> f64;

    /// Play `buffer` starting at `start_time`
    ///
    /// # Errors
    ///
    /// Returns `Error::Playback` if the output is no longer running
    fn schedule(&mut self, id: UnitId, buffer: PlaybackBuffer, start_time: f64) -> Result<()>;

    /// Stop a unit immediately, whether playing or pending
    fn stop(&mut self, id: UnitId);

    /// Set the shared output gain
    fn set_gain(&mut self, gain: f32);
}

/// Serializes inbound audio onto the output clock
pub struct PlaybackScheduler {
    output: Box<dyn AudioOutput>,
    cursor: f64,
    active: HashMap<UnitId, PlaybackUnit>,
    next_id: u64,
    muted: bool,
}

impl PlaybackScheduler {
    #[must_use]
    pub fn new(output: Box<dyn AudioOutput>) -> Self {
        Self {
            output,
            cursor: 0.0,
            active: HashMap::new(),
            next_id: 1,
            muted: false,
        }
    }

    /// Decode and schedule a frame right after everything already queued
    ///
    /// Returns `None` for frames carrying no audio.
    ///
    /// # Errors
    ///
    /// Returns `Error::Playback` if decoding or scheduling fails
    pub fn enqueue(&mut self, frame: &AudioFrame) -> Result<Option<PlaybackUnit>> {
        let buffer = PlaybackBuffer::from_frame(frame, self.output.sample_rate())?;
        if buffer.is_empty() {
            return Ok(None);
        }

        let id = UnitId(self.next_id);
        self.next_id += 1;

        let start_time = self.cursor.max(self.output.current_time());
        let duration = buffer.duration_secs();
        self.output.schedule(id, buffer, start_time)?;

        let unit = PlaybackUnit {
            id,
            start_time,
            duration,
        };
        self.cursor = unit.end_time();
        self.active.insert(id, unit);

        tracing::trace!(
            unit = id.get(),
            start_time,
            duration,
            active = self.active.len(),
            "scheduled playback unit"
        );
        Ok(Some(unit))
    }

    /// Forget a unit that finished on its own
    pub fn on_unit_ended(&mut self, id: UnitId) -> bool {
        self.active.remove(&id).is_some()
    }

    /// Barge-in: stop everything and schedule the next frame at "now"
    pub fn interrupt(&mut self) {
        let stopped = self.stop_all();
        self.cursor = self.output.current_time();
        tracing::debug!(stopped, cursor = self.cursor, "playback interrupted");
    }

    /// Stop everything and rewind the cursor to zero
    pub fn reset(&mut self) {
        let stopped = self.stop_all();
        self.cursor = 0.0;
        if stopped > 0 {
            tracing::debug!(stopped, "playback reset");
        }
    }

    fn stop_all(&mut self) -> usize {
        let stopped = self.active.len();
        for (id, _) in self.active.drain() {
            self.output.stop(id);
        }
        stopped
    }

    /// Silence or restore output without touching the schedule
    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        self.output.set_gain(if muted { 0.0 } else { 1.0 });
    }

    #[must_use]
    pub const fn is_muted(&self) -> bool {
        self.muted
    }

    /// Next free start time on the output clock
    #[must_use]
    pub const fn cursor(&self) -> f64 {
        self.cursor
    }

    /// Number of playing or pending units
    #[must_use]
    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    #[must_use]
    pub fn is_active(&self, id: UnitId) -> bool {
        self.active.contains_key(&id)
    }

    /// Current time of the output clock
    #[must_use]
    pub fn current_time(&self) -> f64 {
        self.output.current_time()
    }
}

/// Output clock counted in rendered frames
#[derive(Debug, Clone)]
pub struct AudioClock {
    frames: Arc<AtomicU64>,
    sample_rate: u32,
}

impl AudioClock {
    #[must_use]
    pub fn new(sample_rate: u32) -> Self {
        Self {
            frames: Arc::new(AtomicU64::new(0)),
            sample_rate: sample_rate.max(1),
        }
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Frames rendered so far
    #[must_use]
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    /// Seconds rendered so far
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn now(&self) -> f64 {
        self.frames() as f64 / f64::from(self.sample_rate)
    }

    /// Frame index of a clock time
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn frame_at(&self, time: f64) -> u64 {
        (time.max(0.0) * f64::from(self.sample_rate)).round() as u64
    }

    fn advance(&self, frames: u64) {
        self.frames.fetch_add(frames, Ordering::AcqRel);
    }
}

/// Gain applied to the mixed output
#[derive(Debug, Clone)]
pub struct SharedGain(Arc<AtomicU32>);

impl Default for SharedGain {
    fn default() -> Self {
        Self(Arc::new(AtomicU32::new(1.0_f32.to_bits())))
    }
}

impl SharedGain {
    #[must_use]
    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, gain: f32) {
        self.0.store(gain.max(0.0).to_bits(), Ordering::Relaxed);
    }
}

/// Request from the control side to the render callback
#[derive(Debug)]
pub enum MixerCommand {
    Schedule {
        id: UnitId,
        start_frame: u64,
        samples: Arc<[f32]>,
    },
    Stop(UnitId),
}

#[derive(Debug)]
struct Voice {
    id: UnitId,
    start_frame: u64,
    samples: Arc<[f32]>,
    position: usize,
}

/// Render-side state, owned by the output callback
pub struct Mixer {
    commands: std::sync::mpsc::Receiver<MixerCommand>,
    voices: Vec<Voice>,
    clock: AudioClock,
    gain: SharedGain,
    events: mpsc::UnboundedSender<PlaybackEvent>,
}

impl Mixer {
    #[must_use]
    pub fn new(
        commands: std::sync::mpsc::Receiver<MixerCommand>,
        clock: AudioClock,
        gain: SharedGain,
        events: mpsc::UnboundedSender<PlaybackEvent>,
    ) -> Self {
        Self {
            commands,
            voices: Vec::with_capacity(32),
            clock,
            gain,
            events,
        }
    }

    /// Fill one interleaved output buffer and advance the clock
    pub fn render(&mut self, out: &mut [f32], channels: usize) {
        let now = self.clock.frames();

        while let Ok(command) = self.commands.try_recv() {
            match command {
                MixerCommand::Schedule {
                    id,
                    start_frame,
                    samples,
                } => {
                    // A late voice skips what it missed so later units stay aligned
                    let late =
                        usize::try_from(now.saturating_sub(start_frame)).unwrap_or(usize::MAX);
                    let position = late.min(samples.len());
                    self.voices.push(Voice {
                        id,
                        start_frame,
                        samples,
                        position,
                    });
                }
                MixerCommand::Stop(id) => self.voices.retain(|v| v.id != id),
            }
        }

        out.fill(0.0);
        let channels = channels.max(1);
        let frames = out.len() / channels;

        for voice in &mut self.voices {
            let offset =
                usize::try_from(voice.start_frame.saturating_sub(now)).unwrap_or(usize::MAX);
            if offset >= frames {
                continue;
            }
            let remaining = voice.samples.len() - voice.position;
            let count = remaining.min(frames - offset);
            let span = &voice.samples[voice.position..voice.position + count];
            for (frame, &sample) in out[offset * channels..].chunks_mut(channels).zip(span) {
                for slot in frame {
                    *slot += sample;
                }
            }
            voice.position += count;
        }

        let gain = self.gain.get();
        for slot in out.iter_mut() {
            *slot = (*slot * gain).clamp(-1.0, 1.0);
        }

        self.clock.advance(frames as u64);

        let events = &self.events;
        self.voices.retain(|voice| {
            let finished = voice.position >= voice.samples.len();
            if finished {
                let _ = events.send(PlaybackEvent::Ended(voice.id));
            }
            !finished
        });
    }

    /// Voices currently held by the renderer
    #[must_use]
    pub fn voice_count(&self) -> usize {
        self.voices.len()
    }
}

/// Default output device via cpal, rendering through a [`Mixer`]
pub struct CpalOutput {
    _stream: Stream,
    commands: std::sync::mpsc::Sender<MixerCommand>,
    clock: AudioClock,
    gain: SharedGain,
}

impl CpalOutput {
    /// Open the default output device, preferring 24kHz
    ///
    /// Ended units and device failures are reported on `events`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Playback` if no usable output device exists
    pub fn open(events: mpsc::UnboundedSender<PlaybackEvent>) -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Playback("no output device available".to_string()))?;

        let supports = |c: &cpal::SupportedStreamConfigRange, channels: u16| {
            c.channels() == channels
                && c.sample_format() == SampleFormat::F32
                && c.min_sample_rate() <= SampleRate(OUTPUT_SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(OUTPUT_SAMPLE_RATE)
        };

        let native = device
            .supported_output_configs()
            .map_err(|e| Error::Playback(e.to_string()))?
            .find(|c| supports(c, 1))
            .or_else(|| {
                // Fallback: try stereo
                device
                    .supported_output_configs()
                    .ok()?
                    .find(|c| supports(c, 2))
            });

        let config = if let Some(supported) = native {
            supported
                .with_sample_rate(SampleRate(OUTPUT_SAMPLE_RATE))
                .config()
        } else {
            let fallback = device
                .default_output_config()
                .map_err(|e| Error::Playback(e.to_string()))?;
            if fallback.sample_format() != SampleFormat::F32 {
                return Err(Error::Playback(format!(
                    "unsupported output sample format: {:?}",
                    fallback.sample_format()
                )));
            }
            fallback.config()
        };

        let clock = AudioClock::new(config.sample_rate.0);
        let gain = SharedGain::default();
        let (commands, command_rx) = std::sync::mpsc::channel();
        let mut mixer = Mixer::new(command_rx, clock.clone(), gain.clone(), events.clone());
        let channels = usize::from(config.channels);

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    mixer.render(data, channels);
                },
                move |err| {
                    tracing::error!(error = %err, "audio playback error");
                    let _ = events.send(PlaybackEvent::Failed(err.to_string()));
                },
                None,
            )
            .map_err(|e| Error::Playback(e.to_string()))?;

        stream.play().map_err(|e| Error::Playback(e.to_string()))?;

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            "audio playback initialized"
        );

        Ok(Self {
            _stream: stream,
            commands,
            clock,
            gain,
        })
    }
}

impl AudioOutput for CpalOutput {
    fn sample_rate(&self) -> u32 {
        self.clock.sample_rate()
    }

    fn current_time(&self) -> f64 {
        self.clock.now()
    }

    fn schedule(&mut self, id: UnitId, buffer: PlaybackBuffer, start_time: f64) -> Result<()> {
        let command = MixerCommand::Schedule {
            id,
            start_frame: self.clock.frame_at(start_time),
            samples: Arc::clone(buffer.samples()),
        };
        self.commands
            .send(command)
            .map_err(|_| Error::Playback("output stream has stopped".to_string()))
    }

    fn stop(&mut self, id: UnitId) {
        let _ = self.commands.send(MixerCommand::Stop(id));
    }

    fn set_gain(&mut self, gain: f32) {
        self.gain.set(gain);
    }
}
