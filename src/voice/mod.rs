//! Voice processing module
//!
//! Handles microphone capture, the PCM transport codec, resampling, and
//! gapless scheduled playback of model speech.

pub mod capture;
pub mod codec;
pub mod playback;
pub mod resample;

pub use capture::{
    AudioInput, BLOCK_SIZE, CaptureHandle, CpalInput, INPUT_SAMPLE_RATE, InputDevice, LevelMeter,
    SampleCallback, samples_to_wav,
};
pub use codec::{AudioFrame, TransportEnvelope};
pub use playback::{
    AudioOutput, CpalOutput, OUTPUT_SAMPLE_RATE, PlaybackBuffer, PlaybackEvent, PlaybackScheduler,
    PlaybackUnit, UnitId,
};
