//! PCM codec: float samples <-> 16-bit little-endian PCM <-> base64 text

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// MIME type prefix for raw 16-bit PCM
const PCM_MIME_PREFIX: &str = "audio/pcm";

/// Bytes per encoded sample
const BYTES_PER_SAMPLE: usize = 2;

/// Fixed-length block of signed 16-bit samples, interleaved by channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Vec<i16>,
    sample_rate: u32,
    channels: u16,
}

impl AudioFrame {
    /// Build a frame from floating-point samples
    ///
    /// Values are clamped to [-1, 1]; negatives scale by 32768 and
    /// non-negatives by 32767 so +1.0 cannot overflow.
    #[must_use]
    pub fn from_f32(samples: &[f32], sample_rate: u32, channels: u16) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let samples = samples
            .iter()
            .map(|&s| {
                let s = if s.is_nan() { 0.0 } else { s.clamp(-1.0, 1.0) };
                if s < 0.0 {
                    (s * 32768.0).round() as i16
                } else {
                    (s * 32767.0).round() as i16
                }
            })
            .collect();

        Self {
            samples,
            sample_rate,
            channels: channels.max(1),
        }
    }

    /// Build a frame from little-endian PCM bytes
    ///
    /// Trailing bytes that do not fill a whole sample for every channel are
    /// dropped.
    #[must_use]
    pub fn from_le_bytes(bytes: &[u8], sample_rate: u32, channels: u16) -> Self {
        let channels = channels.max(1);
        let frame_bytes = BYTES_PER_SAMPLE * usize::from(channels);
        let usable = bytes.len() - bytes.len() % frame_bytes;

        if usable != bytes.len() {
            tracing::trace!(
                len = bytes.len(),
                dropped = bytes.len() - usable,
                "truncating partial PCM frame"
            );
        }

        let samples = bytes[..usable]
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();

        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    /// Interleaved samples
    #[must_use]
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    /// Sample rate in Hz
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Channel count
    #[must_use]
    pub const fn channels(&self) -> u16 {
        self.channels
    }

    /// Number of sample frames (samples per channel)
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.samples.len() / usize::from(self.channels)
    }

    /// Whether the frame holds no audio
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
        self.frame_count() as f64 / f64::from(self.sample_rate)
    }

    /// Serialize to little-endian bytes
    #[must_use]
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    /// Reconstruct floating-point samples in [-1, 1]
    #[must_use]
    pub fn to_f32(&self) -> Vec<f32> {
        self.samples.iter().map(|&s| f32::from(s) / 32768.0).collect()
    }

    /// Reconstruct mono floating-point samples, averaging channels
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn to_mono_f32(&self) -> Vec<f32> {
        if self.channels == 1 {
            return self.to_f32();
        }
        let channels = usize::from(self.channels);
        self.samples
            .chunks_exact(channels)
            .map(|frame| {
                let sum: f32 = frame.iter().map(|&s| f32::from(s) / 32768.0).sum();
                sum / channels as f32
            })
            .collect()
    }
}

/// Text-safe encoding of binary media plus its MIME tag
///
/// Serializes as the `{ "data": …, "mimeType": … }` blob the remote service
/// exchanges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportEnvelope {
    /// Base64 payload
    pub data: String,

    /// MIME type, e.g. `audio/pcm;rate=16000`
    #[serde(default)]
    pub mime_type: String,
}

impl TransportEnvelope {
    /// Wrap raw bytes
    #[must_use]
    pub fn from_bytes(bytes: &[u8], mime_type: impl Into<String>) -> Self {
        Self {
            data: STANDARD.encode(bytes),
            mime_type: mime_type.into(),
        }
    }

    /// Decode the payload back to bytes
    ///
    /// # Errors
    ///
    /// Returns `Error::Codec` if the payload is not valid base64
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        decode_base64(&self.data)
    }

    /// Whether the payload is audio
    #[must_use]
    pub fn is_audio(&self) -> bool {
        self.mime_type.is_empty() || self.mime_type.starts_with("audio/")
    }

    /// Sample rate advertised in the MIME parameters, if any
    #[must_use]
    pub fn sample_rate(&self) -> Option<u32> {
        sample_rate_from_mime(&self.mime_type)
    }

    /// Decode as a PCM frame, preferring the rate advertised in the MIME type
    ///
    /// # Errors
    ///
    /// Returns `Error::Codec` if the payload is not valid base64
    pub fn decode_audio(&self, default_rate: u32, channels: u16) -> Result<AudioFrame> {
        decode(&self.data, self.sample_rate().unwrap_or(default_rate), channels)
    }
}

/// MIME tag for mono 16-bit PCM at `sample_rate`
#[must_use]
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("{PCM_MIME_PREFIX};rate={sample_rate}")
}

/// Parse the `rate=` parameter out of a PCM MIME type
#[must_use]
pub fn sample_rate_from_mime(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.trim().split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("rate"))
        .and_then(|(_, value)| value.trim().parse().ok())
}

/// Encode float samples for the wire
///
/// Deterministic and infallible; out-of-range samples are clamped.
#[must_use]
pub fn encode(samples: &[f32], sample_rate: u32) -> TransportEnvelope {
    let frame = AudioFrame::from_f32(samples, sample_rate, 1);
    TransportEnvelope::from_bytes(&frame.to_le_bytes(), pcm_mime_type(sample_rate))
}

/// Decode a base64 PCM payload into a frame
///
/// # Errors
///
/// Returns `Error::Codec` only if `data` is not valid base64
pub fn decode(data: &str, sample_rate: u32, channels: u16) -> Result<AudioFrame> {
    let bytes = decode_base64(data)?;
    Ok(AudioFrame::from_le_bytes(&bytes, sample_rate, channels))
}

fn decode_base64(data: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(data.trim())
        .map_err(|e| Error::Codec(format!("invalid base64 payload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extremes_use_asymmetric_scaling() {
        let frame = AudioFrame::from_f32(&[1.0, -1.0, 0.0], 16000, 1);
        assert_eq!(frame.samples(), &[32767, -32768, 0]);
    }

    #[test]
    fn out_of_range_samples_are_clamped() {
        let frame = AudioFrame::from_f32(&[3.5, -7.0, f32::NAN], 16000, 1);
        assert_eq!(frame.samples(), &[32767, -32768, 0]);
    }

    #[test]
    fn encoding_is_little_endian() {
        let frame = AudioFrame::from_f32(&[-1.0], 16000, 1);
        assert_eq!(frame.to_le_bytes(), vec![0x00, 0x80]);
    }

    #[test]
    fn encode_tags_mime_with_rate() {
        let envelope = encode(&[0.0; 8], 16000);
        assert_eq!(envelope.mime_type, "audio/pcm;rate=16000");
        assert_eq!(envelope.to_bytes().unwrap().len(), 16);
    }

    #[test]
    fn odd_byte_payload_is_truncated() {
        let bytes = [0x01, 0x00, 0x02, 0x00, 0x03];
        let frame = AudioFrame::from_le_bytes(&bytes, 24000, 1);
        assert_eq!(frame.samples(), &[1, 2]);
    }

    #[test]
    fn stereo_payload_drops_incomplete_frame() {
        // two full stereo frames plus one lone left sample
        let bytes = [1, 0, 2, 0, 3, 0, 4, 0, 5, 0];
        let frame = AudioFrame::from_le_bytes(&bytes, 24000, 2);
        assert_eq!(frame.frame_count(), 2);
        assert_eq!(frame.samples(), &[1, 2, 3, 4]);
    }

    #[test]
    fn malformed_base64_is_codec_error() {
        let err = decode("not*base64!", 24000, 1).unwrap_err();
        assert!(matches!(err, Error::Codec(_)));
    }

    #[test]
    fn empty_payload_decodes_to_empty_frame() {
        let frame = decode("", 24000, 1).unwrap();
        assert!(frame.is_empty());
        assert!(frame.duration_secs().abs() < f64::EPSILON);
    }

    #[test]
    fn duration_counts_frames_not_samples() {
        let frame = AudioFrame::from_le_bytes(&[0; 96_000], 24000, 2);
        assert!((frame.duration_secs() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn mime_rate_parsing() {
        assert_eq!(sample_rate_from_mime("audio/pcm;rate=24000"), Some(24000));
        assert_eq!(sample_rate_from_mime("audio/pcm; rate=16000"), Some(16000));
        assert_eq!(sample_rate_from_mime("audio/pcm"), None);
        assert_eq!(sample_rate_from_mime("audio/pcm;rate=fast"), None);
    }

    #[test]
    fn envelope_prefers_advertised_rate() {
        let envelope = TransportEnvelope::from_bytes(&[0; 4], "audio/pcm;rate=22050");
        let frame = envelope.decode_audio(24000, 1).unwrap();
        assert_eq!(frame.sample_rate(), 22050);
    }

    #[test]
    fn mono_downmix_averages_channels() {
        let frame = AudioFrame::from_le_bytes(
            &[0x00, 0x40, 0x00, 0x00], // 16384, 0
            24000,
            2,
        );
        assert_eq!(frame.to_mono_f32(), vec![0.25]);
    }
}
