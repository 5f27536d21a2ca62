//! Sample-rate conversion using rubato

use rubato::{FftFixedIn, Resampler};

use crate::{Error, Result};

/// Input chunk size fed to the FFT resampler
const CHUNK_SIZE: usize = 1024;

/// FFT sub-chunks per input chunk
const SUB_CHUNKS: usize = 2;

fn new_resampler(from_rate: u32, to_rate: u32) -> Result<FftFixedIn<f32>> {
    FftFixedIn::<f32>::new(
        from_rate as usize,
        to_rate as usize,
        CHUNK_SIZE,
        SUB_CHUNKS,
        1,
    )
    .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))
}

/// Number of output samples `len` input samples map to
#[must_use]
pub fn resampled_len(len: usize, from_rate: u32, to_rate: u32) -> usize {
    if from_rate == 0 {
        return 0;
    }
    let len = len as u128 * u128::from(to_rate) / u128::from(from_rate);
    usize::try_from(len).unwrap_or(usize::MAX)
}

/// Resample a complete mono buffer
///
/// The output is delay-compensated and exactly `resampled_len` samples long.
///
/// # Errors
///
/// Returns error if the resampler cannot be constructed or fails
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let mut resampler = new_resampler(from_rate, to_rate)?;
    let delay = resampler.output_delay();
    let expected = resampled_len(samples.len(), from_rate, to_rate);
    let mut output = Vec::with_capacity(expected + delay);

    let mut chunks = samples.chunks_exact(resampler.input_frames_next());
    for chunk in &mut chunks {
        let result = resampler
            .process(&[chunk], None)
            .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
        output.extend_from_slice(&result[0]);
    }

    let remainder = chunks.remainder();
    if !remainder.is_empty() {
        let result = resampler
            .process_partial(Some(&[remainder]), None)
            .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
        output.extend_from_slice(&result[0]);
    }

    // Flush the filter tail until the delay-shifted output is complete
    while output.len() < expected + delay {
        let result = resampler
            .process_partial::<&[f32]>(None, None)
            .map_err(|e| Error::Audio(format!("resample flush failed: {e}")))?;
        if result[0].is_empty() {
            break;
        }
        output.extend_from_slice(&result[0]);
    }

    output.drain(..delay.min(output.len()));
    output.resize(expected, 0.0);
    Ok(output)
}

/// Resampler that persists across audio callbacks
///
/// Buffers input until a full chunk is available, so callers may push
/// arbitrarily sized slices.
pub struct StreamResampler {
    resampler: FftFixedIn<f32>,
    pending: Vec<f32>,
}

impl StreamResampler {
    /// Create a streaming resampler
    ///
    /// # Errors
    ///
    /// Returns error if the rates are unsupported
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self> {
        Ok(Self {
            resampler: new_resampler(from_rate, to_rate)?,
            pending: Vec::with_capacity(CHUNK_SIZE * 2),
        })
    }

    /// Push input samples and return whatever output is ready
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        self.pending.extend_from_slice(samples);

        let mut output = Vec::new();
        let mut needed = self.resampler.input_frames_next();
        while self.pending.len() >= needed {
            match self.resampler.process(&[&self.pending[..needed]], None) {
                Ok(result) => output.extend_from_slice(&result[0]),
                Err(e) => tracing::warn!(error = %e, "stream resample failed"),
            }
            self.pending.drain(..needed);
            needed = self.resampler.input_frames_next();
        }
        output
    }
}
