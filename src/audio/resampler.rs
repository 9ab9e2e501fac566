use crate::{ParleyError, Result};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use tracing::debug;

/// Mono sample-rate converter for classifier windows
///
/// The Silero model only accepts 8 kHz or 16 kHz input while most
/// microphones run at 44.1 or 48 kHz.
pub struct AudioResampler {
    resampler: SincFixedIn<f32>,
    input_rate: u32,
    output_rate: u32,
}

impl AudioResampler {
    /// Create a new resampler
    ///
    /// # Arguments
    /// * `input_rate` - Input sample rate
    /// * `output_rate` - Output sample rate
    /// * `chunk_size` - Frames handed to rubato per call
    pub fn new(input_rate: u32, output_rate: u32, chunk_size: usize) -> Result<Self> {
        if input_rate == 0 || output_rate == 0 {
            return Err(ParleyError::Config("Sample rates must be greater than 0".into()));
        }
        if chunk_size == 0 {
            return Err(ParleyError::Config("Resampler chunk size must be greater than 0".into()));
        }

        let resample_ratio = output_rate as f64 / input_rate as f64;

        // Short kernel: classification only sees the speech band
        let params = SincInterpolationParameters {
            sinc_len: 64,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 128,
            window: WindowFunction::BlackmanHarris2,
        };

        let resampler = SincFixedIn::<f32>::new(resample_ratio, 2.0, params, chunk_size, 1)
            .map_err(|e| ParleyError::AudioProcessing(format!("Failed to create resampler: {}", e)))?;

        debug!("Created resampler: {} Hz -> {} Hz", input_rate, output_rate);

        Ok(Self {
            resampler,
            input_rate,
            output_rate,
        })
    }

    /// Resample a block of mono samples
    ///
    /// The last partial chunk is zero-padded and its output trimmed to the
    /// proportion of real input it contained.
    pub fn resample(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        if input.is_empty() {
            return Ok(Vec::new());
        }

        let chunk_size = self.resampler.input_frames_max();
        let ratio = self.output_rate as f64 / self.input_rate as f64;
        let mut output = Vec::with_capacity((input.len() as f64 * ratio * 1.1) as usize);

        for chunk in input.chunks(chunk_size) {
            let mut padded = vec![0.0f32; chunk_size];
            padded[..chunk.len()].copy_from_slice(chunk);

            let planar = self
                .resampler
                .process(&[padded], None)
                .map_err(|e| ParleyError::AudioProcessing(format!("Resampling failed: {}", e)))?;

            let produced = &planar[0];
            let keep = if chunk.len() < chunk_size {
                ((chunk.len() as f64) * ratio).ceil() as usize
            } else {
                produced.len()
            };
            output.extend_from_slice(&produced[..keep.min(produced.len())]);
        }

        Ok(output)
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    /// Reset the resampler state
    pub fn reset(&mut self) {
        self.resampler.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_parameters() {
        assert!(AudioResampler::new(0, 16000, 1024).is_err());
        assert!(AudioResampler::new(48000, 0, 1024).is_err());
        assert!(AudioResampler::new(48000, 16000, 0).is_err());
    }

    #[test]
    fn test_downsampling_shrinks_window() {
        let mut resampler = AudioResampler::new(48000, 16000, 4800).unwrap();
        let input: Vec<f32> = (0..4800).map(|i| (i as f32 * 0.01).sin()).collect();
        let output = resampler.resample(&input).unwrap();
        assert!(!output.is_empty());
        assert!(output.len() < input.len());
    }

    #[test]
    fn test_empty_input() {
        let mut resampler = AudioResampler::new(44100, 16000, 1024).unwrap();
        assert!(resampler.resample(&[]).unwrap().is_empty());
    }
}
