use crate::{ParleyError, Result};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A complete, immutable unit of audio
///
/// Produced by a recording session when it stops, or received as the
/// agent's reply. The bytes are shared, so cloning a clip never copies the
/// audio.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioClip {
    bytes: Arc<[u8]>,
    duration: Duration,
}

impl AudioClip {
    pub fn new(bytes: impl Into<Arc<[u8]>>, duration: Duration) -> Self {
        Self {
            bytes: bytes.into(),
            duration,
        }
    }

    /// A zero-length clip
    pub fn empty() -> Self {
        Self::new(Vec::new(), Duration::ZERO)
    }

    /// Wrap bytes received from elsewhere, probing the WAV header for the duration
    ///
    /// Bytes that are not WAV still make a valid clip; its duration is
    /// reported as zero and decoding is left to the output device.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let duration = WavReader::new(Cursor::new(bytes.as_slice()))
            .map(|reader| frames_to_duration(reader.duration(), reader.spec().sample_rate))
            .unwrap_or(Duration::ZERO);
        Self::new(bytes, duration)
    }

    /// Encode mono or interleaved f32 samples as a 16-bit PCM WAV clip
    ///
    /// No samples gives an empty clip rather than a header-only file.
    pub fn encode_wav(samples: &[f32], sample_rate: u32, channels: u16) -> Result<Self> {
        if samples.is_empty() {
            return Ok(Self::empty());
        }
        if sample_rate == 0 || channels == 0 {
            return Err(ParleyError::AudioProcessing(format!(
                "Invalid clip format: {} Hz, {} channels",
                sample_rate, channels
            )));
        }

        let spec = WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };

        let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
        {
            let mut writer = WavWriter::new(&mut cursor, spec).map_err(|e| {
                ParleyError::AudioProcessing(format!("Failed to create WAV writer: {}", e))
            })?;

            for &sample in samples {
                let sample_i16 = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                writer.write_sample(sample_i16).map_err(|e| {
                    ParleyError::AudioProcessing(format!("Failed to write sample: {}", e))
                })?;
            }

            writer.finalize().map_err(|e| {
                ParleyError::AudioProcessing(format!("Failed to finalize WAV clip: {}", e))
            })?;
        }

        let frames = (samples.len() / channels as usize) as u32;
        let duration = frames_to_duration(frames, sample_rate);
        debug!("Encoded {} samples into {:?} clip", samples.len(), duration);

        Ok(Self::new(cursor.into_inner(), duration))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }
}

fn frames_to_duration(frames: u32, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(frames as f64 / sample_rate as f64)
}
