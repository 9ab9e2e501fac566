pub mod buffer;
pub mod clip;
pub mod input;
pub mod output;
pub mod resampler;

pub use buffer::AudioRingBuffer;
pub use clip::AudioClip;
pub use input::{AudioStream, CaptureDevice};
#[cfg(feature = "audio-io")]
pub use input::CpalCapture;
pub use output::{OutputDevice, OutputSession};
#[cfg(feature = "audio-io")]
pub use output::RodioOutput;
pub use resampler::AudioResampler;

/// Convert interleaved frames to mono by averaging channels
pub fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }

    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}
