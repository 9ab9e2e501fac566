//! Capture device boundary
//!
//! A `CaptureDevice` hands out `AudioStream`s: ordered mono f32 fragments
//! that keep flowing until the stream is released.

use crate::Result;
use crossbeam_channel::{Receiver, Sender};

/// A live microphone acquisition
///
/// Dropping or releasing the stream tears down the underlying device.
pub struct AudioStream {
    fragments: Receiver<Vec<f32>>,
    sample_rate: u32,
    release_tx: Option<Sender<()>>,
}

impl AudioStream {
    /// Wrap a fragment channel
    ///
    /// `release_tx` is signalled exactly once when the stream is released.
    pub fn new(
        fragments: Receiver<Vec<f32>>,
        sample_rate: u32,
        release_tx: Option<Sender<()>>,
    ) -> Self {
        Self {
            fragments,
            sample_rate,
            release_tx,
        }
    }

    pub fn fragments(&self) -> &Receiver<Vec<f32>> {
        &self.fragments
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Release the device now
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for AudioStream {
    fn drop(&mut self) {
        if let Some(release_tx) = self.release_tx.take() {
            let _ = release_tx.send(());
        }
    }
}

/// Something that can open the microphone
pub trait CaptureDevice: Send + Sync {
    /// Acquire a new stream
    ///
    /// Fails with `ParleyError::DeviceAcquisition` when no device is
    /// available or access is denied.
    fn acquire(&self) -> Result<AudioStream>;
}

#[cfg(feature = "audio-io")]
pub use self::cpal_capture::CpalCapture;

#[cfg(feature = "audio-io")]
mod cpal_capture {
    use super::{AudioStream, CaptureDevice};
    use crate::audio::downmix;
    use crate::{ParleyError, Result};
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::Stream;
    use crossbeam_channel::{bounded, Sender};
    use std::thread;
    use tracing::{debug, error, info};

    /// Default input device of the default cpal host
    ///
    /// cpal streams are not `Send`, so each acquisition parks its stream on
    /// a dedicated thread until the `AudioStream` is released.
    pub struct CpalCapture {
        fragment_buffer: usize,
    }

    impl CpalCapture {
        pub fn new(fragment_buffer: usize) -> Self {
            Self { fragment_buffer }
        }
    }

    impl Default for CpalCapture {
        fn default() -> Self {
            Self::new(1000)
        }
    }

    impl CaptureDevice for CpalCapture {
        fn acquire(&self) -> Result<AudioStream> {
            let (fragment_tx, fragment_rx) = bounded(self.fragment_buffer);
            let (ready_tx, ready_rx) = bounded::<Result<u32>>(1);
            let (release_tx, release_rx) = bounded::<()>(1);

            thread::Builder::new()
                .name("parley-capture".into())
                .spawn(move || {
                    let stream = match open_input_stream(fragment_tx) {
                        Ok((stream, sample_rate)) => {
                            let _ = ready_tx.send(Ok(sample_rate));
                            stream
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };

                    // Either an explicit release or the AudioStream being dropped
                    let _ = release_rx.recv();
                    drop(stream);
                    debug!("Capture stream released");
                })
                .map_err(|e| {
                    ParleyError::DeviceAcquisition(format!("Failed to spawn capture thread: {}", e))
                })?;

            let sample_rate = ready_rx.recv().map_err(|_| {
                ParleyError::DeviceAcquisition("Capture thread exited during setup".into())
            })??;

            Ok(AudioStream::new(fragment_rx, sample_rate, Some(release_tx)))
        }
    }

    fn open_input_stream(fragment_tx: Sender<Vec<f32>>) -> Result<(Stream, u32)> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| ParleyError::DeviceAcquisition("No input device available".into()))?;

        info!("Using input device: {}", device.name().unwrap_or_else(|_| "Unknown".to_string()));

        let config: cpal::StreamConfig = device
            .default_input_config()
            .map_err(|e| ParleyError::DeviceAcquisition(format!("Failed to get input config: {}", e)))?
            .into();

        let channels = config.channels as usize;
        let sample_rate = config.sample_rate.0;

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if let Err(e) = fragment_tx.try_send(downmix(data, channels)) {
                        debug!("Dropped capture fragment: {}", e);
                    }
                },
                |err| {
                    error!("Audio input stream error: {}", err);
                },
                None,
            )
            .map_err(|e| ParleyError::DeviceAcquisition(format!("Failed to build input stream: {}", e)))?;

        stream
            .play()
            .map_err(|e| ParleyError::DeviceAcquisition(format!("Failed to start input stream: {}", e)))?;

        info!("Capture stream open at {} Hz", sample_rate);
        Ok((stream, sample_rate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn test_release_signals_device() {
        let (_fragment_tx, fragment_rx) = bounded::<Vec<f32>>(4);
        let (release_tx, release_rx) = bounded(1);

        let stream = AudioStream::new(fragment_rx, 16000, Some(release_tx));
        assert_eq!(stream.sample_rate(), 16000);
        assert!(release_rx.try_recv().is_err());

        stream.release();
        assert!(release_rx.try_recv().is_ok());
    }

    #[test]
    fn test_fragments_arrive_in_order() {
        let (fragment_tx, fragment_rx) = bounded(4);
        let stream = AudioStream::new(fragment_rx, 8000, None);

        fragment_tx.send(vec![0.1]).unwrap();
        fragment_tx.send(vec![0.2]).unwrap();

        assert_eq!(stream.fragments().recv().unwrap(), vec![0.1]);
        assert_eq!(stream.fragments().recv().unwrap(), vec![0.2]);
    }
}
