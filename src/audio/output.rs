//! Output device boundary
//!
//! An `OutputDevice` plays one clip per `begin` call and reports exactly one
//! outcome through the returned `OutputSession`.

use crate::audio::AudioClip;
use crate::{ParleyError, Result};
use crossbeam_channel::{Receiver, Sender};

/// One clip being played by an output device
pub struct OutputSession {
    stop_tx: Sender<()>,
    finished_rx: Receiver<Result<()>>,
}

impl OutputSession {
    pub fn new(stop_tx: Sender<()>, finished_rx: Receiver<Result<()>>) -> Self {
        Self {
            stop_tx,
            finished_rx,
        }
    }

    /// Ask the device to stop output; idempotent
    pub fn stop(&self) {
        let _ = self.stop_tx.try_send(());
    }

    /// Block until output finishes or fails
    pub fn wait(&self) -> Result<()> {
        self.finished_rx.recv().unwrap_or_else(|_| {
            Err(ParleyError::PlaybackDecode(
                "Output device ended without reporting".into(),
            ))
        })
    }
}

/// Something that can play a clip through the speaker
pub trait OutputDevice: Send + Sync {
    /// Start playing `clip`
    ///
    /// Returns once output has actually started. Fails with
    /// `ParleyError::PlaybackDecode` when the clip cannot be decoded.
    fn begin(&self, clip: AudioClip) -> Result<OutputSession>;
}

impl AsRef<[u8]> for AudioClip {
    fn as_ref(&self) -> &[u8] {
        self.bytes()
    }
}

#[cfg(feature = "audio-io")]
pub use self::rodio_output::RodioOutput;

#[cfg(feature = "audio-io")]
mod rodio_output {
    use super::{OutputDevice, OutputSession};
    use crate::audio::AudioClip;
    use crate::{ParleyError, Result};
    use crossbeam_channel::{bounded, RecvTimeoutError};
    use rodio::{Decoder, OutputStream, Sink};
    use std::io::Cursor;
    use std::thread;
    use std::time::Duration;
    use tracing::{debug, info};

    /// Default output device via rodio
    ///
    /// rodio's `OutputStream` must stay on the thread that opened it, so
    /// every clip gets its own playback thread.
    pub struct RodioOutput {
        poll_interval: Duration,
    }

    impl RodioOutput {
        pub fn new(poll_interval: Duration) -> Self {
            Self { poll_interval }
        }
    }

    impl Default for RodioOutput {
        fn default() -> Self {
            Self::new(Duration::from_millis(20))
        }
    }

    impl OutputDevice for RodioOutput {
        fn begin(&self, clip: AudioClip) -> Result<OutputSession> {
            let (ready_tx, ready_rx) = bounded::<Result<()>>(1);
            let (stop_tx, stop_rx) = bounded::<()>(1);
            let (finished_tx, finished_rx) = bounded::<Result<()>>(1);
            let poll_interval = self.poll_interval;

            thread::Builder::new()
                .name("parley-playback".into())
                .spawn(move || {
                    let (_stream, handle) = match OutputStream::try_default() {
                        Ok(output) => output,
                        Err(e) => {
                            let _ = ready_tx.send(Err(ParleyError::DeviceAcquisition(format!(
                                "No output device available: {}",
                                e
                            ))));
                            return;
                        }
                    };

                    let sink = match Sink::try_new(&handle) {
                        Ok(sink) => sink,
                        Err(e) => {
                            let _ = ready_tx.send(Err(ParleyError::DeviceAcquisition(format!(
                                "Failed to open output sink: {}",
                                e
                            ))));
                            return;
                        }
                    };

                    let source = match Decoder::new(Cursor::new(clip)) {
                        Ok(source) => source,
                        Err(e) => {
                            let _ = ready_tx.send(Err(ParleyError::PlaybackDecode(e.to_string())));
                            return;
                        }
                    };

                    sink.append(source);
                    let _ = ready_tx.send(Ok(()));
                    info!("Started audio playback");

                    loop {
                        match stop_rx.recv_timeout(poll_interval) {
                            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                                sink.stop();
                                debug!("Playback stopped early");
                                return;
                            }
                            Err(RecvTimeoutError::Timeout) => {
                                if sink.empty() {
                                    let _ = finished_tx.send(Ok(()));
                                    debug!("Playback drained");
                                    return;
                                }
                            }
                        }
                    }
                })
                .map_err(|e| {
                    ParleyError::DeviceAcquisition(format!("Failed to spawn playback thread: {}", e))
                })?;

            ready_rx.recv().map_err(|_| {
                ParleyError::PlaybackDecode("Playback thread exited during setup".into())
            })??;

            Ok(OutputSession::new(stop_tx, finished_rx))
        }
    }
}
