//! Microphone capture sessions
//!
//! A `RecordingSession` owns one `AudioStream` and collects its fragments
//! on a worker thread until stopped. `Recorder` is the single slot the
//! orchestrator keeps sessions in; starting a new session always discards
//! whatever was there before.

use crate::audio::{AudioClip, AudioRingBuffer, AudioStream};
use crate::{ParleyError, Result};
use crossbeam_channel::{bounded, select, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Ordered fragments captured during one session
#[derive(Debug, Default)]
pub struct CaptureBuffer {
    fragments: Vec<Vec<f32>>,
    samples: usize,
}

impl CaptureBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, fragment: Vec<f32>) {
        if fragment.is_empty() {
            return;
        }
        self.samples += fragment.len();
        self.fragments.push(fragment);
    }

    pub fn sample_count(&self) -> usize {
        self.samples
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples == 0
    }

    /// Drop whole fragments from the front until at most `max_samples` remain
    ///
    /// The fragment straddling the limit is kept, so slightly more than
    /// `max_samples` may survive.
    pub fn retain_tail(&mut self, max_samples: usize) {
        let mut dropped = 0;
        while dropped + 1 < self.fragments.len()
            && self.samples - self.fragments[dropped].len() >= max_samples
        {
            self.samples -= self.fragments[dropped].len();
            dropped += 1;
        }
        self.fragments.drain(..dropped);
    }

    /// Concatenate all fragments and leave the buffer empty
    pub fn take_samples(&mut self) -> Vec<f32> {
        let mut samples = Vec::with_capacity(self.samples);
        for fragment in self.fragments.drain(..) {
            samples.extend_from_slice(&fragment);
        }
        self.samples = 0;
        samples
    }

    pub fn clear(&mut self) {
        self.fragments.clear();
        self.samples = 0;
    }
}

/// One microphone acquisition being recorded
pub struct RecordingSession {
    id: Uuid,
    sample_rate: u32,
    buffer: Arc<Mutex<CaptureBuffer>>,
    tap: AudioRingBuffer,
    /// Speech was detected at least once
    voiced: AtomicBool,
    stop_tx: Sender<()>,
    worker: Option<JoinHandle<()>>,
}

impl RecordingSession {
    /// Begin collecting fragments from `stream`
    ///
    /// Every fragment is also written to a tap holding the last
    /// `tap_window` of audio for the voice activity monitor.
    pub fn start(stream: AudioStream, tap_window: Duration) -> Result<Self> {
        let id = Uuid::new_v4();
        let sample_rate = stream.sample_rate();
        let buffer = Arc::new(Mutex::new(CaptureBuffer::new()));
        let tap = AudioRingBuffer::for_window(sample_rate, tap_window);
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let worker_buffer = Arc::clone(&buffer);
        let worker_tap = tap.clone();
        let worker = thread::Builder::new()
            .name("parley-recorder".into())
            .spawn(move || {
                let collect = |fragment: Vec<f32>| {
                    worker_tap.write(&fragment);
                    worker_buffer.lock().append(fragment);
                };

                loop {
                    select! {
                        recv(stop_rx) -> _ => {
                            // Pick up whatever the device delivered before the stop
                            while let Ok(fragment) = stream.fragments().try_recv() {
                                collect(fragment);
                            }
                            break;
                        }
                        recv(stream.fragments()) -> fragment => match fragment {
                            Ok(fragment) => collect(fragment),
                            Err(_) => {
                                warn!("Capture stream ended while recording");
                                break;
                            }
                        }
                    }
                }

                stream.release();
            })
            .map_err(|e| ParleyError::AudioProcessing(format!("Failed to spawn recorder: {}", e)))?;

        info!("Recording session {} started at {} Hz", id, sample_rate);

        Ok(Self {
            id,
            sample_rate,
            buffer,
            tap,
            voiced: AtomicBool::new(false),
            stop_tx,
            worker: Some(worker),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Tap for the voice activity monitor
    pub fn tap(&self) -> AudioRingBuffer {
        self.tap.clone()
    }

    pub fn buffered_samples(&self) -> usize {
        self.buffer.lock().sample_count()
    }

    /// Record that the monitor heard speech in this session
    pub fn mark_voiced(&self) {
        self.voiced.store(true, Ordering::SeqCst);
    }

    pub fn is_voiced(&self) -> bool {
        self.voiced.load(Ordering::SeqCst)
    }

    /// Keep only the most recent `pre_roll` of captured audio
    pub fn trim_to_pre_roll(&self, pre_roll: Duration) {
        let keep = (self.sample_rate as f64 * pre_roll.as_secs_f64()) as usize;
        self.buffer.lock().retain_tail(keep);
    }

    /// Finalize the capture, release the device and return the clip
    ///
    /// Blocks until the device has been torn down. Returns an empty clip
    /// when no speech was detected, whatever the microphone delivered.
    pub fn stop(mut self) -> Result<AudioClip> {
        self.shutdown_worker();

        if !self.is_voiced() {
            let dropped = self.buffer.lock().sample_count();
            self.buffer.lock().clear();
            debug!("Recording session {} stopped before speech, dropped {} samples", self.id, dropped);
            return Ok(AudioClip::empty());
        }

        let samples = self.buffer.lock().take_samples();
        debug!("Recording session {} stopped with {} samples", self.id, samples.len());

        AudioClip::encode_wav(&samples, self.sample_rate, 1)
    }

    /// Release the device without producing a clip
    pub fn discard_and_release(mut self) {
        self.shutdown_worker();
        self.buffer.lock().clear();
        debug!("Recording session {} discarded", self.id);
    }

    fn shutdown_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.stop_tx.try_send(());
            if worker.join().is_err() {
                warn!("Recorder thread panicked");
            }
        }
    }
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        self.shutdown_worker();
    }
}

/// Slot holding at most one open recording session
#[derive(Default)]
pub struct Recorder {
    current: Option<RecordingSession>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a session on `stream`, discarding any session still open
    pub fn start(&mut self, stream: AudioStream, tap_window: Duration) -> Result<&RecordingSession> {
        if let Some(previous) = self.current.take() {
            debug!("Superseding open recording session {}", previous.id());
            previous.discard_and_release();
        }

        let session = RecordingSession::start(stream, tap_window)?;
        Ok(self.current.insert(session))
    }

    pub fn current(&self) -> Option<&RecordingSession> {
        self.current.as_ref()
    }

    /// Remove the open session so it can be stopped elsewhere
    pub fn take(&mut self) -> Option<RecordingSession> {
        self.current.take()
    }

    pub fn discard(&mut self) {
        if let Some(session) = self.current.take() {
            session.discard_and_release();
        }
    }

    pub fn is_open(&self) -> bool {
        self.current.is_some()
    }
}
