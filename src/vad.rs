//! Voice activity monitoring
//!
//! A `VoiceActivityMonitor` polls the capture tap on a fixed interval,
//! classifies each window as voiced or unvoiced and turns the stream of
//! classifications into debounced "speaking started" / "speaking stopped"
//! signals.
//!
//! Detaching is immediate: once `MonitorHandle::detach` returns, no
//! listener of that monitor runs again, even if a poll was already in
//! flight.

use crate::audio::{AudioResampler, AudioRingBuffer};
use crate::{ParleyError, Result};
use crossbeam_channel::{bounded, select, tick, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};
use voice_activity_detector::VoiceActivityDetector as SileroDetector;

/// A debounced change in speaking state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VadSignal {
    SpeakingStarted,
    SpeakingStopped,
}

/// Voiced/unvoiced decision for one window of mono samples
pub trait VoiceClassifier: Send {
    fn is_voiced(&mut self, window: &[f32]) -> bool;

    /// Forget any state carried between windows
    fn reset(&mut self) {}
}

/// Loudness gate: a window is voiced when its RMS level exceeds a threshold
pub struct EnergyClassifier {
    threshold_db: f32,
}

impl EnergyClassifier {
    pub fn new(threshold_db: f32) -> Self {
        Self { threshold_db }
    }

    pub fn threshold_db(&self) -> f32 {
        self.threshold_db
    }
}

impl Default for EnergyClassifier {
    fn default() -> Self {
        Self::new(-50.0)
    }
}

impl VoiceClassifier for EnergyClassifier {
    fn is_voiced(&mut self, window: &[f32]) -> bool {
        level_db(window) > self.threshold_db
    }
}

/// RMS level of a window in dBFS; silence is negative infinity
pub fn level_db(window: &[f32]) -> f32 {
    if window.is_empty() {
        return f32::NEG_INFINITY;
    }
    let mean_square = window.iter().map(|s| s * s).sum::<f32>() / window.len() as f32;
    10.0 * mean_square.log10()
}

/// Silero VAD model, fed at 16 kHz
pub struct SileroClassifier {
    detector: SileroDetector,
    resampler: Option<AudioResampler>,
    chunk_size: usize,
    threshold: f32,
}

impl SileroClassifier {
    /// Create a classifier for audio arriving at `input_rate`
    ///
    /// # Arguments
    /// * `input_rate` - Sample rate of the capture stream
    /// * `threshold` - Speech probability threshold (0.0-1.0)
    pub fn new(input_rate: u32, threshold: f32) -> Result<Self> {
        let (model_rate, resampler) = match input_rate {
            8000 | 16000 => (input_rate, None),
            _ => (16000, Some(AudioResampler::new(input_rate, 16000, (input_rate / 10) as usize)?)),
        };

        // 32ms per chunk at either supported rate
        let chunk_size: usize = if model_rate == 8000 { 256 } else { 512 };

        let detector = SileroDetector::builder()
            .sample_rate(model_rate as i32)
            .chunk_size(chunk_size)
            .build()
            .map_err(|e| ParleyError::AudioProcessing(format!("Failed to create VAD: {:?}", e)))?;

        info!(
            "Initialized Silero VAD: input {} Hz, model {} Hz, threshold {}",
            input_rate, model_rate, threshold
        );

        Ok(Self {
            detector,
            resampler,
            chunk_size,
            threshold: threshold.clamp(0.0, 1.0),
        })
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

impl VoiceClassifier for SileroClassifier {
    fn is_voiced(&mut self, window: &[f32]) -> bool {
        let samples = match self.resampler.as_mut() {
            Some(resampler) => match resampler.resample(window) {
                Ok(samples) => samples,
                Err(e) => {
                    warn!("VAD resampling failed: {}", e);
                    return false;
                }
            },
            None => window.to_vec(),
        };

        samples
            .chunks_exact(self.chunk_size)
            .map(|chunk| self.detector.predict(chunk.iter().copied()))
            .fold(0.0f32, f32::max)
            >= self.threshold
    }

    fn reset(&mut self) {
        self.detector.reset();
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
    }
}

/// Polling parameters
#[derive(Clone, Debug)]
pub struct MonitorConfig {
    /// Time between classifications
    pub interval: Duration,
    /// Consecutive unvoiced polls needed to end a voiced segment
    pub hangover_ticks: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            hangover_ticks: 10,
        }
    }
}

/// Turns per-poll classifications into at most one signal per segment
#[derive(Debug)]
pub struct SpeechDebouncer {
    speaking: bool,
    quiet_ticks: u32,
    hangover_ticks: u32,
}

impl SpeechDebouncer {
    pub fn new(hangover_ticks: u32) -> Self {
        Self {
            speaking: false,
            quiet_ticks: 0,
            hangover_ticks: hangover_ticks.max(1),
        }
    }

    pub fn update(&mut self, voiced: bool) -> Option<VadSignal> {
        if voiced {
            self.quiet_ticks = 0;
            if !self.speaking {
                self.speaking = true;
                return Some(VadSignal::SpeakingStarted);
            }
            return None;
        }

        if !self.speaking {
            return None;
        }

        self.quiet_ticks += 1;
        if self.quiet_ticks >= self.hangover_ticks {
            self.speaking = false;
            self.quiet_ticks = 0;
            return Some(VadSignal::SpeakingStopped);
        }
        None
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }
}

type Listener = Box<dyn Fn() + Send>;

#[derive(Default)]
struct Listeners {
    attached: bool,
    started: Vec<Listener>,
    stopped: Vec<Listener>,
}

struct Shared {
    listeners: Mutex<Listeners>,
}

impl Shared {
    /// Run listeners for `signal`; false once detached
    fn emit(&self, signal: VadSignal) -> bool {
        let listeners = self.listeners.lock();
        if !listeners.attached {
            return false;
        }
        let targets = match signal {
            VadSignal::SpeakingStarted => &listeners.started,
            VadSignal::SpeakingStopped => &listeners.stopped,
        };
        for listener in targets {
            listener();
        }
        true
    }
}

pub struct VoiceActivityMonitor;

impl VoiceActivityMonitor {
    /// Start polling `tap` with `classifier`
    pub fn attach(
        tap: AudioRingBuffer,
        mut classifier: Box<dyn VoiceClassifier>,
        config: MonitorConfig,
    ) -> MonitorHandle {
        let shared = Arc::new(Shared {
            listeners: Mutex::new(Listeners {
                attached: true,
                ..Default::default()
            }),
        });
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let worker_shared = Arc::clone(&shared);
        let spawned = thread::Builder::new()
            .name("parley-vad".into())
            .spawn(move || {
                let ticker = tick(config.interval);
                let mut debouncer = SpeechDebouncer::new(config.hangover_ticks);
                classifier.reset();

                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => {
                            let window = tap.drain();
                            let voiced = classifier.is_voiced(&window);
                            if let Some(signal) = debouncer.update(voiced) {
                                match signal {
                                    VadSignal::SpeakingStarted => debug!("Started speaking >"),
                                    VadSignal::SpeakingStopped => debug!("< Stopped speaking"),
                                }
                                if !worker_shared.emit(signal) {
                                    break;
                                }
                            }
                        }
                    }
                }
                debug!("VAD monitor exiting");
            });

        if let Err(e) = spawned {
            warn!("Failed to spawn VAD monitor: {}", e);
        }

        MonitorHandle {
            shared,
            stop_tx: Some(stop_tx),
        }
    }
}

/// Registration and cancellation for one attached monitor
pub struct MonitorHandle {
    shared: Arc<Shared>,
    stop_tx: Option<Sender<()>>,
}

impl MonitorHandle {
    pub fn on_speaking_started(&self, callback: impl Fn() + Send + 'static) {
        let mut listeners = self.shared.listeners.lock();
        if listeners.attached {
            listeners.started.push(Box::new(callback));
        }
    }

    pub fn on_speaking_stopped(&self, callback: impl Fn() + Send + 'static) {
        let mut listeners = self.shared.listeners.lock();
        if listeners.attached {
            listeners.stopped.push(Box::new(callback));
        }
    }

    /// Stop the monitor; no listener runs after this returns
    pub fn detach(&mut self) {
        {
            let mut listeners = self.shared.listeners.lock();
            listeners.attached = false;
            listeners.started.clear();
            listeners.stopped.clear();
        }
        // Dropping the sender wakes the polling thread
        self.stop_tx.take();
    }

    pub fn is_attached(&self) -> bool {
        self.shared.listeners.lock().attached
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Switch(Arc<AtomicBool>);

    impl VoiceClassifier for Switch {
        fn is_voiced(&mut self, _window: &[f32]) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn fast_config() -> MonitorConfig {
        MonitorConfig {
            interval: Duration::from_millis(5),
            hangover_ticks: 3,
        }
    }

    #[test]
    fn test_debouncer_single_signal_per_segment() {
        let mut debouncer = SpeechDebouncer::new(3);

        assert_eq!(debouncer.update(false), None);
        assert_eq!(debouncer.update(true), Some(VadSignal::SpeakingStarted));
        assert_eq!(debouncer.update(true), None);
        assert_eq!(debouncer.update(false), None);
        assert_eq!(debouncer.update(false), None);
        assert_eq!(debouncer.update(false), Some(VadSignal::SpeakingStopped));
        assert_eq!(debouncer.update(false), None);
        assert!(!debouncer.is_speaking());
    }

    #[test]
    fn test_debouncer_short_pause_does_not_stop() {
        let mut debouncer = SpeechDebouncer::new(3);
        debouncer.update(true);
        debouncer.update(false);
        debouncer.update(false);
        assert_eq!(debouncer.update(true), None);
        assert!(debouncer.is_speaking());
    }

    #[test]
    fn test_energy_classifier() {
        let mut classifier = EnergyClassifier::default();
        assert!(!classifier.is_voiced(&[]));
        assert!(!classifier.is_voiced(&vec![0.0; 1600]));
        assert!(!classifier.is_voiced(&vec![0.001; 1600]));
        assert!(classifier.is_voiced(&vec![0.1; 1600]));
    }

    #[test]
    fn test_level_db() {
        assert!((level_db(&[1.0, -1.0]) - 0.0).abs() < 1e-4);
        assert!((level_db(&[0.1; 10]) + 20.0).abs() < 1e-3);
    }

    #[test]
    fn test_monitor_emits_started_then_stopped() {
        let voiced = Arc::new(AtomicBool::new(false));
        let tap = AudioRingBuffer::new(64);
        let handle = VoiceActivityMonitor::attach(
            tap,
            Box::new(Switch(Arc::clone(&voiced))),
            fast_config(),
        );

        let (tx, rx) = unbounded();
        let started_tx = tx.clone();
        handle.on_speaking_started(move || {
            let _ = started_tx.send(VadSignal::SpeakingStarted);
        });
        handle.on_speaking_stopped(move || {
            let _ = tx.send(VadSignal::SpeakingStopped);
        });

        voiced.store(true, Ordering::SeqCst);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            VadSignal::SpeakingStarted
        );

        voiced.store(false, Ordering::SeqCst);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            VadSignal::SpeakingStopped
        );
    }

    #[test]
    fn test_no_callbacks_after_detach() {
        let voiced = Arc::new(AtomicBool::new(false));
        let mut handle = VoiceActivityMonitor::attach(
            AudioRingBuffer::new(64),
            Box::new(Switch(Arc::clone(&voiced))),
            fast_config(),
        );

        let (tx, rx) = unbounded();
        handle.on_speaking_started(move || {
            let _ = tx.send(());
        });

        handle.detach();
        assert!(!handle.is_attached());

        voiced.store(true, Ordering::SeqCst);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_silero_rejects_zero_rate() {
        assert!(SileroClassifier::new(0, 0.5).is_err());
    }
}
