//! End-to-end turn taking through `TurnHandle`
//!
//! The machine runs on its own thread with fake devices. VAD decisions come
//! from a switch the test flips, polled by a real monitor thread.

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use parley::audio::{AudioStream, CaptureDevice, OutputDevice, OutputSession};
use parley::config::{CaptureConfig, VadConfig};
use parley::orchestrator::Backends;
use parley::vad::VoiceClassifier;
use parley::{
    AudioClip, DialogueClient, ParleyConfig, ParleyError, Session, ToggleAction, TurnEvent,
    TurnHandle, TurnState, TurnStateMachine,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const RATE: u32 = 16000;

#[derive(Default)]
struct Microphone {
    deny: AtomicBool,
    acquired: AtomicUsize,
    latest: Mutex<Option<Sender<Vec<f32>>>>,
}

impl Microphone {
    fn say(&self, seconds: f32) {
        self.deliver(seconds, 0.3);
    }

    fn room_tone(&self, seconds: f32) {
        self.deliver(seconds, 0.0);
    }

    fn deliver(&self, seconds: f32, level: f32) {
        let tx = self.latest.lock().clone().expect("microphone not open");
        let samples = vec![level; (RATE as f32 * seconds) as usize];
        for chunk in samples.chunks(800) {
            tx.send(chunk.to_vec()).unwrap();
        }
    }
}

impl CaptureDevice for Microphone {
    fn acquire(&self) -> parley::Result<AudioStream> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        if self.deny.load(Ordering::SeqCst) {
            return Err(ParleyError::DeviceAcquisition("no input device".into()));
        }
        let (tx, rx) = bounded(4096);
        *self.latest.lock() = Some(tx);
        Ok(AudioStream::new(rx, RATE, None))
    }
}

/// Dialogue service recording what it was sent
///
/// Runs on a worker thread, so it only records; assertions stay on the
/// test thread.
struct Agent {
    exchanges: Mutex<Vec<(Session, Duration)>>,
    reply_seconds: f32,
}

impl DialogueClient for Agent {
    fn exchange(&self, session: &Session, clip: &AudioClip) -> parley::Result<AudioClip> {
        self.exchanges.lock().push((*session, clip.duration()));
        let samples = vec![0.1f32; (RATE as f32 * self.reply_seconds) as usize];
        AudioClip::encode_wav(&samples, RATE, 1)
    }
}

/// Speaker whose clips finish when the test releases them
struct Speaker {
    started: AtomicUsize,
    finish_txs: Sender<Sender<parley::Result<()>>>,
}

impl OutputDevice for Speaker {
    fn begin(&self, _clip: AudioClip) -> parley::Result<OutputSession> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let (stop_tx, _stop_rx) = bounded(1);
        let (finished_tx, finished_rx) = bounded(1);
        let _ = self.finish_txs.send(finished_tx);
        Ok(OutputSession::new(stop_tx, finished_rx))
    }
}

struct Switch(Arc<AtomicBool>);

impl VoiceClassifier for Switch {
    fn is_voiced(&mut self, _window: &[f32]) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct Conversation {
    handle: TurnHandle,
    events: Receiver<TurnEvent>,
    microphone: Arc<Microphone>,
    agent: Arc<Agent>,
    speaker: Arc<Speaker>,
    finish_rx: Receiver<Sender<parley::Result<()>>>,
    voiced: Arc<AtomicBool>,
    machine: Option<JoinHandle<()>>,
}

impl Conversation {
    fn new() -> Self {
        let microphone = Arc::new(Microphone::default());
        let agent = Arc::new(Agent {
            exchanges: Mutex::new(Vec::new()),
            reply_seconds: 0.5,
        });
        let (finish_txs, finish_rx) = unbounded();
        let speaker = Arc::new(Speaker {
            started: AtomicUsize::new(0),
            finish_txs,
        });
        let voiced = Arc::new(AtomicBool::new(false));

        let config = ParleyConfig::new()
            .with_session(Session::new(-1, 1))
            .with_vad(VadConfig {
                interval_ms: 5,
                hangover_ticks: 3,
                ..VadConfig::default()
            })
            .with_capture(CaptureConfig {
                trim_lead_in: false,
                ..CaptureConfig::default()
            });

        let switch = Arc::clone(&voiced);
        let backends = Backends::new(
            microphone.clone(),
            speaker.clone(),
            agent.clone(),
            &config.vad,
        )
        .with_classifier(Box::new(move |_| -> Box<dyn VoiceClassifier> {
            Box::new(Switch(Arc::clone(&switch)))
        }));

        let (machine, handle) = TurnStateMachine::new(config, backends).unwrap();
        let events = handle.subscribe();
        let machine = machine.start().unwrap();

        Self {
            handle,
            events,
            microphone,
            agent,
            speaker,
            finish_rx,
            voiced,
            machine: Some(machine),
        }
    }

    fn wait_for(&self, what: &str, done: impl Fn(&Self) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(self) {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn wait_for_recording(&self) {
        self.wait_for("recording", |c| {
            c.handle.turn() == TurnState::Listening && c.handle.state().is_recording()
        });
    }

    /// Speak for `seconds` and fall silent so the monitor closes the turn
    fn utter(&self, seconds: f32) {
        self.voiced.store(true, Ordering::SeqCst);
        self.microphone.say(seconds);
        std::thread::sleep(Duration::from_millis(30));
        self.voiced.store(false, Ordering::SeqCst);
    }

    fn next_playback(&self) -> Sender<parley::Result<()>> {
        self.finish_rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    fn transitions(&self) -> Vec<TurnState> {
        self.events
            .try_iter()
            .filter_map(|event| match event {
                TurnEvent::StateChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect()
    }
}

impl Drop for Conversation {
    fn drop(&mut self) {
        let _ = self.handle.shutdown();
        if let Some(machine) = self.machine.take() {
            let _ = machine.join();
        }
    }
}

#[test]
fn test_hands_free_turns() {
    let conversation = Conversation::new();
    assert_eq!(conversation.handle.toggle_action(), ToggleAction::StartListening);

    conversation.handle.start().unwrap();
    conversation.wait_for_recording();

    for turn in 1..=2u64 {
        conversation.utter(0.5);
        let finish = conversation.next_playback();
        conversation.wait_for("speaking", |c| c.handle.turn() == TurnState::Speaking);
        assert_eq!(conversation.handle.toggle_action(), ToggleAction::Interrupt);
        assert!(!conversation.handle.state().is_recording());

        finish.send(Ok(())).unwrap();
        conversation.wait_for_recording();
        assert_eq!(conversation.handle.state().turns_completed(), turn);
    }

    assert_eq!(
        conversation.transitions(),
        vec![
            TurnState::Listening,
            TurnState::Processing,
            TurnState::Speaking,
            TurnState::Listening,
            TurnState::Processing,
            TurnState::Speaking,
            TurnState::Listening,
        ]
    );
    let expected = (Session::new(-1, 1), Duration::from_millis(500));
    assert_eq!(conversation.agent.exchanges.lock().as_slice(), &[expected, expected]);
}

#[test]
fn test_interrupt_cuts_agent_off() {
    let conversation = Conversation::new();
    conversation.handle.toggle().unwrap();
    conversation.wait_for_recording();

    conversation.utter(0.3);
    let finish = conversation.next_playback();
    conversation.wait_for("speaking", |c| c.handle.turn() == TurnState::Speaking);

    conversation.handle.toggle().unwrap();
    conversation.wait_for_recording();
    assert!(!conversation.handle.state().is_playback_active());

    // The cut-off reply finishing late changes nothing
    let _ = finish.send(Ok(()));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(conversation.handle.turn(), TurnState::Listening);
    assert_eq!(conversation.handle.state().turns_completed(), 0);
    assert_eq!(conversation.speaker.started.load(Ordering::SeqCst), 1);
}

#[test]
fn test_missing_microphone_halts() {
    let conversation = Conversation::new();
    conversation.microphone.deny.store(true, Ordering::SeqCst);

    conversation.handle.start().unwrap();
    conversation.wait_for("halt", |c| c.handle.snapshot().halted_by.is_some());

    let state = conversation.handle.snapshot();
    assert_eq!(state.turn, TurnState::Idle);
    assert!(!state.halted_by.unwrap().is_recoverable());
    assert_eq!(conversation.microphone.acquired.load(Ordering::SeqCst), 1);
}

#[test]
fn test_end_returns_to_idle() {
    let conversation = Conversation::new();
    conversation.handle.start().unwrap();
    conversation.wait_for_recording();

    conversation.handle.end().unwrap();
    conversation.wait_for("idle", |c| c.handle.turn() == TurnState::Idle);

    let state = conversation.handle.snapshot();
    assert!(!state.recording);
    assert!(!state.busy);
    assert_eq!(state.toggle_action(), ToggleAction::StartListening);
}

#[test]
fn test_manual_stop_before_speech_recovers() {
    let conversation = Conversation::new();
    conversation.handle.start().unwrap();
    conversation.wait_for_recording();

    conversation.microphone.room_tone(0.5);
    std::thread::sleep(Duration::from_millis(20));
    conversation.handle.stop_listening().unwrap();

    conversation.wait_for("recovery", |c| {
        c.handle.snapshot().last_error == Some(ParleyError::EmptyCapture)
    });
    conversation.wait_for_recording();
    assert!(conversation.agent.exchanges.lock().is_empty());
    assert_eq!(conversation.speaker.started.load(Ordering::SeqCst), 0);
}
