//! Turn state machine coordinating capture, VAD, dialogue and playback
//!
//! The machine owns every transition of `TurnState`. It runs on one thread
//! and reacts to two serialized inputs:
//! - **Commands** from the UI or tests, through `TurnHandle`
//! - **Inputs** posted back by the workers it spawned (device acquisition,
//!   VAD signals, capture encoding, dialogue replies, playback outcomes)
//!
//! Blocking work never runs on the machine thread. Each worker result is
//! tagged with the turn epoch (or monitor/playback id) it belongs to, and
//! results from superseded work are dropped on arrival.
//!
//! ```text
//! Idle --Start--> Listening --silence/StopListening--> Processing
//!   ^                ^                                     |
//!   |                +--------- failure / Interrupt -------+
//!   |                |                                     v
//!   +----End---------+--- playback done / barge-in --- Speaking
//! ```

use crate::audio::{AudioClip, AudioRingBuffer, AudioStream, CaptureDevice, OutputDevice};
use crate::config::{ClassifierKind, ParleyConfig, VadConfig};
use crate::dialogue::DialogueClient;
use crate::playback::{PlaybackController, PlaybackId, PlaybackOutcome};
use crate::recorder::{Recorder, RecordingSession};
use crate::session::Session;
use crate::state::{
    ConversationState, Observers, SharedConversationState, ToggleAction, TurnCommand, TurnEvent,
    TurnState,
};
use crate::vad::{
    EnergyClassifier, MonitorHandle, SileroClassifier, VadSignal, VoiceActivityMonitor,
    VoiceClassifier,
};
use crate::{ParleyError, Result};
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Builds a classifier for a stream with the given sample rate
pub type ClassifierFactory = Box<dyn Fn(u32) -> Box<dyn VoiceClassifier> + Send>;

/// Classifier factory for the configured `ClassifierKind`
///
/// Silero falls back to the energy gate when the model cannot be loaded
/// for the stream's sample rate.
pub fn classifier_factory(config: &VadConfig) -> ClassifierFactory {
    let kind = config.classifier;
    let threshold_db = config.threshold_db;
    let probability = config.speech_probability;

    Box::new(move |sample_rate| -> Box<dyn VoiceClassifier> {
        match kind {
            ClassifierKind::Energy => Box::new(EnergyClassifier::new(threshold_db)),
            ClassifierKind::Silero => match SileroClassifier::new(sample_rate, probability) {
                Ok(classifier) => Box::new(classifier),
                Err(e) => {
                    warn!("Silero unavailable at {} Hz, using energy gate: {}", sample_rate, e);
                    Box::new(EnergyClassifier::new(threshold_db))
                }
            },
        }
    })
}

/// Devices and services the machine drives
pub struct Backends {
    pub capture: Arc<dyn CaptureDevice>,
    pub output: Arc<dyn OutputDevice>,
    pub dialogue: Arc<dyn DialogueClient>,
    pub classifier: ClassifierFactory,
}

impl Backends {
    pub fn new(
        capture: Arc<dyn CaptureDevice>,
        output: Arc<dyn OutputDevice>,
        dialogue: Arc<dyn DialogueClient>,
        vad: &VadConfig,
    ) -> Self {
        Self {
            capture,
            output,
            dialogue,
            classifier: classifier_factory(vad),
        }
    }

    /// Replace the configured classifier
    pub fn with_classifier(mut self, factory: ClassifierFactory) -> Self {
        self.classifier = factory;
        self
    }
}

/// Results posted back to the machine thread
enum Input {
    CaptureAcquired {
        epoch: u64,
        result: Result<AudioStream>,
    },
    Vad {
        monitor: u64,
        signal: VadSignal,
    },
    CaptureFinished {
        epoch: u64,
        result: Result<AudioClip>,
    },
    ReplyReceived {
        epoch: u64,
        result: Result<AudioClip>,
    },
    PlaybackFinished {
        playback: PlaybackId,
        outcome: PlaybackOutcome,
    },
    PlaybackActivity(bool),
}

/// Handle for controlling the machine from the UI or tests
#[derive(Clone)]
pub struct TurnHandle {
    command_tx: Sender<TurnCommand>,
    state: SharedConversationState,
    observers: Observers,
}

impl TurnHandle {
    pub fn send_command(&self, cmd: TurnCommand) -> Result<()> {
        self.command_tx
            .send(cmd)
            .map_err(|e| ParleyError::Channel(format!("Failed to send command: {}", e)))
    }

    pub fn start(&self) -> Result<()> {
        self.send_command(TurnCommand::Start)
    }

    pub fn stop_listening(&self) -> Result<()> {
        self.send_command(TurnCommand::StopListening)
    }

    pub fn interrupt(&self) -> Result<()> {
        self.send_command(TurnCommand::Interrupt)
    }

    /// Press the tri-state control
    pub fn toggle(&self) -> Result<()> {
        self.send_command(TurnCommand::Toggle)
    }

    pub fn end(&self) -> Result<()> {
        self.send_command(TurnCommand::End)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send_command(TurnCommand::Shutdown)
    }

    /// New receiver for every event from now on
    pub fn subscribe(&self) -> Receiver<TurnEvent> {
        self.observers.subscribe()
    }

    pub fn state(&self) -> &SharedConversationState {
        &self.state
    }

    pub fn snapshot(&self) -> ConversationState {
        self.state.snapshot()
    }

    pub fn turn(&self) -> TurnState {
        self.state.turn()
    }

    pub fn is_busy(&self) -> bool {
        self.state.is_busy()
    }

    pub fn toggle_action(&self) -> ToggleAction {
        self.state.toggle_action()
    }
}

/// The turn-taking controller
///
/// Created with `new`, then moved onto its own thread with `start`.
pub struct TurnStateMachine {
    config: ParleyConfig,
    session: Session,

    capture: Arc<dyn CaptureDevice>,
    dialogue: Arc<dyn DialogueClient>,
    classifier: ClassifierFactory,
    playback: PlaybackController,
    recorder: Recorder,
    monitor: Option<(u64, MonitorHandle)>,

    state: SharedConversationState,
    observers: Observers,

    command_rx: Receiver<TurnCommand>,
    input_tx: Sender<Input>,
    input_rx: Receiver<Input>,

    /// Bumped whenever a new capture begins or the conversation ends
    epoch: u64,
    /// A device acquisition for `epoch` is outstanding
    acquiring: bool,
    next_monitor: u64,
    playback_id: Option<PlaybackId>,
}

impl TurnStateMachine {
    pub fn new(config: ParleyConfig, backends: Backends) -> Result<(Self, TurnHandle)> {
        config.validate()?;

        let state = SharedConversationState::new();
        let observers = Observers::new();
        let (command_tx, command_rx) = bounded(config.channel_buffer_size);
        // Unbounded: workers post from under device locks and must never block
        let (input_tx, input_rx) = unbounded();

        let activity_tx = input_tx.clone();
        let playback = PlaybackController::new(backends.output).with_activity_hook(move |active| {
            let _ = activity_tx.send(Input::PlaybackActivity(active));
        });

        let handle = TurnHandle {
            command_tx,
            state: state.clone(),
            observers: observers.clone(),
        };

        let machine = Self {
            session: config.session,
            config,
            capture: backends.capture,
            dialogue: backends.dialogue,
            classifier: backends.classifier,
            playback,
            recorder: Recorder::new(),
            monitor: None,
            state,
            observers,
            command_rx,
            input_tx,
            input_rx,
            epoch: 0,
            acquiring: false,
            next_monitor: 0,
            playback_id: None,
        };

        Ok((machine, handle))
    }

    /// Run the machine on its own thread until `Shutdown`
    pub fn start(self) -> Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("parley-turns".into())
            .spawn(move || self.run())
            .map_err(|e| ParleyError::Channel(format!("Failed to spawn turn thread: {}", e)))
    }

    fn run(mut self) {
        info!("Turn state machine started for session {}", self.session);
        let command_rx = self.command_rx.clone();
        let input_rx = self.input_rx.clone();

        loop {
            select! {
                recv(command_rx) -> cmd => match cmd {
                    Ok(cmd) => {
                        if !self.handle_command(cmd) {
                            break;
                        }
                    }
                    Err(_) => {
                        debug!("All handles dropped, ending conversation");
                        self.end_conversation();
                        break;
                    }
                },
                recv(input_rx) -> input => {
                    if let Ok(input) = input {
                        self.handle_input(input);
                    }
                }
            }
        }

        info!("Turn state machine stopped");
    }

    /// Apply one user command; `false` means the loop should exit
    fn handle_command(&mut self, cmd: TurnCommand) -> bool {
        debug!("Command {:?} in {}", cmd, self.state.turn());
        match cmd {
            TurnCommand::Start => self.start_conversation(),
            TurnCommand::StopListening => self.stop_listening(),
            TurnCommand::Interrupt => self.interrupt(),
            TurnCommand::Toggle => match self.state.toggle_action() {
                ToggleAction::StartListening => self.start_conversation(),
                ToggleAction::StopListening => self.stop_listening(),
                ToggleAction::Interrupt => self.interrupt(),
                ToggleAction::Disabled => {
                    debug!("Toggle ignored while {}", self.state.turn());
                }
            },
            TurnCommand::End => self.end_conversation(),
            TurnCommand::Shutdown => {
                self.end_conversation();
                self.observers.notify(TurnEvent::Shutdown);
                return false;
            }
        }
        true
    }

    fn handle_input(&mut self, input: Input) {
        match input {
            Input::CaptureAcquired { epoch, result } => {
                if epoch != self.epoch || !self.acquiring {
                    // Dropping the stream releases the device
                    debug!("Discarding capture stream from superseded turn");
                    return;
                }
                self.acquiring = false;
                match result {
                    Ok(stream) => self.arm(stream),
                    Err(e) => self.recover_or_halt(e),
                }
            }

            Input::Vad { monitor, signal } => {
                if self.monitor.as_ref().map(|(id, _)| *id) != Some(monitor) {
                    debug!("Discarding {:?} from detached monitor {}", signal, monitor);
                    return;
                }
                self.on_vad(signal);
            }

            Input::CaptureFinished { epoch, result } => {
                if epoch != self.epoch || !self.state.turn().is_processing() {
                    debug!("Discarding capture from superseded turn");
                    return;
                }
                match result {
                    Ok(clip) if clip.is_empty() => self.recover(ParleyError::EmptyCapture),
                    Ok(clip) => self.send_to_dialogue(clip),
                    Err(e) => self.recover_or_halt(e),
                }
            }

            Input::ReplyReceived { epoch, result } => {
                if epoch != self.epoch || !self.state.turn().is_processing() {
                    debug!("Discarding reply for abandoned turn");
                    return;
                }
                match result {
                    Ok(reply) => self.speak(reply),
                    Err(e) => self.recover_or_halt(e),
                }
            }

            Input::PlaybackFinished { playback, outcome } => {
                if self.playback_id != Some(playback) || !self.state.turn().is_speaking() {
                    debug!("Discarding outcome of stopped playback {}", playback);
                    return;
                }
                self.playback_id = None;
                match outcome {
                    PlaybackOutcome::Completed => {
                        self.state.write().turns_completed += 1;
                        info!("Agent finished speaking, listening again");
                        self.restart_capture();
                    }
                    PlaybackOutcome::Failed(e) => self.recover_or_halt(e),
                }
            }

            Input::PlaybackActivity(active) => {
                let changed = {
                    let mut state = self.state.write();
                    let changed = state.playback_active != active;
                    state.playback_active = active;
                    changed
                };
                if changed {
                    self.observers.notify(TurnEvent::PlaybackActivity(active));
                }
            }
        }
    }

    fn on_vad(&mut self, signal: VadSignal) {
        let turn = self.state.turn();
        match signal {
            VadSignal::SpeakingStarted if turn.is_speaking() => {
                info!("Barge-in: human started speaking over the agent");
                self.restart_capture();
            }
            VadSignal::SpeakingStarted => {
                // Stray output would otherwise end up in the capture
                self.playback.stop();
                if let Some(session) = self.recorder.current().filter(|_| turn.is_listening()) {
                    session.mark_voiced();
                    if self.config.capture.trim_lead_in {
                        session.trim_to_pre_roll(self.config.capture.pre_roll());
                    }
                }
                debug!("Speech started");
            }
            VadSignal::SpeakingStopped if turn.is_listening() => {
                debug!("Speech stopped, closing the turn");
                self.stop_listening();
            }
            VadSignal::SpeakingStopped => {
                debug!("Speech stopped while {}, ignored", turn);
            }
        }
    }

    fn start_conversation(&mut self) {
        let turn = self.state.turn();
        if !turn.is_idle() {
            warn!("Cannot start: conversation already {}", turn);
            return;
        }
        self.state.write().halted_by = None;
        info!("Conversation started for session {}", self.session);
        self.begin_capture();
    }

    /// Enter `Listening` and acquire the microphone off-thread
    fn begin_capture(&mut self) {
        self.epoch += 1;
        self.acquiring = true;
        self.transition(TurnState::Listening);

        let epoch = self.epoch;
        let capture = Arc::clone(&self.capture);
        let spawned = self.spawn_worker("parley-acquire", move || Input::CaptureAcquired {
            epoch,
            result: capture.acquire(),
        });
        if let Err(e) = spawned {
            self.acquiring = false;
            self.halt(e);
        }
    }

    /// Open a recording session on a freshly acquired stream
    fn arm(&mut self, stream: AudioStream) {
        let sample_rate = stream.sample_rate();
        let window = self.config.vad.interval() * 2;
        let tap = match self.recorder.start(stream, window).map(|session| session.tap()) {
            Ok(tap) => tap,
            Err(e) => {
                self.halt(e);
                return;
            }
        };
        self.attach_monitor(tap, sample_rate);

        let mut state = self.state.write();
        state.recording = true;
        state.turn_id = Some(Uuid::new_v4());
        debug!("Listening at {} Hz", sample_rate);
    }

    fn attach_monitor(&mut self, tap: AudioRingBuffer, sample_rate: u32) {
        self.detach_monitor();
        self.next_monitor += 1;
        let id = self.next_monitor;

        let classifier = (self.classifier)(sample_rate);
        let handle = VoiceActivityMonitor::attach(tap, classifier, self.config.vad.monitor_config());

        let started_tx = self.input_tx.clone();
        handle.on_speaking_started(move || {
            let _ = started_tx.send(Input::Vad {
                monitor: id,
                signal: VadSignal::SpeakingStarted,
            });
        });
        let stopped_tx = self.input_tx.clone();
        handle.on_speaking_stopped(move || {
            let _ = stopped_tx.send(Input::Vad {
                monitor: id,
                signal: VadSignal::SpeakingStopped,
            });
        });

        self.monitor = Some((id, handle));
    }

    fn detach_monitor(&mut self) {
        if let Some((id, mut handle)) = self.monitor.take() {
            handle.detach();
            debug!("Monitor {} detached", id);
        }
    }

    /// Close the human's turn and encode the capture off-thread
    fn stop_listening(&mut self) {
        let turn = self.state.turn();
        if !turn.is_listening() {
            warn!("Cannot stop listening while {}", turn);
            return;
        }
        let Some(session) = self.recorder.take() else {
            warn!("Microphone not open yet, nothing to stop");
            return;
        };

        self.state.write().recording = false;
        self.transition(TurnState::Processing);
        self.set_busy(true);

        let epoch = self.epoch;
        if let Err(e) = self.spawn_capture_stop(session, epoch) {
            self.recover_or_halt(e);
        }
    }

    fn spawn_capture_stop(&self, session: RecordingSession, epoch: u64) -> Result<()> {
        self.spawn_worker("parley-encode", move || Input::CaptureFinished {
            epoch,
            result: session.stop(),
        })
    }

    fn send_to_dialogue(&mut self, clip: AudioClip) {
        info!("Sending {:?} of speech to the agent", clip.duration());
        let epoch = self.epoch;
        let dialogue = Arc::clone(&self.dialogue);
        let session = self.session;

        let spawned = self.spawn_worker("parley-dialogue", move || Input::ReplyReceived {
            epoch,
            result: dialogue.exchange(&session, &clip),
        });
        if let Err(e) = spawned {
            self.recover_or_halt(e);
        }
    }

    fn speak(&mut self, reply: AudioClip) {
        self.set_busy(false);
        let finished_tx = self.input_tx.clone();
        let played = self.playback.play(reply, move |playback, outcome| {
            let _ = finished_tx.send(Input::PlaybackFinished { playback, outcome });
        });

        match played {
            Ok(id) => {
                self.playback_id = Some(id);
                self.transition(TurnState::Speaking);
            }
            Err(e) => self.recover_or_halt(e),
        }
    }

    fn interrupt(&mut self) {
        match self.state.turn() {
            TurnState::Speaking => {
                info!("Agent interrupted");
                self.restart_capture();
            }
            TurnState::Processing => {
                info!("Abandoning reply in flight");
                self.restart_capture();
            }
            turn => debug!("Nothing to interrupt while {}", turn),
        }
    }

    /// Drop whatever the current turn holds and listen again
    fn restart_capture(&mut self) {
        self.playback.stop();
        self.playback_id = None;
        self.detach_monitor();
        self.recorder.discard();
        self.state.write().recording = false;
        self.set_busy(false);
        self.begin_capture();
    }

    fn recover(&mut self, err: ParleyError) {
        warn!("Turn failed, listening again: {}", err);
        self.state.write().last_error = Some(err.clone());
        self.observers.notify(TurnEvent::Recovered(err));
        self.restart_capture();
    }

    fn recover_or_halt(&mut self, err: ParleyError) {
        if err.is_recoverable() {
            self.recover(err);
        } else {
            self.halt(err);
        }
    }

    fn halt(&mut self, err: ParleyError) {
        error!("Conversation halted: {}", err);
        self.end_conversation();
        {
            let mut state = self.state.write();
            state.last_error = Some(err.clone());
            state.halted_by = Some(err.clone());
        }
        self.observers.notify(TurnEvent::Halted(err));
    }

    /// Release every resource and return to `Idle`
    fn end_conversation(&mut self) {
        self.epoch += 1;
        self.acquiring = false;
        self.playback.stop();
        self.playback_id = None;
        self.detach_monitor();
        self.recorder.discard();
        {
            let mut state = self.state.write();
            state.recording = false;
            state.turn_id = None;
        }
        self.set_busy(false);
        if !self.state.turn().is_idle() {
            info!("Conversation ended");
        }
        self.transition(TurnState::Idle);
    }

    fn transition(&self, to: TurnState) {
        let from = {
            let mut state = self.state.write();
            let from = state.turn;
            state.turn = to;
            from
        };
        if from != to {
            debug!("Turn {} -> {}", from, to);
            self.observers.notify(TurnEvent::StateChanged { from, to });
        }
    }

    fn set_busy(&self, busy: bool) {
        let changed = {
            let mut state = self.state.write();
            let changed = state.busy != busy;
            state.busy = busy;
            changed
        };
        if changed {
            self.observers.notify(TurnEvent::BusyChanged(busy));
        }
    }

    fn spawn_worker(&self, name: &str, work: impl FnOnce() -> Input + Send + 'static) -> Result<()> {
        let input_tx = self.input_tx.clone();
        thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                let _ = input_tx.send(work());
            })
            .map(|_| ())
            .map_err(|e| ParleyError::Channel(format!("Failed to spawn {}: {}", name, e)))
    }

    /// Block until one posted input arrives and apply it
    #[cfg(test)]
    fn pump(&mut self, timeout: std::time::Duration) -> bool {
        match self.input_rx.recv_timeout(timeout) {
            Ok(input) => {
                self.handle_input(input);
                true
            }
            Err(_) => false,
        }
    }
}
