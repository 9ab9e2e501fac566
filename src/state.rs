//! Observable conversation state
//!
//! The turn state machine is the only writer of `ConversationState`; the
//! UI and tests read it through `SharedConversationState` and subscribe to
//! `TurnEvent`s for change notifications.
//!
//! The design separates:
//! - **State**: data that can be queried synchronously
//! - **Commands**: requests from the user, serialized through the machine
//! - **Events**: notifications pushed to every subscriber

use crate::ParleyError;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use uuid::Uuid;

/// Whose turn it is
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TurnState {
    /// Conversation not running
    #[default]
    Idle,
    /// Capturing the human's turn
    Listening,
    /// Capture finished, waiting for the agent's reply
    Processing,
    /// Playing the agent's reply
    Speaking,
}

impl TurnState {
    pub fn is_idle(&self) -> bool {
        matches!(self, TurnState::Idle)
    }

    pub fn is_listening(&self) -> bool {
        matches!(self, TurnState::Listening)
    }

    pub fn is_processing(&self) -> bool {
        matches!(self, TurnState::Processing)
    }

    pub fn is_speaking(&self) -> bool {
        matches!(self, TurnState::Speaking)
    }
}

impl std::fmt::Display for TurnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TurnState::Idle => write!(f, "Idle"),
            TurnState::Listening => write!(f, "Listening"),
            TurnState::Processing => write!(f, "Processing"),
            TurnState::Speaking => write!(f, "Speaking"),
        }
    }
}

/// What the single tri-state control does right now
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToggleAction {
    StartListening,
    StopListening,
    Interrupt,
    /// Reply in flight; the control is disabled
    Disabled,
}

impl ToggleAction {
    pub fn label(&self) -> &'static str {
        match self {
            ToggleAction::StartListening => "Start Listening",
            ToggleAction::StopListening => "Stop Listening",
            ToggleAction::Interrupt => "Interrupt",
            ToggleAction::Disabled => "Waiting...",
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, ToggleAction::Disabled)
    }
}

/// Snapshot-able conversation state
#[derive(Clone, Debug, Default)]
pub struct ConversationState {
    pub turn: TurnState,
    /// Raised for the duration of `Processing`
    pub busy: bool,
    /// A recording session is open on the microphone
    pub recording: bool,
    /// Reply audio is audibly playing
    pub playback_active: bool,
    /// Last error, recovered or not
    pub last_error: Option<ParleyError>,
    /// Error that stopped the conversation and needs the user
    pub halted_by: Option<ParleyError>,
    pub turns_completed: u64,
    pub turn_id: Option<Uuid>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Action of the tri-state control for the current state
    pub fn toggle_action(&self) -> ToggleAction {
        match self.turn {
            TurnState::Speaking => ToggleAction::Interrupt,
            TurnState::Processing => ToggleAction::Disabled,
            TurnState::Listening if self.recording => ToggleAction::StopListening,
            // Still acquiring the microphone
            TurnState::Listening => ToggleAction::Disabled,
            TurnState::Idle => ToggleAction::StartListening,
        }
    }
}

/// Thread-safe shared conversation state
#[derive(Clone, Default)]
pub struct SharedConversationState {
    inner: Arc<RwLock<ConversationState>>,
}

impl SharedConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> parking_lot::RwLockReadGuard<'_, ConversationState> {
        self.inner.read()
    }

    pub(crate) fn write(&self) -> parking_lot::RwLockWriteGuard<'_, ConversationState> {
        self.inner.write()
    }

    /// Copy of the current state; no lock held after return
    pub fn snapshot(&self) -> ConversationState {
        self.inner.read().clone()
    }

    pub fn turn(&self) -> TurnState {
        self.inner.read().turn
    }

    pub fn is_busy(&self) -> bool {
        self.inner.read().busy
    }

    pub fn is_recording(&self) -> bool {
        self.inner.read().recording
    }

    pub fn is_playback_active(&self) -> bool {
        self.inner.read().playback_active
    }

    pub fn toggle_action(&self) -> ToggleAction {
        self.inner.read().toggle_action()
    }

    pub fn turns_completed(&self) -> u64 {
        self.inner.read().turns_completed
    }
}

/// User requests, processed in order by the turn state machine
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TurnCommand {
    /// Begin the conversation (Idle only)
    Start,
    /// Finish the human's turn now instead of waiting for silence
    StopListening,
    /// Cut the agent off, or abandon a reply in flight, and listen again
    Interrupt,
    /// Whatever the tri-state control currently means
    Toggle,
    /// Tear everything down and return to Idle
    End,
    /// Stop the state machine thread
    Shutdown,
}

/// Notifications for observers
#[derive(Clone, Debug, PartialEq)]
pub enum TurnEvent {
    StateChanged { from: TurnState, to: TurnState },
    BusyChanged(bool),
    PlaybackActivity(bool),
    /// A failure the machine recovered from by listening again
    Recovered(ParleyError),
    /// A failure that halted the conversation
    Halted(ParleyError),
    Shutdown,
}

/// Fan-out of `TurnEvent`s to any number of subscribers
#[derive(Clone, Default)]
pub struct Observers {
    subscribers: Arc<Mutex<Vec<Sender<TurnEvent>>>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<TurnEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver to every live subscriber, forgetting dropped ones
    pub fn notify(&self, event: TurnEvent) {
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    pub fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.lock().is_empty()
    }
}
