//! Parley - hands-free voice turn-taking with a remote dialogue agent
//!
//! The crate alternates speaking turns between a human and a dialogue agent
//! over a single audio channel. Voice activity detection decides when the
//! human has finished, playback completion decides when the agent has
//! finished, and the turn state machine re-arms listening on its own.

pub mod audio;
pub mod config;
pub mod dialogue;
pub mod orchestrator;
pub mod playback;
pub mod recorder;
pub mod session;
pub mod state;
pub mod vad;

pub use audio::AudioClip;
pub use config::ParleyConfig;
pub use dialogue::DialogueClient;
pub use orchestrator::{TurnHandle, TurnStateMachine};
pub use session::Session;
pub use state::{ConversationState, ToggleAction, TurnCommand, TurnEvent, TurnState};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParleyError {
    #[error("Device acquisition error: {0}")]
    DeviceAcquisition(String),

    #[error("Capture stopped with no audio")]
    EmptyCapture,

    #[error("Dialogue transport error: {0}")]
    DialogueTransport(String),

    #[error("Playback decode error: {0}")]
    PlaybackDecode(String),

    #[error("Audio processing error: {0}")]
    AudioProcessing(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("IO error: {0}")]
    IOError(String),
}

impl From<std::io::Error> for ParleyError {
    fn from(e: std::io::Error) -> Self {
        ParleyError::IOError(e.to_string())
    }
}

impl ParleyError {
    /// Check if the turn cycle can recover from this error on its own
    ///
    /// Recoverable errors restart capture; everything else halts the
    /// conversation until the user starts it again.
    pub fn is_recoverable(&self) -> bool {
        match self {
            // Needs the user to fix permissions or plug in a device
            ParleyError::DeviceAcquisition(_) => false,
            ParleyError::EmptyCapture => true,
            ParleyError::DialogueTransport(_) => true,
            ParleyError::PlaybackDecode(_) => true,
            ParleyError::AudioProcessing(_) => true,
            ParleyError::Config(_) => false,
            ParleyError::Channel(_) => false,
            ParleyError::IOError(_) => false,
        }
    }

    /// Get a user-friendly description
    pub fn user_message(&self) -> String {
        match self {
            ParleyError::DeviceAcquisition(_) => {
                "Microphone or speaker unavailable. Check permissions and try again.".to_string()
            }
            ParleyError::EmptyCapture => "Didn't catch that. Listening again.".to_string(),
            ParleyError::DialogueTransport(_) => {
                "Couldn't reach the agent. Listening again.".to_string()
            }
            ParleyError::PlaybackDecode(_) => {
                "Couldn't play the reply. Listening again.".to_string()
            }
            ParleyError::AudioProcessing(_) => "Audio processing failed.".to_string(),
            ParleyError::Config(_) => "Configuration error. Please check settings.".to_string(),
            ParleyError::Channel(_) => {
                "Internal communication error. Please restart the application.".to_string()
            }
            ParleyError::IOError(_) => "File system error occurred.".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ParleyError>;
