//! Configuration for the turn-taking controller
//!
//! Every section has defaults, so a TOML file only needs the keys it
//! changes:
//!
//! ```toml
//! [session]
//! from_id = -1
//! to_id = 1
//!
//! [dialogue]
//! endpoint = "http://localhost:3000"
//!
//! [vad]
//! classifier = "silero"
//! ```

use crate::session::Session;
use crate::vad::MonitorConfig;
use crate::{ParleyError, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Which voiced/unvoiced classifier the monitor uses
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierKind {
    #[default]
    Energy,
    Silero,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    pub classifier: ClassifierKind,
    /// Poll interval in milliseconds
    pub interval_ms: u64,
    /// Consecutive unvoiced polls that end a voiced segment
    pub hangover_ticks: u32,
    /// Level gate for the energy classifier, in dBFS
    pub threshold_db: f32,
    /// Speech probability threshold for the Silero classifier
    pub speech_probability: f32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            classifier: ClassifierKind::Energy,
            interval_ms: 100,
            hangover_ticks: 10,
            threshold_db: -50.0,
            speech_probability: 0.5,
        }
    }
}

impl VadConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            interval: self.interval(),
            hangover_ticks: self.hangover_ticks,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Drop leading silence when speech starts
    pub trim_lead_in: bool,
    /// Audio kept from before the speech onset, in milliseconds
    pub pre_roll_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            trim_lead_in: true,
            pre_roll_ms: 300,
        }
    }
}

impl CaptureConfig {
    pub fn pre_roll(&self) -> Duration {
        Duration::from_millis(self.pre_roll_ms)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DialogueConfig {
    /// Base URL of the dialogue service
    pub endpoint: String,
    pub timeout_secs: u64,
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:3000".to_string(),
            timeout_secs: 60,
        }
    }
}

impl DialogueConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Configuration for the complete controller
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ParleyConfig {
    pub session: Session,
    pub vad: VadConfig,
    pub capture: CaptureConfig,
    pub dialogue: DialogueConfig,
    /// Capacity of the command and input channels
    pub channel_buffer_size: usize,
}

impl Default for ParleyConfig {
    fn default() -> Self {
        Self {
            session: Session::default(),
            vad: VadConfig::default(),
            capture: CaptureConfig::default(),
            dialogue: DialogueConfig::default(),
            channel_buffer_size: 100,
        }
    }
}

impl ParleyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a TOML file and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content)
            .map_err(|e| ParleyError::Config(format!("{}: {}", path.display(), e)))?;
        Ok(config)
    }

    /// Parse TOML text and validate
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: ParleyConfig =
            toml::from_str(content).map_err(|e| ParleyError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_session(mut self, session: Session) -> Self {
        self.session = session;
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.dialogue.endpoint = endpoint.into();
        self
    }

    pub fn with_vad(mut self, vad: VadConfig) -> Self {
        self.vad = vad;
        self
    }

    pub fn with_capture(mut self, capture: CaptureConfig) -> Self {
        self.capture = capture;
        self
    }

    pub fn with_channel_buffer_size(mut self, size: usize) -> Self {
        self.channel_buffer_size = size;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.vad.interval_ms == 0 {
            return Err(ParleyError::Config("VAD interval must be greater than 0".into()));
        }
        if self.vad.hangover_ticks == 0 {
            return Err(ParleyError::Config("VAD hangover must be at least one tick".into()));
        }
        if !(0.0..=1.0).contains(&self.vad.speech_probability) {
            return Err(ParleyError::Config(format!(
                "Speech probability must be within 0.0-1.0, got {}",
                self.vad.speech_probability
            )));
        }
        if self.dialogue.endpoint.is_empty() {
            return Err(ParleyError::Config("Dialogue endpoint is required".into()));
        }
        if self.channel_buffer_size == 0 {
            return Err(ParleyError::Config("Channel buffer size must be greater than 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ParleyConfig::new();
        assert_eq!(config.session, Session::new(-1, 1));
        assert_eq!(config.vad.interval(), Duration::from_millis(100));
        assert_eq!(config.vad.classifier, ClassifierKind::Energy);
        assert!(config.capture.trim_lead_in);
        assert_eq!(config.channel_buffer_size, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = ParleyConfig::from_toml(
            r#"
            [session]
            from_id = 7
            to_id = 42

            [vad]
            classifier = "silero"
            hangover_ticks = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.session, Session::new(7, 42));
        assert_eq!(config.vad.classifier, ClassifierKind::Silero);
        assert_eq!(config.vad.hangover_ticks, 5);
        assert_eq!(config.vad.interval_ms, 100);
        assert_eq!(config.dialogue.endpoint, "http://localhost:3000");
        assert_eq!(config.channel_buffer_size, 100);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(ParleyConfig::from_toml("[vad]\ninterval_ms = 0").is_err());
        assert!(ParleyConfig::from_toml("[vad]\nspeech_probability = 1.5").is_err());
        assert!(ParleyConfig::from_toml("[dialogue]\nendpoint = \"\"").is_err());
        assert!(ParleyConfig::from_toml("not toml [").is_err());
    }

    #[test]
    fn test_builder() {
        let config = ParleyConfig::new()
            .with_session(Session::new(3, 4))
            .with_endpoint("https://agent.example")
            .with_channel_buffer_size(16);

        assert_eq!(config.session.to_id, 4);
        assert_eq!(config.dialogue.endpoint, "https://agent.example");
        assert_eq!(config.channel_buffer_size, 16);
    }

    #[test]
    fn test_missing_file() {
        let result = ParleyConfig::load("/nonexistent/parley.toml");
        assert!(matches!(result, Err(ParleyError::IOError(_))));
    }
}
