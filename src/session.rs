use serde::Deserialize;
use std::fmt;

/// The two participants of a conversation
///
/// Fixed for the lifetime of the process and passed to the dialogue
/// service with every turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(default)]
pub struct Session {
    pub from_id: i64,
    pub to_id: i64,
}

impl Session {
    pub fn new(from_id: i64, to_id: i64) -> Self {
        Self { from_id, to_id }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new(-1, 1)
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from_id, self.to_id)
    }
}
