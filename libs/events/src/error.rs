//! Error types for the node wire format.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// A status string that does not name a known state.
    #[error("unknown {kind} status '{value}'")]
    UnknownStatus { kind: &'static str, value: String },

    /// Stored task data is not a `{type, payload}` object.
    #[error("invalid task envelope: {0}")]
    InvalidEnvelope(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
