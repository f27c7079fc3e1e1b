//! Error types for ID parsing.

use thiserror::Error;

/// Errors that can occur when parsing IDs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The ID has a prefix belonging to another resource type.
    #[error("invalid ID prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The ID is missing the underscore separator.
    #[error("ID missing underscore separator")]
    MissingSeparator,

    /// The ULID portion of the ID is invalid.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),

    /// The prefix does not name any known resource type.
    #[error("unknown ID prefix '{0}'")]
    UnknownPrefix(String),
}

impl IdError {
    /// Returns true if this error indicates a prefix mismatch.
    pub fn is_prefix_error(&self) -> bool {
        matches!(self, IdError::InvalidPrefix { .. } | IdError::UnknownPrefix(_))
    }
}
