//! Error types for limit parsing and allocation checks.

use thiserror::Error;

use crate::ResourceKind;

/// Errors raised while validating configured limits.
///
/// All of these are configuration errors: they are raised before anything is
/// persisted and are never partially applied.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QuotaError {
    /// A negative value other than the `-1` auto marker.
    #[error("invalid limit {0}: use -1 for auto or a non-negative amount")]
    NegativeValue(i64),

    /// A user-facing quantity string that could not be converted.
    #[error("invalid quantity '{input}': {reason}")]
    InvalidQuantity { input: String, reason: &'static str },

    /// Fixed children at one level ask for more than the parent has.
    #[error("{kind} over-allocated: fixed children request {requested}, parent allows {available}")]
    Overallocated {
        kind: ResourceKind,
        requested: u64,
        available: u64,
    },
}

impl QuotaError {
    pub(crate) fn quantity(input: &str, reason: &'static str) -> Self {
        Self::InvalidQuantity {
            input: input.to_string(),
            reason,
        }
    }
}
