//! Failure classes shared by every engine component.

use serde::Serialize;

/// How a failure should be surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Rejected input; nothing was persisted.
    Configuration,
    /// The operation does not apply to the current state. Not retried.
    Precondition,
    /// A finite pool (ports) ran out. The caller may reconfigure and retry.
    Exhaustion,
    NotFound,
    Internal,
}
