//! # berth-events
//!
//! The contract between the control plane and node agents.
//!
//! ## Lifecycle
//!
//! A deployment moves forward only:
//! `queued → building → deploying → running | failed | cancelled`.
//! See [`DeploymentStatus::can_transition_to`].
//!
//! ## Task envelope
//!
//! Tasks are persisted as `{"type": ..., "payload": {"task_id": ..., ...}}`
//! and handed to nodes as [`TaskEnvelope`]s. The shape is stable across
//! versions; `task_id` is backfilled from the task row's primary key when a
//! stored payload lacks one, so every delivered task can be acknowledged and
//! de-duplicated by the node.

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
