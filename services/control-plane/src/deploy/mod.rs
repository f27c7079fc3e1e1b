//! Deployment lifecycle and node dispatch.

mod orchestrator;
mod payload;
mod push;
mod queue;

pub use orchestrator::{CancelOutcome, DeploymentOrchestrator, RedeployStats};
pub use payload::{build_payload, resolve_placeholders, PlaceholderValues};
pub use push::{NodePush, PushError, WsHub};
pub use queue::{TaskQueue, DEFAULT_STALE_AFTER};

use berth_events::{DeploymentStatus, EventError};
use berth_id::{AppId, DeploymentId, NodeId};
use thiserror::Error;

use crate::db::DbError;
use crate::error::ErrorKind;
use crate::hierarchy::HierarchyError;
use crate::ports::PortError;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("application {0} not found")]
    ApplicationNotFound(AppId),

    #[error("deployment {0} not found")]
    DeploymentNotFound(DeploymentId),

    #[error("task {0} not found")]
    TaskNotFound(String),

    #[error("application {0} has no node assigned")]
    NoNodeAssigned(AppId),

    #[error("node {0} no longer exists")]
    NodeNotFound(NodeId),

    #[error("progress must report building or deploying, got {0}")]
    InvalidProgressStatus(DeploymentStatus),

    #[error("invalid task data: {0}")]
    Event(#[from] EventError),

    #[error(transparent)]
    Hierarchy(#[from] HierarchyError),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error(transparent)]
    Db(#[from] DbError),
}

impl DeployError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ApplicationNotFound(_) | Self::DeploymentNotFound(_) | Self::TaskNotFound(_) => {
                ErrorKind::NotFound
            }
            Self::NoNodeAssigned(_) | Self::NodeNotFound(_) => ErrorKind::Precondition,
            Self::InvalidProgressStatus(_) => ErrorKind::Configuration,
            Self::Hierarchy(e) => e.kind(),
            Self::Port(e) => e.kind(),
            Self::Event(_) | Self::Db(_) => ErrorKind::Internal,
        }
    }
}
