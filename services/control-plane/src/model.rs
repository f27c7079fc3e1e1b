//! Records owned by the control plane.
//!
//! Parents are referenced by ID only; the tenant tree is walked top-down
//! through the stores, never through owning pointers.

use std::collections::BTreeMap;
use std::time::Duration;

use berth_events::{ApplicationStatus, BuildSettings, DeploySource, DeploymentStatus, TaskStatus, TaskType};
use berth_id::{AppId, DeploymentId, EnvId, NodeId, ProjectId, TaskId, TeamId, UserId};
use berth_networking::PortRanges;
use berth_quota::units::{format_cpus, format_memory, parse_cpus, parse_memory};
use berth_quota::{Configured, ConfiguredLimits, EffectiveLimits, QuotaError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Tenant tree
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    /// Admin-set absolute ceilings. Unbounded means no ceiling.
    pub ceilings: EffectiveLimits,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub id: TeamId,
    pub owner_id: UserId,
    pub name: String,
    pub limits: ConfiguredLimits,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub team_id: TeamId,
    pub name: String,
    pub limits: ConfiguredLimits,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub id: EnvId,
    pub project_id: ProjectId,
    pub name: String,
    pub limits: ConfiguredLimits,
}

/// Desired state of one application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub id: AppId,
    pub environment_id: EnvId,
    pub name: String,
    pub source: DeploySource,
    pub build: BuildSettings,
    pub env_vars: BTreeMap<String, String>,
    pub limits: ConfiguredLimits,
    /// Docker `--cpus` string used when the tree leaves CPU unbounded.
    pub cpus: Option<String>,
    /// Docker `--memory` string used when the tree leaves memory unbounded.
    pub memory: Option<String>,
    pub node_id: Option<NodeId>,
    pub status: ApplicationStatus,
    /// Effective limits sent with the most recent deploy payload.
    pub applied_limits: Option<EffectiveLimits>,
}

impl Application {
    pub fn new(environment_id: EnvId, name: impl Into<String>, source: DeploySource) -> Self {
        Self {
            id: AppId::new(),
            environment_id,
            name: name.into(),
            source,
            build: BuildSettings::default(),
            env_vars: BTreeMap::new(),
            limits: ConfiguredLimits::default(),
            cpus: None,
            memory: None,
            node_id: None,
            status: ApplicationStatus::Stopped,
            applied_limits: None,
        }
    }

    /// Parses the docker `cpus`/`memory` strings and rewrites them in
    /// canonical form. `-1` and empty strings clear the field.
    pub fn normalize_resources(&mut self) -> Result<(), QuotaError> {
        self.cpus = normalize(self.cpus.as_deref(), parse_cpus, format_cpus)?;
        self.memory = normalize(self.memory.as_deref(), parse_memory, format_memory)?;
        Ok(())
    }
}

fn normalize(
    raw: Option<&str>,
    parse: fn(&str) -> Result<Configured, QuotaError>,
    format: fn(Configured) -> String,
) -> Result<Option<String>, QuotaError> {
    match raw.map(parse).transpose()? {
        Some(value @ Configured::Fixed(_)) => Ok(Some(format(value))),
        Some(Configured::Auto) | None => Ok(None),
    }
}

// =============================================================================
// Nodes and ports
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub port_ranges: PortRanges,
    /// Next port the allocator tries first.
    pub port_cursor: Option<u16>,
    /// Last time the node polled for tasks.
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl Node {
    pub fn new(name: impl Into<String>, port_ranges: PortRanges) -> Self {
        Self {
            id: NodeId::new(),
            name: name.into(),
            port_ranges,
            port_cursor: None,
            last_seen_at: None,
        }
    }

    pub fn is_reachable(&self, now: DateTime<Utc>, within: Duration) -> bool {
        let Some(seen) = self.last_seen_at else {
            return false;
        };
        let within = chrono::Duration::from_std(within).unwrap_or(chrono::Duration::MAX);
        now.signed_duration_since(seen) <= within
    }
}

/// Who holds an allocated port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum PortOwner {
    Application(AppId),
    Reservation(Uuid),
}

/// One bound port. Reservation rows carry an expiry, application rows never do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAllocation {
    pub node_id: NodeId,
    pub port: u16,
    pub owner: PortOwner,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl PortAllocation {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

// =============================================================================
// Deployments and tasks
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub application_id: AppId,
    pub node_id: NodeId,
    pub status: DeploymentStatus,
    /// Snapshot of the source revision at creation time.
    pub commit_sha: Option<String>,
    pub branch: Option<String>,
    pub logs: Vec<String>,
    pub rollback_to_deployment_id: Option<DeploymentId>,
    pub container_id: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Changes applied to a deployment row by a guarded transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentUpdate {
    pub status: Option<DeploymentStatus>,
    pub append_logs: Vec<String>,
    pub container_id: Option<String>,
    pub error: Option<String>,
    /// New status for the owning application, written in the same operation.
    pub application_status: Option<ApplicationStatus>,
}

impl DeploymentUpdate {
    pub fn status(status: DeploymentStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_application_status(mut self, status: ApplicationStatus) -> Self {
        self.application_status = Some(status);
        self
    }

    /// Applies the update to an in-memory copy.
    pub fn apply(&self, deployment: &mut Deployment, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            deployment.status = status;
            if status.is_terminal() {
                deployment.finished_at = Some(now);
            }
        }
        deployment.logs.extend(self.append_logs.iter().cloned());
        if self.container_id.is_some() {
            deployment.container_id.clone_from(&self.container_id);
        }
        if self.error.is_some() {
            deployment.error.clone_from(&self.error);
        }
        deployment.updated_at = now;
    }
}

/// A durable task row. Rows change status in place and are never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentTask {
    pub id: TaskId,
    pub node_id: NodeId,
    pub deployment_id: DeploymentId,
    pub task_type: TaskType,
    /// Stored `{type, payload}` envelope.
    pub data: serde_json::Value,
    pub status: TaskStatus,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
