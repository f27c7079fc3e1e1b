//! Persistence seams.
//!
//! The engine talks to storage only through these traits. [`crate::db::PgStore`]
//! implements them on Postgres; [`MemoryStore`] implements them in-process
//! with the same uniqueness and compare-and-set semantics.
//!
//! Every method is a single atomic step. Nothing here holds a lock across
//! calls; callers re-read state instead.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use berth_events::{DeploymentStatus, TaskStatus};
use berth_id::{AppId, DeploymentId, NodeId, UserId};
use berth_networking::PortRanges;
use berth_quota::{ConfiguredLimits, EffectiveLimits, ResourceKind};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::DbError;
use crate::hierarchy::EntityRef;
use crate::model::{
    Application, Deployment, DeploymentTask, DeploymentUpdate, Environment, Node, PortAllocation,
    Project, Team, User,
};

/// A team, project, environment or application with its configured limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitNode {
    pub entity: EntityRef,
    pub parent: EntityRef,
    pub limits: ConfiguredLimits,
}

/// The tenant tree and its configured limits.
#[async_trait]
pub trait HierarchyStore: Send + Sync {
    async fn insert_user(&self, user: &User) -> Result<(), DbError>;
    async fn insert_team(&self, team: &Team) -> Result<(), DbError>;
    async fn insert_project(&self, project: &Project) -> Result<(), DbError>;
    async fn insert_environment(&self, environment: &Environment) -> Result<(), DbError>;
    async fn insert_application(&self, application: &Application) -> Result<(), DbError>;

    /// Removes an application. Its port rows are left for the orphan sweep.
    async fn delete_application(&self, id: &AppId) -> Result<bool, DbError>;

    async fn user_ceilings(&self, id: &UserId) -> Result<Option<EffectiveLimits>, DbError>;

    /// Loads a non-user entity. Users have no configured limits and yield `None`.
    async fn limit_node(&self, entity: &EntityRef) -> Result<Option<LimitNode>, DbError>;

    /// Direct children of `parent`, ordered by ID.
    async fn children(&self, parent: &EntityRef) -> Result<Vec<LimitNode>, DbError>;

    async fn set_user_ceilings(&self, id: &UserId, ceilings: &EffectiveLimits)
        -> Result<bool, DbError>;

    async fn set_limits(&self, entity: &EntityRef, limits: &ConfiguredLimits)
        -> Result<bool, DbError>;

    /// Rewrites one kind to auto on every listed entity that has it fixed.
    ///
    /// All entities belong to the same level; the rewrite is one atomic step.
    async fn reset_to_auto(&self, kind: ResourceKind, entities: &[EntityRef])
        -> Result<u64, DbError>;
}

/// Applications (desired state) and their deployments.
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    async fn get_application(&self, id: &AppId) -> Result<Option<Application>, DbError>;

    async fn assign_node(&self, id: &AppId, node_id: Option<&NodeId>) -> Result<bool, DbError>;

    async fn set_applied_limits(&self, id: &AppId, limits: &EffectiveLimits)
        -> Result<(), DbError>;

    /// Inserts the row and sets the application to `deploying` atomically.
    async fn insert_deployment(&self, deployment: &Deployment) -> Result<(), DbError>;

    async fn get_deployment(&self, id: &DeploymentId) -> Result<Option<Deployment>, DbError>;

    /// Applies `update` only if the current status is one of `allowed_from`.
    ///
    /// Returns the updated row, or `None` when the guard did not match (or
    /// the row does not exist). The application status in the update is
    /// written in the same step.
    async fn update_deployment(
        &self,
        id: &DeploymentId,
        allowed_from: &[DeploymentStatus],
        update: &DeploymentUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<Deployment>, DbError>;
}

/// Node registry.
#[async_trait]
pub trait NodeStore: Send + Sync {
    async fn insert_node(&self, node: &Node) -> Result<(), DbError>;
    async fn get_node(&self, id: &NodeId) -> Result<Option<Node>, DbError>;
    async fn delete_node(&self, id: &NodeId) -> Result<bool, DbError>;
    async fn set_port_ranges(&self, id: &NodeId, ranges: &PortRanges) -> Result<bool, DbError>;
    async fn set_port_cursor(&self, id: &NodeId, cursor: u16) -> Result<(), DbError>;

    /// Records a poll from the node.
    async fn touch_node(&self, id: &NodeId, now: DateTime<Utc>) -> Result<bool, DbError>;
}

/// Port allocation rows, unique per `(node_id, port)`.
#[async_trait]
pub trait PortStore: Send + Sync {
    /// Inserts the row; `false` means `(node_id, port)` is already taken.
    async fn try_insert_port(&self, allocation: &PortAllocation) -> Result<bool, DbError>;

    async fn delete_port(&self, node_id: &NodeId, port: u16) -> Result<bool, DbError>;

    /// Drops expired reservation rows on one node.
    async fn purge_expired(&self, node_id: &NodeId, now: DateTime<Utc>) -> Result<u64, DbError>;

    /// Converts reservation rows on one node into application rows, clearing
    /// their expiry, in one step.
    async fn attach_reservation(
        &self,
        reservation: &Uuid,
        node_id: &NodeId,
        application: &AppId,
    ) -> Result<u64, DbError>;

    async fn release_application(&self, application: &AppId) -> Result<u64, DbError>;
    async fn release_reservation(&self, reservation: &Uuid) -> Result<u64, DbError>;

    async fn ports_for_application(&self, application: &AppId)
        -> Result<Vec<PortAllocation>, DbError>;
    async fn ports_for_reservation(&self, reservation: &Uuid)
        -> Result<Vec<PortAllocation>, DbError>;

    /// Drops expired reservations and rows whose application or node is gone.
    async fn purge_orphans(&self, now: DateTime<Utc>) -> Result<u64, DbError>;
}

/// Durable node task queue.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert_task(&self, task: &DeploymentTask) -> Result<(), DbError>;

    /// Marks `pending` rows, and `sent` rows last sent before `stale_before`,
    /// as `sent` at `now` and returns them oldest first.
    async fn claim_tasks(
        &self,
        node_id: &NodeId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<DeploymentTask>, DbError>;

    /// Moves a `pending`/`sent` task to `acknowledged`. `task_id` matches the
    /// row ID or the payload's `task_id`. Returns `false` if no such task.
    async fn acknowledge_task(
        &self,
        node_id: &NodeId,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DbError>;

    /// Moves every unsettled task of a deployment to `status`.
    async fn settle_tasks(
        &self,
        deployment_id: &DeploymentId,
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<u64, DbError>;

    async fn tasks_for_deployment(&self, deployment_id: &DeploymentId)
        -> Result<Vec<DeploymentTask>, DbError>;
}

/// Everything the engine needs from one backing store.
pub trait Store: HierarchyStore + DeploymentStore + NodeStore + PortStore + TaskStore {}

impl<T> Store for T where T: HierarchyStore + DeploymentStore + NodeStore + PortStore + TaskStore {}
