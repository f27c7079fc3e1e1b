//! Raw rows and their conversion into domain records.
//!
//! Rows decode column types only. Anything the domain can reject (IDs,
//! statuses, limit sentinels, JSON documents) is checked in the conversion,
//! which reports [`DbError::Corrupt`] naming the table.

use std::fmt::Display;
use std::str::FromStr;

use berth_events::{ApplicationStatus, DeploymentStatus, TaskStatus, TaskType};
use berth_networking::{PortRange, PortRanges};
use berth_quota::{ConfiguredLimits, EffectiveLimits, ResourceKind};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use super::DbError;
use crate::hierarchy::EntityRef;
use crate::model::{Application, Deployment, DeploymentTask, Node, PortAllocation, PortOwner, User};
use crate::store::LimitNode;

/// The six limit columns in [`ResourceKind::ALL`] order.
pub(super) const LIMIT_COLUMNS: &str =
    "cpu_millicores_limit, ram_mb_limit, storage_mb_limit, ports_limit, bandwidth_mbps_limit, pids_limit";

pub(super) fn parse<T>(table: &'static str, value: &str) -> Result<T, DbError>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .parse()
        .map_err(|e| DbError::corrupt(table, format!("{value:?}: {e}")))
}

fn raw_limits(row: &PgRow) -> Result<[i64; 6], sqlx::Error> {
    let mut raw = [0i64; 6];
    for (slot, kind) in raw.iter_mut().zip(ResourceKind::ALL) {
        *slot = row.try_get(kind.column())?;
    }
    Ok(raw)
}

fn port(table: &'static str, value: i32) -> Result<u16, DbError> {
    u16::try_from(value).map_err(|_| DbError::corrupt(table, format!("port {value} out of range")))
}

// =============================================================================
// Tenant tree
// =============================================================================

pub(super) struct UserRow {
    id: String,
    name: String,
    ceilings: [i64; 6],
}

impl<'r> sqlx::FromRow<'r, PgRow> for UserRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            ceilings: raw_limits(row)?,
        })
    }
}

impl TryFrom<UserRow> for User {
    type Error = DbError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse("users", &row.id)?,
            name: row.name,
            ceilings: EffectiveLimits::from_raw(row.ceilings)
                .map_err(|e| DbError::corrupt("users", e))?,
        })
    }
}

/// Any non-user level; queries alias the parent column to `parent_id`.
pub(super) struct LimitRow {
    id: String,
    parent_id: String,
    limits: [i64; 6],
}

impl<'r> sqlx::FromRow<'r, PgRow> for LimitRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            parent_id: row.try_get("parent_id")?,
            limits: raw_limits(row)?,
        })
    }
}

impl LimitRow {
    pub(super) fn into_node(self, table: &'static str) -> Result<LimitNode, DbError> {
        Ok(LimitNode {
            entity: parse::<EntityRef>(table, &self.id)?,
            parent: parse::<EntityRef>(table, &self.parent_id)?,
            limits: ConfiguredLimits::from_raw(self.limits)
                .map_err(|e| DbError::corrupt(table, e))?,
        })
    }
}

pub(super) struct ApplicationRow {
    id: String,
    environment_id: String,
    name: String,
    source: Value,
    build: Value,
    env_vars: Value,
    limits: [i64; 6],
    cpus: Option<String>,
    memory: Option<String>,
    node_id: Option<String>,
    status: String,
    applied_limits: Option<Value>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for ApplicationRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            environment_id: row.try_get("environment_id")?,
            name: row.try_get("name")?,
            source: row.try_get("source")?,
            build: row.try_get("build")?,
            env_vars: row.try_get("env_vars")?,
            limits: raw_limits(row)?,
            cpus: row.try_get("cpus")?,
            memory: row.try_get("memory")?,
            node_id: row.try_get("node_id")?,
            status: row.try_get("status")?,
            applied_limits: row.try_get("applied_limits")?,
        })
    }
}

impl TryFrom<ApplicationRow> for Application {
    type Error = DbError;

    fn try_from(row: ApplicationRow) -> Result<Self, Self::Error> {
        const TABLE: &str = "applications";
        Ok(Self {
            id: parse(TABLE, &row.id)?,
            environment_id: parse(TABLE, &row.environment_id)?,
            name: row.name,
            source: serde_json::from_value(row.source)?,
            build: serde_json::from_value(row.build)?,
            env_vars: serde_json::from_value(row.env_vars)?,
            limits: ConfiguredLimits::from_raw(row.limits).map_err(|e| DbError::corrupt(TABLE, e))?,
            cpus: row.cpus,
            memory: row.memory,
            node_id: row.node_id.as_deref().map(|id| parse(TABLE, id)).transpose()?,
            status: parse::<ApplicationStatus>(TABLE, &row.status)?,
            applied_limits: row.applied_limits.map(serde_json::from_value).transpose()?,
        })
    }
}

// =============================================================================
// Nodes and ports
// =============================================================================

pub(super) struct NodeRow {
    id: String,
    name: String,
    port_cursor: Option<i32>,
    last_seen_at: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for NodeRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            port_cursor: row.try_get("port_cursor")?,
            last_seen_at: row.try_get("last_seen_at")?,
        })
    }
}

pub(super) struct PortRangeRow {
    start_port: i32,
    end_port: i32,
}

impl<'r> sqlx::FromRow<'r, PgRow> for PortRangeRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            start_port: row.try_get("start_port")?,
            end_port: row.try_get("end_port")?,
        })
    }
}

impl NodeRow {
    pub(super) fn into_node(self, ranges: Vec<PortRangeRow>) -> Result<Node, DbError> {
        const TABLE: &str = "nodes";
        let ranges = ranges
            .into_iter()
            .map(|r| {
                PortRange::new(port(TABLE, r.start_port)?, port(TABLE, r.end_port)?)
                    .map_err(|e| DbError::corrupt(TABLE, e))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Node {
            id: parse(TABLE, &self.id)?,
            name: self.name,
            port_ranges: PortRanges::new(ranges).map_err(|e| DbError::corrupt(TABLE, e))?,
            port_cursor: self.port_cursor.map(|c| port(TABLE, c)).transpose()?,
            last_seen_at: self.last_seen_at,
        })
    }
}

pub(super) struct PortRow {
    node_id: String,
    port: i32,
    application_id: Option<String>,
    reservation_uuid: Option<Uuid>,
    expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for PortRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            node_id: row.try_get("node_id")?,
            port: row.try_get("port")?,
            application_id: row.try_get("application_id")?,
            reservation_uuid: row.try_get("reservation_uuid")?,
            expires_at: row.try_get("expires_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<PortRow> for PortAllocation {
    type Error = DbError;

    fn try_from(row: PortRow) -> Result<Self, Self::Error> {
        const TABLE: &str = "port_allocations";
        let owner = match (row.application_id, row.reservation_uuid) {
            (Some(app), None) => PortOwner::Application(parse(TABLE, &app)?),
            (None, Some(reservation)) => PortOwner::Reservation(reservation),
            _ => return Err(DbError::corrupt(TABLE, "row must have exactly one owner")),
        };
        Ok(Self {
            node_id: parse(TABLE, &row.node_id)?,
            port: port(TABLE, row.port)?,
            owner,
            expires_at: row.expires_at,
            created_at: row.created_at,
        })
    }
}

// =============================================================================
// Deployments and tasks
// =============================================================================

pub(super) struct DeploymentRow {
    id: String,
    application_id: String,
    node_id: String,
    status: String,
    commit_sha: Option<String>,
    branch: Option<String>,
    logs: Value,
    rollback_to_deployment_id: Option<String>,
    container_id: Option<String>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for DeploymentRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            application_id: row.try_get("application_id")?,
            node_id: row.try_get("node_id")?,
            status: row.try_get("status")?,
            commit_sha: row.try_get("commit_sha")?,
            branch: row.try_get("branch")?,
            logs: row.try_get("logs")?,
            rollback_to_deployment_id: row.try_get("rollback_to_deployment_id")?,
            container_id: row.try_get("container_id")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }
}

impl TryFrom<DeploymentRow> for Deployment {
    type Error = DbError;

    fn try_from(row: DeploymentRow) -> Result<Self, Self::Error> {
        const TABLE: &str = "deployments";
        Ok(Self {
            id: parse(TABLE, &row.id)?,
            application_id: parse(TABLE, &row.application_id)?,
            node_id: parse(TABLE, &row.node_id)?,
            status: parse::<DeploymentStatus>(TABLE, &row.status)?,
            commit_sha: row.commit_sha,
            branch: row.branch,
            logs: serde_json::from_value(row.logs)?,
            rollback_to_deployment_id: row
                .rollback_to_deployment_id
                .as_deref()
                .map(|id| parse(TABLE, id))
                .transpose()?,
            container_id: row.container_id,
            error: row.error,
            created_at: row.created_at,
            updated_at: row.updated_at,
            finished_at: row.finished_at,
        })
    }
}

pub(super) struct TaskRow {
    id: String,
    node_id: String,
    deployment_id: String,
    task_type: String,
    task_data: Value,
    status: String,
    sent_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for TaskRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            node_id: row.try_get("node_id")?,
            deployment_id: row.try_get("deployment_id")?,
            task_type: row.try_get("task_type")?,
            task_data: row.try_get("task_data")?,
            status: row.try_get("status")?,
            sent_at: row.try_get("sent_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<TaskRow> for DeploymentTask {
    type Error = DbError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        const TABLE: &str = "deployment_tasks";
        Ok(Self {
            id: parse(TABLE, &row.id)?,
            node_id: parse(TABLE, &row.node_id)?,
            deployment_id: parse(TABLE, &row.deployment_id)?,
            task_type: parse::<TaskType>(TABLE, &row.task_type)?,
            data: row.task_data,
            status: parse::<TaskStatus>(TABLE, &row.status)?,
            sent_at: row.sent_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reports_table_on_bad_value() {
        let status: DeploymentStatus = parse("deployments", "running").unwrap();
        assert_eq!(status, DeploymentStatus::Running);

        let err = parse::<DeploymentStatus>("deployments", "exploded").unwrap_err();
        assert!(matches!(err, DbError::Corrupt { table: "deployments", .. }));
        assert!(err.to_string().contains("exploded"));
    }

    #[test]
    fn test_port_rejects_out_of_range() {
        assert_eq!(port("port_allocations", 8080).unwrap(), 8080);
        assert!(port("port_allocations", 70_000).is_err());
        assert!(port("port_allocations", -1).is_err());
    }

    #[test]
    fn test_limit_columns_follow_kind_order() {
        let columns: Vec<&str> = LIMIT_COLUMNS.split(", ").collect();
        let expected: Vec<&str> = ResourceKind::ALL.iter().map(|k| k.column()).collect();
        assert_eq!(columns, expected);
    }
}
