//! Tenant tree tables.

use async_trait::async_trait;
use berth_id::{AppId, UserId};
use berth_quota::{ConfiguredLimits, EffectiveLimits, ResourceKind};
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::Postgres;

use super::rows::{LimitRow, UserRow, LIMIT_COLUMNS};
use super::{DbError, PgStore};
use crate::hierarchy::{EntityRef, Level};
use crate::model::{Application, Environment, Project, Team, User};
use crate::store::{HierarchyStore, LimitNode};

/// Column referencing the parent level.
fn parent_column(level: Level) -> Option<&'static str> {
    match level {
        Level::User => None,
        Level::Team => Some("owner_id"),
        Level::Project => Some("team_id"),
        Level::Environment => Some("project_id"),
        Level::Application => Some("environment_id"),
    }
}

fn bind_limits<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    raw: [i64; 6],
) -> Query<'q, Postgres, PgArguments> {
    for value in raw {
        query = query.bind(value);
    }
    query
}

impl PgStore {
    async fn insert_limited(
        &self,
        level: Level,
        id: String,
        parent: String,
        name: &str,
        limits: &ConfiguredLimits,
    ) -> Result<(), DbError> {
        let Some(parent_column) = parent_column(level) else {
            return Ok(());
        };
        let sql = format!(
            "INSERT INTO {table} (id, {parent_column}, name, {LIMIT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            table = level.table(),
        );
        let query = sqlx::query(&sql).bind(id).bind(parent).bind(name);
        bind_limits(query, limits.to_raw())
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(())
    }
}

#[async_trait]
impl HierarchyStore for PgStore {
    async fn insert_user(&self, user: &User) -> Result<(), DbError> {
        let sql = format!("INSERT INTO users (id, name, {LIMIT_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)");
        let query = sqlx::query(&sql).bind(user.id.to_string()).bind(&user.name);
        bind_limits(query, user.ceilings.to_raw())
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(())
    }

    async fn insert_team(&self, team: &Team) -> Result<(), DbError> {
        self.insert_limited(
            Level::Team,
            team.id.to_string(),
            team.owner_id.to_string(),
            &team.name,
            &team.limits,
        )
        .await
    }

    async fn insert_project(&self, project: &Project) -> Result<(), DbError> {
        self.insert_limited(
            Level::Project,
            project.id.to_string(),
            project.team_id.to_string(),
            &project.name,
            &project.limits,
        )
        .await
    }

    async fn insert_environment(&self, environment: &Environment) -> Result<(), DbError> {
        self.insert_limited(
            Level::Environment,
            environment.id.to_string(),
            environment.project_id.to_string(),
            &environment.name,
            &environment.limits,
        )
        .await
    }

    async fn insert_application(&self, application: &Application) -> Result<(), DbError> {
        let sql = format!(
            "INSERT INTO applications (id, environment_id, name, source, build, env_vars, \
             cpus, memory, node_id, status, applied_limits, {LIMIT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)"
        );
        let applied = application
            .applied_limits
            .map(serde_json::to_value)
            .transpose()?;
        let query = sqlx::query(&sql)
            .bind(application.id.to_string())
            .bind(application.environment_id.to_string())
            .bind(&application.name)
            .bind(serde_json::to_value(&application.source)?)
            .bind(serde_json::to_value(&application.build)?)
            .bind(serde_json::to_value(&application.env_vars)?)
            .bind(&application.cpus)
            .bind(&application.memory)
            .bind(application.node_id.map(|id| id.to_string()))
            .bind(application.status.as_str())
            .bind(applied);
        bind_limits(query, application.limits.to_raw())
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(())
    }

    async fn delete_application(&self, id: &AppId) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM applications WHERE id = $1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(result.rows_affected() > 0)
    }

    async fn user_ceilings(&self, id: &UserId) -> Result<Option<EffectiveLimits>, DbError> {
        let sql = format!("SELECT id, name, {LIMIT_COLUMNS} FROM users WHERE id = $1");
        let row: Option<UserRow> = sqlx::query_as(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::Query)?;
        row.map(|row| User::try_from(row).map(|user| user.ceilings))
            .transpose()
    }

    async fn limit_node(&self, entity: &EntityRef) -> Result<Option<LimitNode>, DbError> {
        let level = entity.level();
        let Some(parent_column) = parent_column(level) else {
            return Ok(None);
        };
        let sql = format!(
            "SELECT id, {parent_column} AS parent_id, {LIMIT_COLUMNS} FROM {table} WHERE id = $1",
            table = level.table(),
        );
        let row: Option<LimitRow> = sqlx::query_as(&sql)
            .bind(entity.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::Query)?;
        row.map(|row| row.into_node(level.table())).transpose()
    }

    async fn children(&self, parent: &EntityRef) -> Result<Vec<LimitNode>, DbError> {
        let Some(level) = parent.level().child() else {
            return Ok(Vec::new());
        };
        let Some(parent_column) = parent_column(level) else {
            return Ok(Vec::new());
        };
        let sql = format!(
            "SELECT id, {parent_column} AS parent_id, {LIMIT_COLUMNS} FROM {table} \
             WHERE {parent_column} = $1 ORDER BY id",
            table = level.table(),
        );
        let rows: Vec<LimitRow> = sqlx::query_as(&sql)
            .bind(parent.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::Query)?;
        rows.into_iter()
            .map(|row| row.into_node(level.table()))
            .collect()
    }

    async fn set_user_ceilings(
        &self,
        id: &UserId,
        ceilings: &EffectiveLimits,
    ) -> Result<bool, DbError> {
        let assignments = assignments();
        let sql = format!("UPDATE users SET {assignments} WHERE id = $1");
        let query = sqlx::query(&sql).bind(id.to_string());
        let result = bind_limits(query, ceilings.to_raw())
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_limits(
        &self,
        entity: &EntityRef,
        limits: &ConfiguredLimits,
    ) -> Result<bool, DbError> {
        if entity.as_user().is_some() {
            return Ok(false);
        }
        let assignments = assignments();
        let sql = format!(
            "UPDATE {table} SET {assignments} WHERE id = $1",
            table = entity.level().table(),
        );
        let query = sqlx::query(&sql).bind(entity.to_string());
        let result = bind_limits(query, limits.to_raw())
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(result.rows_affected() > 0)
    }

    async fn reset_to_auto(
        &self,
        kind: ResourceKind,
        entities: &[EntityRef],
    ) -> Result<u64, DbError> {
        let Some(first) = entities.first() else {
            return Ok(0);
        };
        if first.as_user().is_some() {
            return Ok(0);
        }
        let column = kind.column();
        let sql = format!(
            "UPDATE {table} SET {column} = -1 WHERE id = ANY($1) AND {column} <> -1",
            table = first.level().table(),
        );
        let ids: Vec<String> = entities.iter().map(ToString::to_string).collect();
        let result = sqlx::query(&sql)
            .bind(ids)
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(result.rows_affected())
    }
}

/// `col = $2, ...` for the six limit columns, after `$1 = id`.
fn assignments() -> String {
    ResourceKind::ALL
        .iter()
        .enumerate()
        .map(|(i, kind)| format!("{} = ${}", kind.column(), i + 2))
        .collect::<Vec<_>>()
        .join(", ")
}
