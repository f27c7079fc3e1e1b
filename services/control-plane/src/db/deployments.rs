//! Applications and deployments.

use async_trait::async_trait;
use berth_events::{ApplicationStatus, DeploymentStatus};
use berth_id::{AppId, DeploymentId, NodeId};
use berth_quota::EffectiveLimits;
use chrono::{DateTime, Utc};

use super::rows::{ApplicationRow, DeploymentRow, LIMIT_COLUMNS};
use super::{DbError, PgStore};
use crate::model::{Application, Deployment, DeploymentUpdate};
use crate::store::DeploymentStore;

const DEPLOYMENT_COLUMNS: &str = "id, application_id, node_id, status, commit_sha, branch, logs, \
     rollback_to_deployment_id, container_id, error, created_at, updated_at, finished_at";

async fn set_application_status(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    id: &AppId,
    status: ApplicationStatus,
) -> Result<(), DbError> {
    sqlx::query("UPDATE applications SET status = $2 WHERE id = $1")
        .bind(id.to_string())
        .bind(status.as_str())
        .execute(&mut **tx)
        .await
        .map_err(DbError::Query)?;
    Ok(())
}

#[async_trait]
impl DeploymentStore for PgStore {
    async fn get_application(&self, id: &AppId) -> Result<Option<Application>, DbError> {
        let sql = format!(
            "SELECT id, environment_id, name, source, build, env_vars, cpus, memory, node_id, \
             status, applied_limits, {LIMIT_COLUMNS} FROM applications WHERE id = $1"
        );
        let row: Option<ApplicationRow> = sqlx::query_as(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::Query)?;
        row.map(Application::try_from).transpose()
    }

    async fn assign_node(&self, id: &AppId, node_id: Option<&NodeId>) -> Result<bool, DbError> {
        let result = sqlx::query("UPDATE applications SET node_id = $2 WHERE id = $1")
            .bind(id.to_string())
            .bind(node_id.map(ToString::to_string))
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_applied_limits(
        &self,
        id: &AppId,
        limits: &EffectiveLimits,
    ) -> Result<(), DbError> {
        sqlx::query("UPDATE applications SET applied_limits = $2 WHERE id = $1")
            .bind(id.to_string())
            .bind(serde_json::to_value(limits)?)
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(())
    }

    async fn insert_deployment(&self, deployment: &Deployment) -> Result<(), DbError> {
        let mut tx = self.pool.begin().await.map_err(DbError::Query)?;

        sqlx::query(
            r#"
            INSERT INTO deployments (
                id, application_id, node_id, status, commit_sha, branch, logs,
                rollback_to_deployment_id, container_id, error, created_at, updated_at, finished_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(deployment.id.to_string())
        .bind(deployment.application_id.to_string())
        .bind(deployment.node_id.to_string())
        .bind(deployment.status.as_str())
        .bind(&deployment.commit_sha)
        .bind(&deployment.branch)
        .bind(serde_json::to_value(&deployment.logs)?)
        .bind(deployment.rollback_to_deployment_id.map(|id| id.to_string()))
        .bind(&deployment.container_id)
        .bind(&deployment.error)
        .bind(deployment.created_at)
        .bind(deployment.updated_at)
        .bind(deployment.finished_at)
        .execute(&mut *tx)
        .await
        .map_err(DbError::Query)?;

        set_application_status(&mut tx, &deployment.application_id, ApplicationStatus::Deploying)
            .await?;

        tx.commit().await.map_err(DbError::Query)?;
        Ok(())
    }

    async fn get_deployment(&self, id: &DeploymentId) -> Result<Option<Deployment>, DbError> {
        let sql = format!("SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE id = $1");
        let row: Option<DeploymentRow> = sqlx::query_as(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::Query)?;
        row.map(Deployment::try_from).transpose()
    }

    async fn update_deployment(
        &self,
        id: &DeploymentId,
        allowed_from: &[DeploymentStatus],
        update: &DeploymentUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<Deployment>, DbError> {
        let mut tx = self.pool.begin().await.map_err(DbError::Query)?;

        let sql = format!("SELECT {DEPLOYMENT_COLUMNS} FROM deployments WHERE id = $1 FOR UPDATE");
        let row: Option<DeploymentRow> = sqlx::query_as(&sql)
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(DbError::Query)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut deployment = Deployment::try_from(row)?;
        if !allowed_from.contains(&deployment.status) {
            return Ok(None);
        }

        update.apply(&mut deployment, now);
        sqlx::query(
            r#"
            UPDATE deployments
            SET status = $2, logs = $3, container_id = $4, error = $5,
                updated_at = $6, finished_at = $7
            WHERE id = $1
            "#,
        )
        .bind(deployment.id.to_string())
        .bind(deployment.status.as_str())
        .bind(serde_json::to_value(&deployment.logs)?)
        .bind(&deployment.container_id)
        .bind(&deployment.error)
        .bind(deployment.updated_at)
        .bind(deployment.finished_at)
        .execute(&mut *tx)
        .await
        .map_err(DbError::Query)?;

        if let Some(status) = update.application_status {
            set_application_status(&mut tx, &deployment.application_id, status).await?;
        }

        tx.commit().await.map_err(DbError::Query)?;
        Ok(Some(deployment))
    }
}
