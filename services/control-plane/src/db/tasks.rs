//! Durable node task queue.

use async_trait::async_trait;
use berth_events::TaskStatus;
use berth_id::{DeploymentId, NodeId};
use chrono::{DateTime, Utc};

use super::rows::TaskRow;
use super::{DbError, PgStore};
use crate::model::DeploymentTask;
use crate::store::TaskStore;

const TASK_COLUMNS: &str =
    "id, node_id, deployment_id, task_type, task_data, status, sent_at, created_at, updated_at";

fn into_tasks(rows: Vec<TaskRow>) -> Result<Vec<DeploymentTask>, DbError> {
    let mut tasks = rows
        .into_iter()
        .map(DeploymentTask::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    tasks.sort_by_key(|t| (t.created_at, t.id));
    Ok(tasks)
}

#[async_trait]
impl TaskStore for PgStore {
    async fn insert_task(&self, task: &DeploymentTask) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO deployment_tasks (
                id, node_id, deployment_id, task_type, task_data, status, sent_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(task.id.to_string())
        .bind(task.node_id.to_string())
        .bind(task.deployment_id.to_string())
        .bind(task.task_type.as_str())
        .bind(&task.data)
        .bind(task.status.as_str())
        .bind(task.sent_at)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;
        Ok(())
    }

    async fn claim_tasks(
        &self,
        node_id: &NodeId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<DeploymentTask>, DbError> {
        // SKIP LOCKED keeps two concurrent polls from claiming the same row.
        let sql = format!(
            r#"
            UPDATE deployment_tasks
            SET status = 'sent', sent_at = $2, updated_at = $2
            WHERE id IN (
                SELECT id FROM deployment_tasks
                WHERE node_id = $1
                  AND (status = 'pending'
                       OR (status = 'sent' AND (sent_at IS NULL OR sent_at < $3)))
                ORDER BY created_at, id
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {TASK_COLUMNS}
            "#
        );
        let rows: Vec<TaskRow> = sqlx::query_as(&sql)
            .bind(node_id.to_string())
            .bind(now)
            .bind(stale_before)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::Query)?;
        into_tasks(rows)
    }

    async fn acknowledge_task(
        &self,
        node_id: &NodeId,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let result = sqlx::query(
            r#"
            UPDATE deployment_tasks
            SET status = CASE WHEN status IN ('pending', 'sent') THEN 'acknowledged' ELSE status END,
                updated_at = CASE WHEN status IN ('pending', 'sent') THEN $3 ELSE updated_at END
            WHERE node_id = $1
              AND (id = $2 OR task_data -> 'payload' ->> 'task_id' = $2)
            "#,
        )
        .bind(node_id.to_string())
        .bind(task_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;
        Ok(result.rows_affected() > 0)
    }

    async fn settle_tasks(
        &self,
        deployment_id: &DeploymentId,
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<u64, DbError> {
        let result = sqlx::query(
            r#"
            UPDATE deployment_tasks
            SET status = $2, updated_at = $3
            WHERE deployment_id = $1 AND status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(deployment_id.to_string())
        .bind(status.as_str())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;
        Ok(result.rows_affected())
    }

    async fn tasks_for_deployment(
        &self,
        deployment_id: &DeploymentId,
    ) -> Result<Vec<DeploymentTask>, DbError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM deployment_tasks WHERE deployment_id = $1");
        let rows: Vec<TaskRow> = sqlx::query_as(&sql)
            .bind(deployment_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::Query)?;
        into_tasks(rows)
    }
}
