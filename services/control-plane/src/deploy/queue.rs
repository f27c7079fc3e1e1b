//! Durable node task queue with best-effort push.
//!
//! Rows are never deleted. A node's poll claims `pending` rows and `sent`
//! rows whose last delivery is older than the staleness window, so a task is
//! redelivered until the node acknowledges it. Nodes must treat every task
//! as possibly duplicate and de-duplicate on the envelope ID.

use std::sync::Arc;
use std::time::Duration;

use berth_events::{NodeMessage, StoredTask, TaskEnvelope, TaskStatus};
use berth_id::{DeploymentId, NodeId, TaskId};
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use super::{DeployError, NodePush};
use crate::model::DeploymentTask;
use crate::store::TaskStore;

/// Redelivery window for `sent` tasks when none is configured.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct TaskQueue {
    tasks: Arc<dyn TaskStore>,
    push: Arc<dyn NodePush>,
    stale_after: chrono::Duration,
}

impl TaskQueue {
    pub fn new(tasks: Arc<dyn TaskStore>, push: Arc<dyn NodePush>, stale_after: Duration) -> Self {
        let stale_after =
            chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::seconds(10));
        Self {
            tasks,
            push,
            stale_after,
        }
    }

    /// Persists a `pending` task, then pushes it if the node is connected.
    ///
    /// The row is the delivery guarantee. A failed push is logged and
    /// otherwise ignored.
    #[instrument(skip(self, task), fields(node_id = %node_id, deployment_id = %deployment_id, task_type = %task.task_type))]
    pub async fn enqueue(
        &self,
        node_id: &NodeId,
        deployment_id: &DeploymentId,
        task: StoredTask,
    ) -> Result<TaskEnvelope, DeployError> {
        let now = Utc::now();
        let data = task.to_value()?;
        let row = DeploymentTask {
            id: TaskId::new(),
            node_id: *node_id,
            deployment_id: *deployment_id,
            task_type: task.task_type,
            data: data.clone(),
            status: TaskStatus::Pending,
            sent_at: None,
            created_at: now,
            updated_at: now,
        };
        self.tasks.insert_task(&row).await?;

        let envelope = TaskEnvelope::from_stored(&row.id, data)?;
        info!(task_id = %envelope.id, "Task queued");

        let message = NodeMessage::Task {
            task: envelope.clone(),
        };
        match self.push.send_to_node(node_id, &message).await {
            Ok(()) => debug!(task_id = %envelope.id, "Task pushed to node"),
            Err(e) => warn!(task_id = %envelope.id, error = %e, "Push failed, node will poll"),
        }
        Ok(envelope)
    }

    /// Pushes a message with no durable counterpart. Failures are swallowed.
    pub async fn notify(&self, node_id: &NodeId, message: &NodeMessage) {
        if let Err(e) = self.push.send_to_node(node_id, message).await {
            warn!(node_id = %node_id, error = %e, "Push failed");
        }
    }

    pub async fn fetch_pending(&self, node_id: &NodeId) -> Result<Vec<TaskEnvelope>, DeployError> {
        self.fetch_pending_at(node_id, Utc::now()).await
    }

    /// Claims deliverable tasks for a node and returns their envelopes,
    /// oldest first.
    ///
    /// A row whose stored data is not a valid envelope is skipped with a
    /// warning so one corrupt row cannot block the node's queue.
    #[instrument(skip(self), fields(node_id = %node_id))]
    pub async fn fetch_pending_at(
        &self,
        node_id: &NodeId,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskEnvelope>, DeployError> {
        let stale_before = now - self.stale_after;
        let rows = self.tasks.claim_tasks(node_id, now, stale_before).await?;

        let mut envelopes = Vec::with_capacity(rows.len());
        for row in rows {
            match TaskEnvelope::from_stored(&row.id, row.data) {
                Ok(envelope) => envelopes.push(envelope),
                Err(e) => warn!(task_id = %row.id, error = %e, "Skipping malformed task"),
            }
        }
        if !envelopes.is_empty() {
            debug!(count = envelopes.len(), "Tasks claimed");
        }
        Ok(envelopes)
    }

    /// Marks a task `acknowledged`. Acknowledging twice is harmless.
    #[instrument(skip(self), fields(node_id = %node_id))]
    pub async fn acknowledge(&self, node_id: &NodeId, task_id: &str) -> Result<(), DeployError> {
        let found = self
            .tasks
            .acknowledge_task(node_id, task_id, Utc::now())
            .await?;
        if !found {
            return Err(DeployError::TaskNotFound(task_id.to_string()));
        }
        debug!(task_id, "Task acknowledged");
        Ok(())
    }

    /// Moves every unsettled task of a deployment to `status`.
    pub async fn settle(
        &self,
        deployment_id: &DeploymentId,
        status: TaskStatus,
    ) -> Result<u64, DeployError> {
        Ok(self
            .tasks
            .settle_tasks(deployment_id, status, Utc::now())
            .await?)
    }

    pub async fn tasks_for_deployment(
        &self,
        deployment_id: &DeploymentId,
    ) -> Result<Vec<DeploymentTask>, DeployError> {
        Ok(self.tasks.tasks_for_deployment(deployment_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use berth_events::{CancelTaskPayload, TaskType};
    use berth_id::AppId;
    use serde_json::json;

    use super::*;
    use crate::deploy::PushError;
    use crate::store::MemoryStore;

    struct Offline;

    #[async_trait]
    impl NodePush for Offline {
        async fn send_to_node(&self, node_id: &NodeId, _message: &NodeMessage) -> Result<(), PushError> {
            Err(PushError::NotConnected(*node_id))
        }
    }

    fn queue(store: Arc<MemoryStore>, stale_after: Duration) -> TaskQueue {
        TaskQueue::new(store, Arc::new(Offline), stale_after)
    }

    fn cancel_task(deployment_id: DeploymentId) -> StoredTask {
        StoredTask::cancel(&CancelTaskPayload {
            task_id: None,
            deployment_id,
            application_id: AppId::new(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_survives_failed_push() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue(store, DEFAULT_STALE_AFTER);
        let node = NodeId::new();
        let deployment = DeploymentId::new();

        let envelope = queue.enqueue(&node, &deployment, cancel_task(deployment)).await.unwrap();
        assert_eq!(envelope.task_type, TaskType::CancelDeployment);
        assert_eq!(envelope.payload[berth_events::TASK_ID_FIELD], json!(envelope.id));

        let rows = queue.tasks_for_deployment(&deployment).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_staleness_window_is_configurable() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue(store, Duration::from_secs(60));
        let node = NodeId::new();
        let deployment = DeploymentId::new();
        queue.enqueue(&node, &deployment, cancel_task(deployment)).await.unwrap();

        let t0 = Utc::now();
        assert_eq!(queue.fetch_pending_at(&node, t0).await.unwrap().len(), 1);
        let after = |secs| t0 + chrono::Duration::seconds(secs);
        assert!(queue.fetch_pending_at(&node, after(30)).await.unwrap().is_empty());
        assert_eq!(queue.fetch_pending_at(&node, after(61)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_settled_tasks_are_never_redelivered() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue(store, DEFAULT_STALE_AFTER);
        let node = NodeId::new();
        let deployment = DeploymentId::new();
        queue.enqueue(&node, &deployment, cancel_task(deployment)).await.unwrap();

        assert_eq!(queue.settle(&deployment, TaskStatus::Completed).await.unwrap(), 1);
        assert_eq!(queue.settle(&deployment, TaskStatus::Failed).await.unwrap(), 0);
        let later = Utc::now() + chrono::Duration::hours(1);
        assert!(queue.fetch_pending_at(&node, later).await.unwrap().is_empty());
    }
}
