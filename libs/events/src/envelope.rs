//! Task envelope and payloads exchanged with node agents.

use std::collections::BTreeMap;

use berth_id::{AppId, DeploymentId, TaskId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{DeploymentStatus, EventError, TaskType};

/// Key inside every payload that identifies the task for acknowledgement.
pub const TASK_ID_FIELD: &str = "task_id";

/// What is persisted in a task row's `task_data` column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTask {
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub payload: Value,
}

impl StoredTask {
    pub fn deploy(payload: &DeployTaskPayload) -> Result<Self, EventError> {
        Ok(Self {
            task_type: TaskType::Deploy,
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn cancel(payload: &CancelTaskPayload) -> Result<Self, EventError> {
        Ok(Self {
            task_type: TaskType::CancelDeployment,
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn to_value(&self) -> Result<Value, EventError> {
        Ok(serde_json::to_value(self)?)
    }
}

/// A task as handed to a node: `{type, id, payload}`.
///
/// `id` always equals `payload.task_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub id: String,
    pub payload: Value,
}

impl TaskEnvelope {
    /// Builds the envelope for a stored row, backfilling `task_id` from the
    /// row's primary key when the stored payload has none.
    pub fn from_stored(row_id: &TaskId, data: Value) -> Result<Self, EventError> {
        let mut stored: StoredTask = serde_json::from_value(data)
            .map_err(|e| EventError::InvalidEnvelope(e.to_string()))?;
        let id = backfill_task_id(&mut stored.payload, row_id)?;
        Ok(Self {
            task_type: stored.task_type,
            id,
            payload: stored.payload,
        })
    }

    pub fn deploy_payload(&self) -> Result<DeployTaskPayload, EventError> {
        self.expect_type(TaskType::Deploy)?;
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn cancel_payload(&self) -> Result<CancelTaskPayload, EventError> {
        self.expect_type(TaskType::CancelDeployment)?;
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    fn expect_type(&self, expected: TaskType) -> Result<(), EventError> {
        if self.task_type != expected {
            return Err(EventError::InvalidEnvelope(format!(
                "expected a {expected} task, got {}",
                self.task_type
            )));
        }
        Ok(())
    }
}

/// Ensures `payload.task_id` is set and returns it.
///
/// An existing non-empty `task_id` is kept as is.
pub fn backfill_task_id(payload: &mut Value, row_id: &TaskId) -> Result<String, EventError> {
    if payload.is_null() {
        *payload = Value::Object(Map::new());
    }
    let Value::Object(map) = payload else {
        return Err(EventError::InvalidEnvelope(format!(
            "payload must be an object, got {payload}"
        )));
    };

    if let Some(Value::String(existing)) = map.get(TASK_ID_FIELD) {
        if !existing.is_empty() {
            return Ok(existing.clone());
        }
    }

    let id = row_id.to_string();
    map.insert(TASK_ID_FIELD.to_string(), Value::String(id.clone()));
    Ok(id)
}

// =============================================================================
// Payloads
// =============================================================================

/// Where the node gets the code or image from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeploySource {
    Git {
        repository: String,
        branch: String,
        commit_sha: Option<String>,
    },
    DockerImage {
        image: String,
        tag: String,
    },
}

impl DeploySource {
    pub fn commit_sha(&self) -> Option<&str> {
        match self {
            Self::Git { commit_sha, .. } => commit_sha.as_deref(),
            Self::DockerImage { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_directory: Option<String>,
}

/// Resource limits for the container.
///
/// A missing field means the node applies its own default; unbounded limits
/// are never sent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Docker `--cpus` value, e.g. `"0.5"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<String>,
    /// Docker `--memory` value, e.g. `"512m"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth_mbps: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pids: Option<u64>,
}

impl ResourceLimits {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployTaskPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub deployment_id: DeploymentId,
    pub application_id: AppId,
    pub source: DeploySource,
    #[serde(default)]
    pub build: BuildSettings,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default, skip_serializing_if = "ResourceLimits::is_empty")]
    pub resources: ResourceLimits,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_to_deployment_id: Option<DeploymentId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelTaskPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub deployment_id: DeploymentId,
    pub application_id: AppId,
}

// =============================================================================
// Node reports and push messages
// =============================================================================

/// Final outcome of a deployment, reported by the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionReport {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
}

impl CompletionReport {
    pub fn succeeded(container_id: impl Into<String>) -> Self {
        Self {
            success: true,
            error: None,
            container_id: Some(container_id.into()),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            container_id: None,
        }
    }

    pub fn status(&self) -> DeploymentStatus {
        if self.success {
            DeploymentStatus::Running
        } else {
            DeploymentStatus::Failed
        }
    }
}

/// Intermediate progress (`building` or `deploying`) plus new log lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub status: DeploymentStatus,
    #[serde(default)]
    pub logs: Vec<String>,
}

/// Message sent over a node's live connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message", rename_all = "snake_case")]
pub enum NodeMessage {
    /// A task that is also persisted for polling.
    Task { task: TaskEnvelope },
    /// Abort work for a deployment, if any is running.
    Cancel { deployment_id: DeploymentId },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deploy_payload() -> DeployTaskPayload {
        DeployTaskPayload {
            task_id: None,
            deployment_id: DeploymentId::new(),
            application_id: AppId::new(),
            source: DeploySource::Git {
                repository: "https://git.example.com/acme/web.git".to_string(),
                branch: "main".to_string(),
                commit_sha: Some("abc123".to_string()),
            },
            build: BuildSettings::default(),
            env: BTreeMap::new(),
            ports: vec![8000],
            resources: ResourceLimits::default(),
            rollback_to_deployment_id: None,
        }
    }

    #[test]
    fn test_backfills_missing_task_id() {
        let row_id = TaskId::new();
        let stored = StoredTask::deploy(&deploy_payload()).unwrap();
        let envelope = TaskEnvelope::from_stored(&row_id, stored.to_value().unwrap()).unwrap();

        assert_eq!(envelope.task_type, TaskType::Deploy);
        assert_eq!(envelope.id, row_id.to_string());
        assert_eq!(envelope.payload[TASK_ID_FIELD], json!(row_id.to_string()));
        assert_eq!(
            envelope.deploy_payload().unwrap().task_id.as_deref(),
            Some(envelope.id.as_str())
        );
    }

    #[test]
    fn test_keeps_existing_task_id() {
        let data = json!({"type": "cancel_deployment", "payload": {
            "task_id": "legacy-7",
            "deployment_id": DeploymentId::new().to_string(),
            "application_id": AppId::new().to_string(),
        }});
        let envelope = TaskEnvelope::from_stored(&TaskId::new(), data).unwrap();
        assert_eq!(envelope.id, "legacy-7");
        assert!(envelope.cancel_payload().is_ok());
        assert!(envelope.deploy_payload().is_err());
    }

    #[test]
    fn test_rejects_bad_envelopes() {
        let row_id = TaskId::new();
        assert!(TaskEnvelope::from_stored(&row_id, json!({"payload": {}})).is_err());
        assert!(TaskEnvelope::from_stored(&row_id, json!({"type": "deploy", "payload": [1]})).is_err());

        let envelope =
            TaskEnvelope::from_stored(&row_id, json!({"type": "deploy", "payload": null})).unwrap();
        assert_eq!(envelope.id, row_id.to_string());
    }

    #[test]
    fn test_unbounded_resources_are_omitted() {
        let value = serde_json::to_value(deploy_payload()).unwrap();
        assert!(value.get("resources").is_none());
        assert!(value.get("task_id").is_none());

        let mut limited = deploy_payload();
        limited.resources.memory = Some("512m".to_string());
        let value = serde_json::to_value(limited).unwrap();
        assert_eq!(value["resources"], json!({"memory": "512m"}));
        assert_eq!(value["source"]["kind"], "git");
    }

    #[test]
    fn test_completion_status() {
        assert_eq!(CompletionReport::succeeded("c1").status(), DeploymentStatus::Running);
        assert_eq!(CompletionReport::failed("boom").status(), DeploymentStatus::Failed);
    }

    #[test]
    fn test_node_message_tagging() {
        let id = DeploymentId::new();
        let value = serde_json::to_value(NodeMessage::Cancel { deployment_id: id }).unwrap();
        assert_eq!(value, json!({"message": "cancel", "deployment_id": id.to_string()}));
    }
}
