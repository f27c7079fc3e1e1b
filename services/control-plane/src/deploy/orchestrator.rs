//! Deployment state machine.
//!
//! `queued → building → deploying → running | failed | cancelled`. Every
//! transition is a compare-and-set on the current status, so duplicate or
//! late node reports never move a deployment backwards and the application
//! status is written in the same step as the deployment's.

use std::sync::Arc;

use berth_events::{
    ApplicationStatus, CancelTaskPayload, CompletionReport, DeploySource, DeploymentStatus,
    NodeMessage, ProgressReport, StoredTask, TaskStatus,
};
use berth_id::{AppId, DeploymentId, NodeId};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use super::{build_payload, DeployError, TaskQueue};
use crate::cascade::CascadeReport;
use crate::context::Context;
use crate::hierarchy::Hierarchy;
use crate::model::{Application, Deployment, DeploymentUpdate, PortOwner};
use crate::ports::PortAllocator;
use crate::store::{DeploymentStore, NodeStore};

/// Result of a cancel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled(Deployment),
    /// The deployment had already left the in-progress states; nothing changed.
    NotCancellable(Deployment),
}

/// Best-effort redeploys after a cascade. Failures are counted, not raised.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RedeployStats {
    pub redeployed: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct DeploymentOrchestrator {
    deployments: Arc<dyn DeploymentStore>,
    nodes: Arc<dyn NodeStore>,
    hierarchy: Hierarchy,
    ports: PortAllocator,
    queue: TaskQueue,
}

impl DeploymentOrchestrator {
    pub fn new(
        deployments: Arc<dyn DeploymentStore>,
        nodes: Arc<dyn NodeStore>,
        hierarchy: Hierarchy,
        ports: PortAllocator,
        queue: TaskQueue,
    ) -> Self {
        Self {
            deployments,
            nodes,
            hierarchy,
            ports,
            queue,
        }
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Pins an application to a node, or clears the assignment.
    #[instrument(skip(self, ctx), fields(app_id = %app_id, request_id = %ctx.request_id))]
    pub async fn assign_node(
        &self,
        app_id: &AppId,
        node_id: Option<&NodeId>,
        ctx: &Context,
    ) -> Result<(), DeployError> {
        if let Some(node_id) = node_id {
            if self.nodes.get_node(node_id).await?.is_none() {
                return Err(DeployError::NodeNotFound(*node_id));
            }
        }
        if !self.deployments.assign_node(app_id, node_id).await? {
            return Err(DeployError::ApplicationNotFound(*app_id));
        }
        info!(node_id = ?node_id.map(ToString::to_string), actor_id = %ctx.actor_id, "Node assignment updated");
        Ok(())
    }

    /// Starts a deployment of the application's current desired state.
    ///
    /// Fails before anything is written when the application has no node or
    /// its node is gone.
    #[instrument(skip(self, ctx), fields(app_id = %app_id, request_id = %ctx.request_id))]
    pub async fn create(
        &self,
        app_id: &AppId,
        commit_override: Option<String>,
        ctx: &Context,
    ) -> Result<Deployment, DeployError> {
        let application = self.load_application(app_id).await?;
        let commit_sha = commit_override.or_else(|| application.source.commit_sha().map(str::to_string));
        let branch = match &application.source {
            DeploySource::Git { branch, .. } => Some(branch.clone()),
            DeploySource::DockerImage { .. } => None,
        };
        self.start(&application, commit_sha, branch, None, ctx).await
    }

    /// Deploys the commit snapshot of an earlier deployment as a new one.
    /// The target row is never modified.
    #[instrument(skip(self, ctx), fields(target = %target, request_id = %ctx.request_id))]
    pub async fn rollback(
        &self,
        target: &DeploymentId,
        ctx: &Context,
    ) -> Result<Deployment, DeployError> {
        let previous = self.get(target).await?;
        let application = self.load_application(&previous.application_id).await?;
        self.start(
            &application,
            previous.commit_sha.clone(),
            previous.branch.clone(),
            Some(previous.id),
            ctx,
        )
        .await
    }

    async fn start(
        &self,
        application: &Application,
        commit_sha: Option<String>,
        branch: Option<String>,
        rollback_to: Option<DeploymentId>,
        ctx: &Context,
    ) -> Result<Deployment, DeployError> {
        let node_id = application
            .node_id
            .ok_or(DeployError::NoNodeAssigned(application.id))?;
        if self.nodes.get_node(&node_id).await?.is_none() {
            return Err(DeployError::NodeNotFound(node_id));
        }

        let limits = self.hierarchy.effective_limits(&application.id.into()).await?;
        let (ports, fresh_port) = self.ensure_port(application, &node_id).await?;

        let now = Utc::now();
        let deployment = Deployment {
            id: DeploymentId::new(),
            application_id: application.id,
            node_id,
            status: DeploymentStatus::Queued,
            commit_sha,
            branch,
            logs: Vec::new(),
            rollback_to_deployment_id: rollback_to,
            container_id: None,
            error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        };
        let payload = build_payload(application, &deployment, &ports, &limits);
        let inserted = async {
            let task = StoredTask::deploy(&payload)?;
            self.deployments.insert_deployment(&deployment).await?;
            Ok::<_, DeployError>(task)
        }
        .await;
        let task = match inserted {
            Ok(task) => task,
            Err(e) => {
                if fresh_port {
                    self.release_fresh_port(application).await;
                }
                return Err(e);
            }
        };
        info!(
            deployment_id = %deployment.id,
            node_id = %node_id,
            rollback_to = ?rollback_to.map(|id| id.to_string()),
            actor_id = %ctx.actor_id,
            "Deployment created"
        );

        let dispatched = async {
            self.deployments
                .set_applied_limits(&application.id, &limits)
                .await?;
            self.queue.enqueue(&node_id, &deployment.id, task).await
        }
        .await;

        if let Err(e) = dispatched {
            warn!(deployment_id = %deployment.id, error = %e, "Dispatch failed, marking deployment failed");
            let update = DeploymentUpdate {
                status: Some(DeploymentStatus::Failed),
                error: Some(e.to_string()),
                application_status: Some(ApplicationStatus::Failed),
                ..DeploymentUpdate::default()
            };
            self.deployments
                .update_deployment(&deployment.id, &DeploymentStatus::IN_PROGRESS, &update, Utc::now())
                .await?;
            return Err(e);
        }
        Ok(deployment)
    }

    /// Ports bound to the application, allocating one on its node if it has
    /// none. The flag is set when a port was allocated here.
    async fn ensure_port(
        &self,
        application: &Application,
        node_id: &NodeId,
    ) -> Result<(Vec<u16>, bool), DeployError> {
        let ports = self.ports.ports_for_application(&application.id).await?;
        if !ports.is_empty() {
            return Ok((ports, false));
        }
        let port = self
            .ports
            .allocate(node_id, PortOwner::Application(application.id))
            .await?;
        Ok((vec![port], true))
    }

    async fn release_fresh_port(&self, application: &Application) {
        if let Err(e) = self.ports.release_port(&application.id).await {
            warn!(app_id = %application.id, error = %e, "Failed to release port of aborted deployment");
        }
    }

    /// Cancels an in-progress deployment and resets its application to
    /// `stopped`. The node is told to abort on a best-effort basis; the state
    /// change here stands either way.
    #[instrument(skip(self, ctx), fields(deployment_id = %id, request_id = %ctx.request_id))]
    pub async fn cancel(&self, id: &DeploymentId, ctx: &Context) -> Result<CancelOutcome, DeployError> {
        let update = DeploymentUpdate::status(DeploymentStatus::Cancelled)
            .with_application_status(ApplicationStatus::Stopped);
        let Some(cancelled) = self
            .deployments
            .update_deployment(id, &DeploymentStatus::IN_PROGRESS, &update, Utc::now())
            .await?
        else {
            let current = self.get(id).await?;
            debug!(status = %current.status, "Deployment not in progress, cancel ignored");
            return Ok(CancelOutcome::NotCancellable(current));
        };

        let settled = self.queue.settle(id, TaskStatus::Failed).await?;
        info!(settled, actor_id = %ctx.actor_id, "Deployment cancelled");

        self.queue
            .notify(
                &cancelled.node_id,
                &NodeMessage::Cancel {
                    deployment_id: cancelled.id,
                },
            )
            .await;

        let task = StoredTask::cancel(&CancelTaskPayload {
            task_id: None,
            deployment_id: cancelled.id,
            application_id: cancelled.application_id,
        })?;
        if let Err(e) = self.queue.enqueue(&cancelled.node_id, &cancelled.id, task).await {
            warn!(error = %e, "Failed to queue cancel task");
        }

        Ok(CancelOutcome::Cancelled(cancelled))
    }

    /// Applies a node's final report. Reports for deployments that already
    /// finished are ignored and the current row is returned.
    #[instrument(skip(self, report), fields(deployment_id = %id, success = report.success))]
    pub async fn report_completion(
        &self,
        id: &DeploymentId,
        report: &CompletionReport,
    ) -> Result<Deployment, DeployError> {
        let status = report.status();
        let update = DeploymentUpdate {
            status: Some(status),
            container_id: report.container_id.clone(),
            error: report.error.clone(),
            application_status: ApplicationStatus::after(status),
            ..DeploymentUpdate::default()
        };

        let Some(finished) = self
            .deployments
            .update_deployment(id, &DeploymentStatus::IN_PROGRESS, &update, Utc::now())
            .await?
        else {
            let current = self.get(id).await?;
            debug!(status = %current.status, "Duplicate or late completion ignored");
            return Ok(current);
        };

        let task_status = if report.success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        self.queue.settle(id, task_status).await?;

        match &report.error {
            Some(error) => warn!(error = %error, "Deployment failed"),
            None => info!(container_id = ?report.container_id, "Deployment running"),
        }
        Ok(finished)
    }

    /// Applies an intermediate `building`/`deploying` report. Status only
    /// moves forward; log lines are appended whenever the status is accepted.
    #[instrument(skip(self, report), fields(deployment_id = %id, status = %report.status))]
    pub async fn report_progress(
        &self,
        id: &DeploymentId,
        report: &ProgressReport,
    ) -> Result<Deployment, DeployError> {
        if !matches!(report.status, DeploymentStatus::Building | DeploymentStatus::Deploying) {
            return Err(DeployError::InvalidProgressStatus(report.status));
        }

        let allowed: Vec<DeploymentStatus> = DeploymentStatus::IN_PROGRESS
            .into_iter()
            .filter(|current| *current == report.status || current.can_transition_to(report.status))
            .collect();
        let update = DeploymentUpdate {
            status: Some(report.status),
            append_logs: report.logs.clone(),
            ..DeploymentUpdate::default()
        };

        match self
            .deployments
            .update_deployment(id, &allowed, &update, Utc::now())
            .await?
        {
            Some(updated) => Ok(updated),
            None => {
                let current = self.get(id).await?;
                debug!(current = %current.status, "Stale progress report ignored");
                Ok(current)
            }
        }
    }

    pub async fn get(&self, id: &DeploymentId) -> Result<Deployment, DeployError> {
        self.deployments
            .get_deployment(id)
            .await?
            .ok_or(DeployError::DeploymentNotFound(*id))
    }

    /// Redeploys running applications whose effective limits changed in a
    /// cascade. Applications without a node or not running are skipped.
    #[instrument(skip_all, fields(root = %report.root, request_id = %ctx.request_id))]
    pub async fn redeploy_changed(&self, report: &CascadeReport, ctx: &Context) -> RedeployStats {
        let mut stats = RedeployStats::default();
        for app_id in &report.changed_applications {
            let application = match self.deployments.get_application(app_id).await {
                Ok(Some(application)) => application,
                Ok(None) => {
                    stats.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!(app_id = %app_id, error = %e, "Failed to load application for redeploy");
                    stats.failed += 1;
                    continue;
                }
            };
            if application.node_id.is_none() || application.status != ApplicationStatus::Running {
                stats.skipped += 1;
                continue;
            }

            match self.create(app_id, None, ctx).await {
                Ok(deployment) => {
                    debug!(app_id = %app_id, deployment_id = %deployment.id, "Redeploy queued");
                    stats.redeployed += 1;
                }
                Err(e) => {
                    warn!(app_id = %app_id, error = %e, "Redeploy after limit change failed");
                    stats.failed += 1;
                }
            }
        }

        if stats.redeployed > 0 || stats.failed > 0 {
            info!(
                redeployed = stats.redeployed,
                skipped = stats.skipped,
                failed = stats.failed,
                "Limit change redeploys complete"
            );
        }
        stats
    }

    async fn load_application(&self, id: &AppId) -> Result<Application, DeployError> {
        self.deployments
            .get_application(id)
            .await?
            .ok_or(DeployError::ApplicationNotFound(*id))
    }
}
