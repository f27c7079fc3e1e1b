//! In-process store for tests and local development.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use berth_events::{ApplicationStatus, DeploymentStatus, TaskStatus, TASK_ID_FIELD};
use berth_id::{AppId, DeploymentId, EnvId, NodeId, ProjectId, TaskId, TeamId, UserId};
use berth_networking::PortRanges;
use berth_quota::{Configured, ConfiguredLimits, EffectiveLimits, ResourceKind};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{
    DeploymentStore, HierarchyStore, LimitNode, NodeStore, PortStore, TaskStore,
};
use crate::db::DbError;
use crate::hierarchy::EntityRef;
use crate::model::{
    Application, Deployment, DeploymentTask, DeploymentUpdate, Environment, Node, PortAllocation,
    PortOwner, Project, Team, User,
};

#[derive(Default)]
struct MemoryState {
    users: BTreeMap<UserId, User>,
    teams: BTreeMap<TeamId, Team>,
    projects: BTreeMap<ProjectId, Project>,
    environments: BTreeMap<EnvId, Environment>,
    applications: BTreeMap<AppId, Application>,
    nodes: BTreeMap<NodeId, Node>,
    ports: BTreeMap<(NodeId, u16), PortAllocation>,
    deployments: BTreeMap<DeploymentId, Deployment>,
    tasks: BTreeMap<TaskId, DeploymentTask>,
}

impl MemoryState {
    fn limits_mut(&mut self, entity: &EntityRef) -> Option<&mut ConfiguredLimits> {
        match entity {
            EntityRef::User(_) => None,
            EntityRef::Team(id) => self.teams.get_mut(id).map(|t| &mut t.limits),
            EntityRef::Project(id) => self.projects.get_mut(id).map(|p| &mut p.limits),
            EntityRef::Environment(id) => self.environments.get_mut(id).map(|e| &mut e.limits),
            EntityRef::Application(id) => self.applications.get_mut(id).map(|a| &mut a.limits),
        }
    }

    fn limit_node(&self, entity: &EntityRef) -> Option<LimitNode> {
        let (parent, limits) = match entity {
            EntityRef::User(_) => return None,
            EntityRef::Team(id) => self
                .teams
                .get(id)
                .map(|t| (EntityRef::from(t.owner_id), t.limits))?,
            EntityRef::Project(id) => {
                self.projects.get(id).map(|p| (EntityRef::from(p.team_id), p.limits))?
            }
            EntityRef::Environment(id) => self
                .environments
                .get(id)
                .map(|e| (EntityRef::from(e.project_id), e.limits))?,
            EntityRef::Application(id) => self
                .applications
                .get(id)
                .map(|a| (EntityRef::from(a.environment_id), a.limits))?,
        };
        Some(LimitNode {
            entity: *entity,
            parent,
            limits,
        })
    }

    fn task_matches(task: &DeploymentTask, node_id: &NodeId, task_id: &str) -> bool {
        if task.node_id != *node_id {
            return false;
        }
        if task.id.to_string() == task_id {
            return true;
        }
        task.data
            .get("payload")
            .and_then(|p| p.get(TASK_ID_FIELD))
            .and_then(|v| v.as_str())
            == Some(task_id)
    }
}

/// [`super::Store`] kept in process memory.
///
/// Uniqueness of `(node_id, port)` and the deployment status guard behave as
/// they do on Postgres, so engine tests exercise the same races.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl HierarchyStore for MemoryStore {
    async fn insert_user(&self, user: &User) -> Result<(), DbError> {
        self.state().users.insert(user.id, user.clone());
        Ok(())
    }

    async fn insert_team(&self, team: &Team) -> Result<(), DbError> {
        self.state().teams.insert(team.id, team.clone());
        Ok(())
    }

    async fn insert_project(&self, project: &Project) -> Result<(), DbError> {
        self.state().projects.insert(project.id, project.clone());
        Ok(())
    }

    async fn insert_environment(&self, environment: &Environment) -> Result<(), DbError> {
        self.state()
            .environments
            .insert(environment.id, environment.clone());
        Ok(())
    }

    async fn insert_application(&self, application: &Application) -> Result<(), DbError> {
        self.state()
            .applications
            .insert(application.id, application.clone());
        Ok(())
    }

    async fn delete_application(&self, id: &AppId) -> Result<bool, DbError> {
        Ok(self.state().applications.remove(id).is_some())
    }

    async fn user_ceilings(&self, id: &UserId) -> Result<Option<EffectiveLimits>, DbError> {
        Ok(self.state().users.get(id).map(|u| u.ceilings))
    }

    async fn limit_node(&self, entity: &EntityRef) -> Result<Option<LimitNode>, DbError> {
        Ok(self.state().limit_node(entity))
    }

    async fn children(&self, parent: &EntityRef) -> Result<Vec<LimitNode>, DbError> {
        let state = self.state();
        let children: Vec<EntityRef> = match parent {
            EntityRef::User(id) => state
                .teams
                .values()
                .filter(|t| t.owner_id == *id)
                .map(|t| t.id.into())
                .collect(),
            EntityRef::Team(id) => state
                .projects
                .values()
                .filter(|p| p.team_id == *id)
                .map(|p| p.id.into())
                .collect(),
            EntityRef::Project(id) => state
                .environments
                .values()
                .filter(|e| e.project_id == *id)
                .map(|e| e.id.into())
                .collect(),
            EntityRef::Environment(id) => state
                .applications
                .values()
                .filter(|a| a.environment_id == *id)
                .map(|a| a.id.into())
                .collect(),
            EntityRef::Application(_) => Vec::new(),
        };
        Ok(children
            .iter()
            .filter_map(|child| state.limit_node(child))
            .collect())
    }

    async fn set_user_ceilings(
        &self,
        id: &UserId,
        ceilings: &EffectiveLimits,
    ) -> Result<bool, DbError> {
        let mut state = self.state();
        let Some(user) = state.users.get_mut(id) else {
            return Ok(false);
        };
        user.ceilings = *ceilings;
        Ok(true)
    }

    async fn set_limits(
        &self,
        entity: &EntityRef,
        limits: &ConfiguredLimits,
    ) -> Result<bool, DbError> {
        let mut state = self.state();
        let Some(slot) = state.limits_mut(entity) else {
            return Ok(false);
        };
        *slot = *limits;
        Ok(true)
    }

    async fn reset_to_auto(
        &self,
        kind: ResourceKind,
        entities: &[EntityRef],
    ) -> Result<u64, DbError> {
        let mut state = self.state();
        let mut rewritten = 0;
        for entity in entities {
            if let Some(limits) = state.limits_mut(entity) {
                if !limits.get(kind).is_auto() {
                    limits.set(kind, Configured::Auto);
                    rewritten += 1;
                }
            }
        }
        Ok(rewritten)
    }
}

#[async_trait]
impl DeploymentStore for MemoryStore {
    async fn get_application(&self, id: &AppId) -> Result<Option<Application>, DbError> {
        Ok(self.state().applications.get(id).cloned())
    }

    async fn assign_node(&self, id: &AppId, node_id: Option<&NodeId>) -> Result<bool, DbError> {
        let mut state = self.state();
        let Some(app) = state.applications.get_mut(id) else {
            return Ok(false);
        };
        app.node_id = node_id.copied();
        Ok(true)
    }

    async fn set_applied_limits(
        &self,
        id: &AppId,
        limits: &EffectiveLimits,
    ) -> Result<(), DbError> {
        if let Some(app) = self.state().applications.get_mut(id) {
            app.applied_limits = Some(*limits);
        }
        Ok(())
    }

    async fn insert_deployment(&self, deployment: &Deployment) -> Result<(), DbError> {
        let mut state = self.state();
        if let Some(app) = state.applications.get_mut(&deployment.application_id) {
            app.status = ApplicationStatus::Deploying;
        }
        state.deployments.insert(deployment.id, deployment.clone());
        Ok(())
    }

    async fn get_deployment(&self, id: &DeploymentId) -> Result<Option<Deployment>, DbError> {
        Ok(self.state().deployments.get(id).cloned())
    }

    async fn update_deployment(
        &self,
        id: &DeploymentId,
        allowed_from: &[DeploymentStatus],
        update: &DeploymentUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<Deployment>, DbError> {
        let mut state = self.state();
        let Some(deployment) = state.deployments.get_mut(id) else {
            return Ok(None);
        };
        if !allowed_from.contains(&deployment.status) {
            return Ok(None);
        }
        update.apply(deployment, now);
        let updated = deployment.clone();

        if let Some(status) = update.application_status {
            if let Some(app) = state.applications.get_mut(&updated.application_id) {
                app.status = status;
            }
        }
        Ok(Some(updated))
    }
}

#[async_trait]
impl NodeStore for MemoryStore {
    async fn insert_node(&self, node: &Node) -> Result<(), DbError> {
        self.state().nodes.insert(node.id, node.clone());
        Ok(())
    }

    async fn get_node(&self, id: &NodeId) -> Result<Option<Node>, DbError> {
        Ok(self.state().nodes.get(id).cloned())
    }

    async fn delete_node(&self, id: &NodeId) -> Result<bool, DbError> {
        Ok(self.state().nodes.remove(id).is_some())
    }

    async fn set_port_ranges(&self, id: &NodeId, ranges: &PortRanges) -> Result<bool, DbError> {
        let mut state = self.state();
        let Some(node) = state.nodes.get_mut(id) else {
            return Ok(false);
        };
        node.port_ranges = ranges.clone();
        Ok(true)
    }

    async fn set_port_cursor(&self, id: &NodeId, cursor: u16) -> Result<(), DbError> {
        if let Some(node) = self.state().nodes.get_mut(id) {
            node.port_cursor = Some(cursor);
        }
        Ok(())
    }

    async fn touch_node(&self, id: &NodeId, now: DateTime<Utc>) -> Result<bool, DbError> {
        let mut state = self.state();
        let Some(node) = state.nodes.get_mut(id) else {
            return Ok(false);
        };
        node.last_seen_at = Some(now);
        Ok(true)
    }
}

#[async_trait]
impl PortStore for MemoryStore {
    async fn try_insert_port(&self, allocation: &PortAllocation) -> Result<bool, DbError> {
        let mut state = self.state();
        let key = (allocation.node_id, allocation.port);
        if state.ports.contains_key(&key) {
            return Ok(false);
        }
        state.ports.insert(key, allocation.clone());
        Ok(true)
    }

    async fn delete_port(&self, node_id: &NodeId, port: u16) -> Result<bool, DbError> {
        Ok(self.state().ports.remove(&(*node_id, port)).is_some())
    }

    async fn purge_expired(&self, node_id: &NodeId, now: DateTime<Utc>) -> Result<u64, DbError> {
        let mut state = self.state();
        let before = state.ports.len();
        state
            .ports
            .retain(|(node, _), row| node != node_id || !row.is_expired(now));
        Ok((before - state.ports.len()) as u64)
    }

    async fn attach_reservation(
        &self,
        reservation: &Uuid,
        node_id: &NodeId,
        application: &AppId,
    ) -> Result<u64, DbError> {
        let mut state = self.state();
        let mut attached = 0;
        for row in state.ports.values_mut() {
            if row.node_id == *node_id && row.owner == PortOwner::Reservation(*reservation) {
                row.owner = PortOwner::Application(*application);
                row.expires_at = None;
                attached += 1;
            }
        }
        Ok(attached)
    }

    async fn release_application(&self, application: &AppId) -> Result<u64, DbError> {
        let mut state = self.state();
        let before = state.ports.len();
        state
            .ports
            .retain(|_, row| row.owner != PortOwner::Application(*application));
        Ok((before - state.ports.len()) as u64)
    }

    async fn release_reservation(&self, reservation: &Uuid) -> Result<u64, DbError> {
        let mut state = self.state();
        let before = state.ports.len();
        state
            .ports
            .retain(|_, row| row.owner != PortOwner::Reservation(*reservation));
        Ok((before - state.ports.len()) as u64)
    }

    async fn ports_for_application(
        &self,
        application: &AppId,
    ) -> Result<Vec<PortAllocation>, DbError> {
        Ok(self
            .state()
            .ports
            .values()
            .filter(|row| row.owner == PortOwner::Application(*application))
            .cloned()
            .collect())
    }

    async fn ports_for_reservation(
        &self,
        reservation: &Uuid,
    ) -> Result<Vec<PortAllocation>, DbError> {
        Ok(self
            .state()
            .ports
            .values()
            .filter(|row| row.owner == PortOwner::Reservation(*reservation))
            .cloned()
            .collect())
    }

    async fn purge_orphans(&self, now: DateTime<Utc>) -> Result<u64, DbError> {
        let mut guard = self.state();
        let state = &mut *guard;
        let before = state.ports.len();
        let nodes = &state.nodes;
        let applications = &state.applications;
        state.ports.retain(|(node, _), row| {
            if !nodes.contains_key(node) || row.is_expired(now) {
                return false;
            }
            match row.owner {
                PortOwner::Application(app) => applications.contains_key(&app),
                PortOwner::Reservation(_) => true,
            }
        });
        Ok((before - state.ports.len()) as u64)
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn insert_task(&self, task: &DeploymentTask) -> Result<(), DbError> {
        self.state().tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn claim_tasks(
        &self,
        node_id: &NodeId,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<DeploymentTask>, DbError> {
        let mut state = self.state();
        let mut claimed = Vec::new();
        for task in state.tasks.values_mut() {
            if task.node_id != *node_id {
                continue;
            }
            let claimable = match task.status {
                TaskStatus::Pending => true,
                TaskStatus::Sent => task.sent_at.map_or(true, |at| at < stale_before),
                _ => false,
            };
            if claimable {
                task.status = TaskStatus::Sent;
                task.sent_at = Some(now);
                task.updated_at = now;
                claimed.push(task.clone());
            }
        }
        claimed.sort_by_key(|t| (t.created_at, t.id));
        Ok(claimed)
    }

    async fn acknowledge_task(
        &self,
        node_id: &NodeId,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let mut state = self.state();
        let Some(task) = state
            .tasks
            .values_mut()
            .find(|t| MemoryState::task_matches(t, node_id, task_id))
        else {
            return Ok(false);
        };
        if matches!(task.status, TaskStatus::Pending | TaskStatus::Sent) {
            task.status = TaskStatus::Acknowledged;
            task.updated_at = now;
        }
        Ok(true)
    }

    async fn settle_tasks(
        &self,
        deployment_id: &DeploymentId,
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<u64, DbError> {
        let mut state = self.state();
        let mut settled = 0;
        for task in state.tasks.values_mut() {
            if task.deployment_id == *deployment_id
                && !matches!(task.status, TaskStatus::Completed | TaskStatus::Failed)
            {
                task.status = status;
                task.updated_at = now;
                settled += 1;
            }
        }
        Ok(settled)
    }

    async fn tasks_for_deployment(
        &self,
        deployment_id: &DeploymentId,
    ) -> Result<Vec<DeploymentTask>, DbError> {
        let mut tasks: Vec<DeploymentTask> = self
            .state()
            .tasks
            .values()
            .filter(|t| t.deployment_id == *deployment_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.created_at, t.id));
        Ok(tasks)
    }
}
