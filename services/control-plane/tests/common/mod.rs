//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use berth_control_plane::context::Context;
use berth_control_plane::deploy::{NodePush, PushError};
use berth_control_plane::engine::{Engine, EngineSettings};
use berth_control_plane::model::{Application, Environment, Node, Project, Team, User};
use berth_control_plane::store::{HierarchyStore, MemoryStore, NodeStore};
use berth_events::{DeploySource, NodeMessage};
use berth_id::{EnvId, NodeId, ProjectId, TeamId, UserId};
use berth_networking::PortRanges;
use berth_quota::{Configured, ConfiguredLimits, Effective, EffectiveLimits, ResourceKind};

/// Records every push. Nodes not marked connected fail like a closed socket.
#[derive(Default)]
pub struct RecordingPush {
    sent: Mutex<Vec<(NodeId, NodeMessage)>>,
    connected: Mutex<Vec<NodeId>>,
}

impl RecordingPush {
    pub fn connect(&self, node_id: NodeId) {
        self.connected.lock().unwrap().push(node_id);
    }

    pub fn sent(&self) -> Vec<(NodeId, NodeMessage)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl NodePush for RecordingPush {
    async fn send_to_node(&self, node_id: &NodeId, message: &NodeMessage) -> Result<(), PushError> {
        if !self.connected.lock().unwrap().contains(node_id) {
            return Err(PushError::NotConnected(*node_id));
        }
        self.sent.lock().unwrap().push((*node_id, message.clone()));
        Ok(())
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub push: Arc<RecordingPush>,
    pub engine: Engine,
    pub ctx: Context,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(EngineSettings::default())
    }

    pub fn with_settings(settings: EngineSettings) -> Self {
        let store = Arc::new(MemoryStore::new());
        let push = Arc::new(RecordingPush::default());
        let engine = Engine::new(store.clone(), push.clone(), settings);
        Self {
            store,
            push,
            engine,
            ctx: Context::system(),
        }
    }

    pub async fn user(&self, ceilings: EffectiveLimits) -> UserId {
        let user = User {
            id: UserId::new(),
            name: "ada".to_string(),
            ceilings,
        };
        self.store.insert_user(&user).await.unwrap();
        user.id
    }

    pub async fn team(&self, owner_id: UserId, limits: ConfiguredLimits) -> TeamId {
        let team = Team {
            id: TeamId::new(),
            owner_id,
            name: "core".to_string(),
            limits,
        };
        self.store.insert_team(&team).await.unwrap();
        team.id
    }

    pub async fn project(&self, team_id: TeamId, limits: ConfiguredLimits) -> ProjectId {
        let project = Project {
            id: ProjectId::new(),
            team_id,
            name: "shop".to_string(),
            limits,
        };
        self.store.insert_project(&project).await.unwrap();
        project.id
    }

    pub async fn environment(&self, project_id: ProjectId, limits: ConfiguredLimits) -> EnvId {
        let environment = Environment {
            id: EnvId::new(),
            project_id,
            name: "production".to_string(),
            limits,
        };
        self.store.insert_environment(&environment).await.unwrap();
        environment.id
    }

    pub async fn application(&self, environment_id: EnvId, node_id: Option<NodeId>) -> Application {
        let mut app = Application::new(
            environment_id,
            "web",
            DeploySource::Git {
                repository: "https://git.example.com/acme/web.git".to_string(),
                branch: "main".to_string(),
                commit_sha: Some("abc123".to_string()),
            },
        );
        app.node_id = node_id;
        self.store.insert_application(&app).await.unwrap();
        app
    }

    pub async fn node(&self, ranges: &str) -> Node {
        let node = Node::new("node-1", PortRanges::parse_list(ranges).unwrap());
        self.store.insert_node(&node).await.unwrap();
        node
    }

    /// User with no ceilings, a team, a project and one environment, all auto.
    pub async fn environment_tree(&self) -> EnvId {
        let user = self.user(EffectiveLimits::default()).await;
        let team = self.team(user, ram(Configured::Fixed(4096))).await;
        let project = self.project(team, ConfiguredLimits::default()).await;
        self.environment(project, ConfiguredLimits::default()).await
    }
}

/// Configured limits with only RAM set.
pub fn ram(value: Configured) -> ConfiguredLimits {
    ConfiguredLimits::default().with(ResourceKind::RamMb, value)
}

pub fn ram_ceiling(mb: u64) -> EffectiveLimits {
    EffectiveLimits::default().with(ResourceKind::RamMb, Effective::Limited(mb))
}
