//! Wiring of the allocation and dispatch components over one store.

use std::sync::Arc;
use std::time::Duration;

use berth_events::TaskEnvelope;
use berth_id::NodeId;
use berth_networking::PortRanges;
use chrono::Utc;
use tracing::info;

use crate::cascade::LimitCascade;
use crate::db::DbError;
use crate::deploy::{DeployError, DeploymentOrchestrator, NodePush, TaskQueue, DEFAULT_STALE_AFTER};
use crate::hierarchy::Hierarchy;
use crate::model::Node;
use crate::ports::{PortAllocator, PortProbe, DEFAULT_RESERVATION_TTL};
use crate::store::{NodeStore, Store};

/// Timing knobs for the engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub reservation_ttl: Duration,
    pub task_stale_after: Duration,
    pub node_reachable_within: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            reservation_ttl: DEFAULT_RESERVATION_TTL,
            task_stale_after: DEFAULT_STALE_AFTER,
            node_reachable_within: Duration::from_secs(60),
        }
    }
}

/// Every engine component, sharing one backing store.
#[derive(Clone)]
pub struct Engine {
    pub hierarchy: Hierarchy,
    pub cascade: LimitCascade,
    pub ports: PortAllocator,
    pub queue: TaskQueue,
    pub orchestrator: DeploymentOrchestrator,
    pub nodes: Arc<dyn NodeStore>,
    pub settings: EngineSettings,
}

impl Engine {
    pub fn new<S: Store + 'static>(
        store: Arc<S>,
        push: Arc<dyn NodePush>,
        settings: EngineSettings,
    ) -> Self {
        Self::build(store, push, None, settings)
    }

    /// Like [`Engine::new`], with a liveness probe vetting allocated ports.
    pub fn with_probe<S: Store + 'static>(
        store: Arc<S>,
        push: Arc<dyn NodePush>,
        probe: Arc<dyn PortProbe>,
        settings: EngineSettings,
    ) -> Self {
        Self::build(store, push, Some(probe), settings)
    }

    fn build<S: Store + 'static>(
        store: Arc<S>,
        push: Arc<dyn NodePush>,
        probe: Option<Arc<dyn PortProbe>>,
        settings: EngineSettings,
    ) -> Self {
        let hierarchy = Hierarchy::new(store.clone());
        let cascade = LimitCascade::new(hierarchy.clone(), store.clone());

        let mut ports = PortAllocator::new(store.clone(), store.clone(), settings.reservation_ttl);
        if let Some(probe) = probe {
            ports = ports.with_probe(probe);
        }

        let queue = TaskQueue::new(store.clone(), push, settings.task_stale_after);
        let orchestrator = DeploymentOrchestrator::new(
            store.clone(),
            store.clone(),
            hierarchy.clone(),
            ports.clone(),
            queue.clone(),
        );

        Self {
            hierarchy,
            cascade,
            ports,
            queue,
            orchestrator,
            nodes: store,
            settings,
        }
    }

    /// Adds a node to the registry.
    pub async fn register_node(
        &self,
        name: impl Into<String>,
        port_ranges: PortRanges,
    ) -> Result<Node, DbError> {
        let node = Node::new(name, port_ranges);
        self.nodes.insert_node(&node).await?;
        info!(node_id = %node.id, name = %node.name, "Node registered");
        Ok(node)
    }

    /// The node and whether it polled within the reachability window.
    pub async fn node_status(&self, node_id: &NodeId) -> Result<Option<(Node, bool)>, DbError> {
        let Some(node) = self.nodes.get_node(node_id).await? else {
            return Ok(None);
        };
        let reachable = node.is_reachable(Utc::now(), self.settings.node_reachable_within);
        Ok(Some((node, reachable)))
    }

    /// A node's poll: records that it was seen, then claims its deliverable
    /// tasks. `None` when the node is unknown.
    pub async fn poll_tasks(
        &self,
        node_id: &NodeId,
    ) -> Result<Option<Vec<TaskEnvelope>>, DeployError> {
        if !self.nodes.touch_node(node_id, Utc::now()).await? {
            return Ok(None);
        }
        Ok(Some(self.queue.fetch_pending(node_id).await?))
    }
}
