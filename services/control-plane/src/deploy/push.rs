//! Best-effort live push to connected nodes.
//!
//! Pushing only shortens delivery latency. Every pushed task is also a
//! durable row the node picks up on its next poll, so callers log push
//! failures and move on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use berth_events::NodeMessage;
use berth_id::NodeId;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Outbound messages buffered per connection before sends start failing.
const CONNECTION_BUFFER: usize = 64;

#[derive(Debug, Error)]
pub enum PushError {
    #[error("node {0} has no open connection")]
    NotConnected(NodeId),

    #[error("connection to node {0} is closed")]
    Closed(NodeId),

    #[error("connection to node {0} is backlogged")]
    Backlogged(NodeId),

    #[error("failed to encode push message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// `sendToNode`: fire-and-forget delivery over a node's live connection.
#[async_trait]
pub trait NodePush: Send + Sync {
    async fn send_to_node(&self, node_id: &NodeId, message: &NodeMessage) -> Result<(), PushError>;
}

struct Connection {
    id: u64,
    tx: mpsc::Sender<String>,
}

/// Registry of open node WebSockets.
///
/// A node holds at most one connection; a reconnect replaces the previous
/// sender, and the old socket's teardown does not evict the new one.
#[derive(Default)]
pub struct WsHub {
    connections: Mutex<HashMap<NodeId, Connection>>,
    next_id: AtomicU64,
}

impl WsHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection and returns its handle and the receiving end
    /// the socket task drains.
    pub fn register(&self, node_id: NodeId) -> (u64, mpsc::Receiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CONNECTION_BUFFER);
        let replaced = self
            .lock()
            .insert(node_id, Connection { id, tx })
            .is_some();
        debug!(node_id = %node_id, connection = id, replaced, "Node connection registered");
        (id, rx)
    }

    /// Removes the connection if it is still the registered one.
    pub fn unregister(&self, node_id: &NodeId, connection: u64) {
        let mut connections = self.lock();
        if connections.get(node_id).is_some_and(|c| c.id == connection) {
            connections.remove(node_id);
            debug!(node_id = %node_id, connection, "Node connection unregistered");
        }
    }

    pub fn is_connected(&self, node_id: &NodeId) -> bool {
        self.lock().contains_key(node_id)
    }

    pub fn connected_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<NodeId, Connection>> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl NodePush for WsHub {
    async fn send_to_node(&self, node_id: &NodeId, message: &NodeMessage) -> Result<(), PushError> {
        let text = serde_json::to_string(message)?;
        let tx = self
            .lock()
            .get(node_id)
            .map(|c| c.tx.clone())
            .ok_or(PushError::NotConnected(*node_id))?;

        tx.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PushError::Backlogged(*node_id),
            mpsc::error::TrySendError::Closed(_) => PushError::Closed(*node_id),
        })
    }
}
