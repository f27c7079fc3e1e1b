//! Node API endpoints.
//!
//! Registration, task polling and the live push socket. These are internal
//! APIs called by node agents, not tenant-facing.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use berth_events::TaskEnvelope;
use berth_id::NodeId;
use berth_networking::{PortRange, PortRanges};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::parse_path;
use crate::api::error::ApiError;
use crate::api::json::ApiJson;
use crate::api::request_context::RequestContext;
use crate::deploy::WsHub;
use crate::model::Node;
use crate::state::AppState;

/// Create node routes.
///
/// Nodes are top-level infrastructure resources: /v1/nodes
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", post(register_node))
        .route("/{node_id}", get(get_node))
        .route("/{node_id}/tasks", get(poll_tasks))
        .route("/{node_id}/tasks/{task_id}/ack", post(acknowledge_task))
        .route("/{node_id}/port-ranges", put(set_port_ranges))
        .route("/{node_id}/connect", get(connect))
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct RegisterNodeRequest {
    pub name: String,
    #[serde(default)]
    pub port_ranges: Vec<PortRange>,
}

#[derive(Debug, Deserialize)]
pub struct SetPortRangesRequest {
    pub port_ranges: Vec<PortRange>,
}

#[derive(Debug, Serialize)]
pub struct NodeResponse {
    #[serde(flatten)]
    pub node: Node,
    /// Polled within the reachability window.
    pub reachable: bool,
    /// Holds an open push socket to this control plane.
    pub connected: bool,
}

#[derive(Debug, Serialize)]
pub struct PollResponse {
    pub tasks: Vec<TaskEnvelope>,
}

fn parse_ranges(ranges: Vec<PortRange>, request_id: &str) -> Result<PortRanges, ApiError> {
    PortRanges::new(ranges).map_err(|e| {
        ApiError::bad_request("invalid_port_ranges", e.to_string()).with_request_id(request_id)
    })
}

fn node_not_found(node_id: &NodeId, request_id: &str) -> ApiError {
    ApiError::not_found("node_not_found", format!("Node {node_id} not found"))
        .with_request_id(request_id)
}

// =============================================================================
// Handlers
// =============================================================================

/// POST /v1/nodes
async fn register_node(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    ApiJson(req): ApiJson<RegisterNodeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let ranges = parse_ranges(req.port_ranges, &ctx.request_id)?;

    let node = state
        .engine()
        .register_node(req.name, ranges)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, request_id = %ctx.request_id, "Failed to register node");
            ApiError::internal("internal_error", "Failed to register node")
                .with_request_id(&ctx.request_id)
        })?;

    Ok((
        StatusCode::CREATED,
        Json(NodeResponse {
            node,
            reachable: false,
            connected: false,
        }),
    ))
}

/// GET /v1/nodes/{node_id}
async fn get_node(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path(node_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let node_id: NodeId = parse_path(&node_id, "node_id", &ctx.request_id)?;

    let status = state.engine().node_status(&node_id).await.map_err(|e| {
        tracing::error!(error = %e, request_id = %ctx.request_id, node_id = %node_id, "Failed to get node");
        ApiError::internal("internal_error", "Failed to get node").with_request_id(&ctx.request_id)
    })?;
    let Some((node, reachable)) = status else {
        return Err(node_not_found(&node_id, &ctx.request_id));
    };

    Ok(Json(NodeResponse {
        connected: state.hub().is_connected(&node_id),
        node,
        reachable,
    }))
}

/// GET /v1/nodes/{node_id}/tasks
///
/// Claims the node's deliverable tasks. Every envelope may be a redelivery.
async fn poll_tasks(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path(node_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let node_id: NodeId = parse_path(&node_id, "node_id", &ctx.request_id)?;

    let tasks = state
        .engine()
        .poll_tasks(&node_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?
        .ok_or_else(|| node_not_found(&node_id, &ctx.request_id))?;

    Ok(Json(PollResponse { tasks }))
}

/// POST /v1/nodes/{node_id}/tasks/{task_id}/ack
async fn acknowledge_task(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path((node_id, task_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let node_id: NodeId = parse_path(&node_id, "node_id", &ctx.request_id)?;

    state
        .engine()
        .queue
        .acknowledge(&node_id, &task_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;

    Ok(StatusCode::NO_CONTENT)
}

/// PUT /v1/nodes/{node_id}/port-ranges
async fn set_port_ranges(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path(node_id): Path<String>,
    ApiJson(req): ApiJson<SetPortRangesRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let node_id: NodeId = parse_path(&node_id, "node_id", &ctx.request_id)?;
    let ranges = parse_ranges(req.port_ranges, &ctx.request_id)?;

    state
        .engine()
        .ports
        .set_port_ranges(&node_id, &ranges)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;

    Ok(StatusCode::NO_CONTENT)
}

/// GET /v1/nodes/{node_id}/connect
///
/// Upgrades to a WebSocket over which the control plane pushes
/// `NodeMessage` JSON text frames. Messages from the node are ignored.
async fn connect(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path(node_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ApiError> {
    let node_id: NodeId = parse_path(&node_id, "node_id", &ctx.request_id)?;

    let known = state.engine().node_status(&node_id).await.map_err(|e| {
        tracing::error!(error = %e, request_id = %ctx.request_id, node_id = %node_id, "Failed to load node");
        ApiError::internal("internal_error", "Failed to load node").with_request_id(&ctx.request_id)
    })?;
    if known.is_none() {
        return Err(node_not_found(&node_id, &ctx.request_id));
    }

    let hub = state.hub().clone();
    Ok(ws.on_upgrade(move |socket| handle_node_socket(socket, hub, node_id)))
}

async fn handle_node_socket(socket: WebSocket, hub: Arc<WsHub>, node_id: NodeId) {
    let (connection, mut outbound) = hub.register(node_id);
    info!(node_id = %node_id, connection, "Node connected");

    let (mut sender, mut receiver) = socket.split();

    let to_node = async {
        while let Some(text) = outbound.recv().await {
            if let Err(e) = sender.send(Message::Text(text.into())).await {
                warn!(error = ?e, node_id = %node_id, "Failed to push to node");
                break;
            }
        }
    };

    let from_node = async {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    debug!(error = ?e, node_id = %node_id, "WebSocket error");
                    break;
                }
            }
        }
    };

    // Either side ending closes the connection.
    tokio::select! {
        _ = to_node => {}
        _ = from_node => {}
    }

    hub.unregister(&node_id, connection);
    close_outbound(outbound);
    info!(node_id = %node_id, connection, "Node disconnected");
}

/// Drops anything still buffered for a closed socket; those tasks are
/// redelivered by polling.
fn close_outbound(mut outbound: mpsc::Receiver<String>) {
    outbound.close();
    let mut dropped = 0usize;
    while outbound.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        debug!(dropped, "Discarded undelivered push messages");
    }
}
