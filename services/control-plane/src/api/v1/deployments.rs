//! Deployment endpoints.
//!
//! Tenant-facing:
//! - POST /v1/applications/{app_id}/deployments
//! - PUT /v1/applications/{app_id}/node
//! - GET /v1/deployments/{deployment_id}
//! - POST /v1/deployments/{deployment_id}/cancel
//! - POST /v1/deployments/{deployment_id}/rollback
//!
//! Node-facing:
//! - POST /v1/deployments/{deployment_id}/progress
//! - POST /v1/deployments/{deployment_id}/completion

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use berth_events::{CompletionReport, ProgressReport};
use berth_id::{AppId, DeploymentId, NodeId};
use serde::{Deserialize, Serialize};

use super::parse_path;
use crate::api::error::ApiError;
use crate::api::json::ApiJson;
use crate::api::request_context::RequestContext;
use crate::deploy::CancelOutcome;
use crate::model::{Deployment, DeploymentTask};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/applications/{app_id}/deployments", post(create_deployment))
        .route("/applications/{app_id}/node", put(assign_node))
        .route("/deployments/{deployment_id}", get(get_deployment))
        .route("/deployments/{deployment_id}/tasks", get(list_tasks))
        .route("/deployments/{deployment_id}/cancel", post(cancel_deployment))
        .route("/deployments/{deployment_id}/rollback", post(rollback_deployment))
        .route("/deployments/{deployment_id}/progress", post(report_progress))
        .route("/deployments/{deployment_id}/completion", post(report_completion))
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateDeploymentRequest {
    /// Overrides the commit recorded on the application's source.
    #[serde(default)]
    pub commit_sha: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AssignNodeRequest {
    /// `null` clears the assignment.
    pub node_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListTasksResponse {
    pub items: Vec<DeploymentTask>,
}

/// POST /v1/applications/{app_id}/deployments
async fn create_deployment(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path(app_id): Path<String>,
    body: Option<ApiJson<CreateDeploymentRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let app_id: AppId = parse_path(&app_id, "app_id", &ctx.request_id)?;
    let req = body.map(|ApiJson(req)| req).unwrap_or_default();

    let deployment = state
        .engine()
        .orchestrator
        .create(&app_id, req.commit_sha, &ctx)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;

    Ok((StatusCode::CREATED, Json(deployment)))
}

/// PUT /v1/applications/{app_id}/node
async fn assign_node(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path(app_id): Path<String>,
    ApiJson(req): ApiJson<AssignNodeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let app_id: AppId = parse_path(&app_id, "app_id", &ctx.request_id)?;
    let node_id: Option<NodeId> = req
        .node_id
        .as_deref()
        .map(|raw| parse_path(raw, "node_id", &ctx.request_id))
        .transpose()?;

    state
        .engine()
        .orchestrator
        .assign_node(&app_id, node_id.as_ref(), &ctx)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;

    Ok(StatusCode::NO_CONTENT)
}

/// GET /v1/deployments/{deployment_id}
async fn get_deployment(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path(deployment_id): Path<String>,
) -> Result<Json<Deployment>, ApiError> {
    let deployment_id: DeploymentId = parse_path(&deployment_id, "deployment_id", &ctx.request_id)?;

    let deployment = state
        .engine()
        .orchestrator
        .get(&deployment_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;

    Ok(Json(deployment))
}

/// GET /v1/deployments/{deployment_id}/tasks
async fn list_tasks(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path(deployment_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let deployment_id: DeploymentId = parse_path(&deployment_id, "deployment_id", &ctx.request_id)?;
    let engine = state.engine();

    engine
        .orchestrator
        .get(&deployment_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;
    let items = engine
        .queue
        .tasks_for_deployment(&deployment_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;

    Ok(Json(ListTasksResponse { items }))
}

/// POST /v1/deployments/{deployment_id}/cancel
async fn cancel_deployment(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path(deployment_id): Path<String>,
) -> Result<Json<Deployment>, ApiError> {
    let deployment_id: DeploymentId = parse_path(&deployment_id, "deployment_id", &ctx.request_id)?;

    let outcome = state
        .engine()
        .orchestrator
        .cancel(&deployment_id, &ctx)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;

    match outcome {
        CancelOutcome::Cancelled(deployment) => Ok(Json(deployment)),
        CancelOutcome::NotCancellable(deployment) => Err(ApiError::conflict(
            "deployment_not_cancellable",
            format!("Deployment is {} and cannot be cancelled", deployment.status),
        )
        .with_request_id(&ctx.request_id)),
    }
}

/// POST /v1/deployments/{deployment_id}/rollback
async fn rollback_deployment(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path(deployment_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let deployment_id: DeploymentId = parse_path(&deployment_id, "deployment_id", &ctx.request_id)?;

    let deployment = state
        .engine()
        .orchestrator
        .rollback(&deployment_id, &ctx)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;

    Ok((StatusCode::CREATED, Json(deployment)))
}

/// POST /v1/deployments/{deployment_id}/progress
async fn report_progress(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path(deployment_id): Path<String>,
    ApiJson(report): ApiJson<ProgressReport>,
) -> Result<Json<Deployment>, ApiError> {
    let deployment_id: DeploymentId = parse_path(&deployment_id, "deployment_id", &ctx.request_id)?;

    let deployment = state
        .engine()
        .orchestrator
        .report_progress(&deployment_id, &report)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;

    Ok(Json(deployment))
}

/// POST /v1/deployments/{deployment_id}/completion
///
/// Repeated reports return the deployment unchanged.
async fn report_completion(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path(deployment_id): Path<String>,
    ApiJson(report): ApiJson<CompletionReport>,
) -> Result<Json<Deployment>, ApiError> {
    let deployment_id: DeploymentId = parse_path(&deployment_id, "deployment_id", &ctx.request_id)?;

    let deployment = state
        .engine()
        .orchestrator
        .report_completion(&deployment_id, &report)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;

    Ok(Json(deployment))
}
