//! Limit endpoints.
//!
//! - GET /v1/entities/{entity_id}/limits
//! - PUT /v1/entities/{entity_id}/limits
//! - POST /v1/entities/{entity_id}/cascade
//! - PUT /v1/users/{user_id}/ceilings

use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use berth_id::UserId;
use berth_quota::{ConfiguredLimits, EffectiveLimits};
use serde::{Deserialize, Serialize};

use super::parse_path;
use crate::api::error::ApiError;
use crate::api::json::ApiJson;
use crate::api::request_context::RequestContext;
use crate::cascade::CascadeReport;
use crate::deploy::RedeployStats;
use crate::hierarchy::{EntityRef, Level};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/entities/{entity_id}/limits",
            get(get_limits).put(update_limits),
        )
        .route("/entities/{entity_id}/cascade", post(enforce_cascade))
        .route("/users/{user_id}/ceilings", put(update_ceilings))
}

#[derive(Debug, Serialize)]
pub struct LimitsResponse {
    pub entity_id: String,
    pub level: Level,
    /// `None` for users, whose ceilings are their effective limits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configured: Option<ConfiguredLimits>,
    pub effective: EffectiveLimits,
}

#[derive(Debug, Deserialize)]
pub struct UpdateLimitsRequest {
    pub limits: ConfiguredLimits,
    /// Redeploy running applications whose effective limits changed.
    #[serde(default)]
    pub redeploy: bool,
}

#[derive(Debug, Deserialize)]
pub struct UpdateCeilingsRequest {
    pub ceilings: EffectiveLimits,
    #[serde(default)]
    pub redeploy: bool,
}

#[derive(Debug, Serialize)]
pub struct CascadeResponse {
    pub root: String,
    pub updated_counts_by_level: BTreeMap<Level, usize>,
    pub report: CascadeReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redeploys: Option<RedeployStats>,
}

impl CascadeResponse {
    fn new(report: CascadeReport, redeploys: Option<RedeployStats>) -> Self {
        Self {
            root: report.root.to_string(),
            updated_counts_by_level: report.updated_counts_by_level(),
            report,
            redeploys,
        }
    }
}

/// GET /v1/entities/{entity_id}/limits
async fn get_limits(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path(entity_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let entity: EntityRef = parse_path(&entity_id, "entity_id", &ctx.request_id)?;
    let hierarchy = &state.engine().hierarchy;

    let effective = hierarchy
        .effective_limits(&entity)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;
    let configured = match entity.level() {
        Level::User => None,
        _ => Some(
            hierarchy
                .configured_limits(&entity)
                .await
                .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?,
        ),
    };

    Ok(Json(LimitsResponse {
        entity_id: entity.to_string(),
        level: entity.level(),
        configured,
        effective,
    }))
}

/// PUT /v1/entities/{entity_id}/limits
async fn update_limits(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path(entity_id): Path<String>,
    ApiJson(req): ApiJson<UpdateLimitsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let entity: EntityRef = parse_path(&entity_id, "entity_id", &ctx.request_id)?;
    let engine = state.engine();

    let report = engine
        .cascade
        .update_limits(&entity, &req.limits, &ctx)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;

    let redeploys = if req.redeploy {
        Some(engine.orchestrator.redeploy_changed(&report, &ctx).await)
    } else {
        None
    };
    Ok(Json(CascadeResponse::new(report, redeploys)))
}

/// POST /v1/entities/{entity_id}/cascade
async fn enforce_cascade(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path(entity_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let entity: EntityRef = parse_path(&entity_id, "entity_id", &ctx.request_id)?;

    let report = state
        .engine()
        .cascade
        .enforce(&entity, &ctx)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;

    Ok(Json(CascadeResponse::new(report, None)))
}

/// PUT /v1/users/{user_id}/ceilings
async fn update_ceilings(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path(user_id): Path<String>,
    ApiJson(req): ApiJson<UpdateCeilingsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id: UserId = parse_path(&user_id, "user_id", &ctx.request_id)?;
    let engine = state.engine();

    let report = engine
        .cascade
        .update_user_ceilings(&user_id, &req.ceilings, &ctx)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;

    let redeploys = if req.redeploy {
        Some(engine.orchestrator.redeploy_changed(&report, &ctx).await)
    } else {
        None
    };
    Ok(Json(CascadeResponse::new(report, redeploys)))
}
