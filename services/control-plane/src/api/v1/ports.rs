//! Port endpoints.
//!
//! - GET/POST/DELETE /v1/applications/{app_id}/ports
//! - POST /v1/reservations
//! - GET/DELETE /v1/reservations/{reservation_id}
//! - POST /v1/reservations/{reservation_id}/attach
//! - POST /v1/reservations/{reservation_id}/require

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use berth_id::{AppId, NodeId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::parse_path;
use crate::api::error::ApiError;
use crate::api::json::ApiJson;
use crate::api::request_context::RequestContext;
use crate::model::PortOwner;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/applications/{app_id}/ports",
            get(list_application_ports)
                .post(allocate_port)
                .delete(release_ports),
        )
        .route("/reservations", post(reserve_ports))
        .route(
            "/reservations/{reservation_id}",
            get(get_reservation).delete(release_reservation),
        )
        .route("/reservations/{reservation_id}/attach", post(attach_reservation))
        .route("/reservations/{reservation_id}/require", post(require_reserved))
}

#[derive(Debug, Deserialize)]
pub struct AllocatePortRequest {
    pub node_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ReservePortsRequest {
    pub node_id: String,
    #[serde(default = "default_count")]
    pub count: usize,
    /// Caller-chosen reservation ID; generated when absent.
    #[serde(default)]
    pub reservation_id: Option<Uuid>,
}

fn default_count() -> usize {
    1
}

#[derive(Debug, Deserialize)]
pub struct AttachReservationRequest {
    pub node_id: String,
    pub application_id: String,
}

#[derive(Debug, Deserialize)]
pub struct RequireReservedRequest {
    pub node_id: String,
    pub needed: usize,
}

#[derive(Debug, Serialize)]
pub struct PortsResponse {
    pub ports: Vec<u16>,
}

#[derive(Debug, Serialize)]
pub struct ReservationResponse {
    pub reservation_id: Uuid,
    pub ports: Vec<u16>,
}

#[derive(Debug, Serialize)]
pub struct CountResponse {
    pub count: u64,
}

/// GET /v1/applications/{app_id}/ports
async fn list_application_ports(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path(app_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let app_id: AppId = parse_path(&app_id, "app_id", &ctx.request_id)?;

    let ports = state
        .engine()
        .ports
        .ports_for_application(&app_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;

    Ok(Json(PortsResponse { ports }))
}

/// POST /v1/applications/{app_id}/ports
async fn allocate_port(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path(app_id): Path<String>,
    ApiJson(req): ApiJson<AllocatePortRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let app_id: AppId = parse_path(&app_id, "app_id", &ctx.request_id)?;
    let node_id: NodeId = parse_path(&req.node_id, "node_id", &ctx.request_id)?;

    let port = state
        .engine()
        .ports
        .allocate(&node_id, PortOwner::Application(app_id))
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;

    Ok((StatusCode::CREATED, Json(PortsResponse { ports: vec![port] })))
}

/// DELETE /v1/applications/{app_id}/ports
async fn release_ports(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path(app_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let app_id: AppId = parse_path(&app_id, "app_id", &ctx.request_id)?;

    let count = state
        .engine()
        .ports
        .release_port(&app_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;

    Ok(Json(CountResponse { count }))
}

/// POST /v1/reservations
async fn reserve_ports(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    ApiJson(req): ApiJson<ReservePortsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let node_id: NodeId = parse_path(&req.node_id, "node_id", &ctx.request_id)?;
    let reservation_id = req.reservation_id.unwrap_or_else(Uuid::new_v4);

    let ports = state
        .engine()
        .ports
        .reserve_ports(&node_id, req.count, reservation_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;

    Ok((
        StatusCode::CREATED,
        Json(ReservationResponse {
            reservation_id,
            ports,
        }),
    ))
}

/// GET /v1/reservations/{reservation_id}
async fn get_reservation(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path(reservation_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let reservation_id: Uuid = parse_path(&reservation_id, "reservation_id", &ctx.request_id)?;

    let ports = state
        .engine()
        .ports
        .ports_for_reservation(reservation_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;
    if ports.is_empty() {
        return Err(ApiError::not_found(
            "reservation_not_found",
            format!("Reservation {reservation_id} holds no ports"),
        )
        .with_request_id(&ctx.request_id));
    }

    Ok(Json(ReservationResponse {
        reservation_id,
        ports,
    }))
}

/// DELETE /v1/reservations/{reservation_id}
async fn release_reservation(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path(reservation_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let reservation_id: Uuid = parse_path(&reservation_id, "reservation_id", &ctx.request_id)?;

    let count = state
        .engine()
        .ports
        .release_reservation(reservation_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;

    Ok(Json(CountResponse { count }))
}

/// POST /v1/reservations/{reservation_id}/attach
async fn attach_reservation(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path(reservation_id): Path<String>,
    ApiJson(req): ApiJson<AttachReservationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let reservation_id: Uuid = parse_path(&reservation_id, "reservation_id", &ctx.request_id)?;
    let node_id: NodeId = parse_path(&req.node_id, "node_id", &ctx.request_id)?;
    let app_id: AppId = parse_path(&req.application_id, "application_id", &ctx.request_id)?;

    let count = state
        .engine()
        .ports
        .attach_reservation(reservation_id, &node_id, &app_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;

    Ok(Json(CountResponse { count }))
}

/// POST /v1/reservations/{reservation_id}/require
///
/// 409 when the reservation holds fewer than `needed` ports on the node.
async fn require_reserved(
    State(state): State<AppState>,
    RequestContext(ctx): RequestContext,
    Path(reservation_id): Path<String>,
    ApiJson(req): ApiJson<RequireReservedRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let reservation_id: Uuid = parse_path(&reservation_id, "reservation_id", &ctx.request_id)?;
    let node_id: NodeId = parse_path(&req.node_id, "node_id", &ctx.request_id)?;

    let ports = state
        .engine()
        .ports
        .require_reserved(reservation_id, &node_id, req.needed)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(&ctx.request_id))?;

    Ok(Json(ReservationResponse {
        reservation_id,
        ports,
    }))
}
