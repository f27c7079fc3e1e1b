//! Health check endpoints.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// "ok" or "degraded".
    pub status: String,
    pub service: String,
    pub version: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub components: Option<ComponentHealth>,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ComponentHealth {
    pub database: ComponentStatus,
    /// Nodes holding a live push connection.
    pub connected_nodes: usize,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ComponentStatus {
    /// "ok", "in_memory" or "unavailable".
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/livez", get(livez))
}

/// Liveness: the process is up. Dependencies are not checked.
async fn healthz() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "control-plane".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        components: None,
    })
}

/// Readiness: 503 when the database is configured but unreachable.
async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let database = match state.db() {
        Some(db) => match db.health_check().await {
            Ok(()) => ComponentStatus {
                status: "ok".to_string(),
                message: None,
            },
            Err(e) => ComponentStatus {
                status: "unavailable".to_string(),
                message: Some(e.to_string()),
            },
        },
        None => ComponentStatus {
            status: "in_memory".to_string(),
            message: None,
        },
    };
    let ready = database.status != "unavailable";

    let response = HealthResponse {
        status: if ready { "ok" } else { "degraded" }.to_string(),
        service: "control-plane".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        components: Some(ComponentHealth {
            database,
            connected_nodes: state.hub().connected_count(),
        }),
    };

    if ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

async fn livez() -> impl IntoResponse {
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_healthz_returns_ok() {
        let response = healthz().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_livez_returns_ok() {
        let response = livez().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
