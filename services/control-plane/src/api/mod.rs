//! HTTP API handlers and routing.

pub mod error;
mod health;
pub mod json;
pub mod request_context;
mod v1;

use axum::{
    http::{header, HeaderName, Method},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::state::AppState;

/// Create the main API router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static(request_context::REQUEST_ID_HEADER),
            HeaderName::from_static(request_context::ACTOR_ID_HEADER),
            HeaderName::from_static(request_context::ACTOR_TYPE_HEADER),
        ])
        .allow_origin(Any);

    let request_id = HeaderName::from_static(request_context::REQUEST_ID_HEADER);

    Router::new()
        // Health endpoints
        .merge(health::routes())
        // API v1 routes
        .nest("/v1", v1::routes())
        // Middleware (outermost last)
        .layer(PropagateRequestIdLayer::new(request_id.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(request_id, MakeRequestUuid))
        .layer(cors)
        // Application state
        .with_state(state)
}
