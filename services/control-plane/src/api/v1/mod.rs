//! API v1 routes.

mod deployments;
mod limits;
mod nodes;
mod ports;

use std::str::FromStr;

use axum::Router;

use crate::api::error::ApiError;
use crate::state::AppState;

/// Create API v1 routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .merge(limits::routes())
        .merge(deployments::routes())
        .merge(ports::routes())
        // Node-facing: poll, ack, reports and the push socket
        .nest("/nodes", nodes::routes())
}

/// Parses a path segment, rejecting it with `invalid_<what>`.
fn parse_path<T: FromStr>(raw: &str, what: &str, request_id: &str) -> Result<T, ApiError> {
    raw.parse().map_err(|_| {
        ApiError::bad_request(format!("invalid_{what}"), format!("Invalid {what} format"))
            .with_request_id(request_id)
    })
}
