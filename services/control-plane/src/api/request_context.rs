//! Caller context extracted from HTTP requests.
//!
//! Authentication happens in front of the control plane; the gateway
//! forwards the caller's identity in headers.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use berth_events::ActorType;
use berth_id::RequestId;

use crate::api::error::ApiError;
use crate::context::Context;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const ACTOR_ID_HEADER: &str = "x-actor-id";
pub const ACTOR_TYPE_HEADER: &str = "x-actor-type";

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Wraps [`Context`] so handlers can take it as an extractor.
#[derive(Debug, Clone)]
pub struct RequestContext(pub Context);

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let request_id = header_string(&parts.headers, REQUEST_ID_HEADER)
            .unwrap_or_else(|| RequestId::new().to_string());

        let actor_type = match header_string(&parts.headers, ACTOR_TYPE_HEADER) {
            Some(raw) => raw.parse::<ActorType>().map_err(|e| {
                ApiError::bad_request("invalid_actor_type", e.to_string())
                    .with_request_id(request_id.clone())
            })?,
            None => ActorType::System,
        };
        let actor_id = header_string(&parts.headers, ACTOR_ID_HEADER)
            .unwrap_or_else(|| actor_type.as_str().to_string());

        Ok(Self(
            Context::new(actor_type, actor_id).with_request_id(request_id),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(request: Request<()>) -> Result<Context, ApiError> {
        let (mut parts, ()) = request.into_parts();
        RequestContext::from_request_parts(&mut parts, &())
            .await
            .map(|RequestContext(ctx)| ctx)
    }

    #[tokio::test]
    async fn test_defaults_to_system_actor() {
        let ctx = extract(Request::new(())).await.unwrap();
        assert_eq!(ctx.actor_type, ActorType::System);
        assert_eq!(ctx.actor_id, "system");
        assert!(!ctx.request_id.is_empty());
    }

    #[tokio::test]
    async fn test_reads_forwarded_identity() {
        let request = Request::builder()
            .header(REQUEST_ID_HEADER, "req-1")
            .header(ACTOR_TYPE_HEADER, "node")
            .header(ACTOR_ID_HEADER, " node_01 ")
            .body(())
            .unwrap();
        let ctx = extract(request).await.unwrap();
        assert_eq!(ctx.request_id, "req-1");
        assert_eq!(ctx.actor_type, ActorType::Node);
        assert_eq!(ctx.actor_id, "node_01");
    }

    #[tokio::test]
    async fn test_rejects_unknown_actor_type() {
        let request = Request::builder()
            .header(REQUEST_ID_HEADER, "req-2")
            .header(ACTOR_TYPE_HEADER, "robot")
            .body(())
            .unwrap();
        let err = extract(request).await.unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::BAD_REQUEST);
        assert_eq!(err.problem.code, "invalid_actor_type");
        assert_eq!(err.problem.request_id, "req-2");
    }
}
