//! JSON request bodies that reject with problem documents.

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, OptionalFromRequest, Request};
use axum::Json;
use serde::de::DeserializeOwned;

use crate::api::error::ApiError;
use crate::api::request_context::REQUEST_ID_HEADER;

/// [`Json`] whose rejections are `invalid_request_body` problem documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApiJson<T>(pub T);

fn request_id(req: &Request) -> Option<String> {
    req.headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn rejected(rejection: JsonRejection, request_id: Option<String>) -> ApiError {
    let err = ApiError::bad_request("invalid_request_body", rejection.body_text());
    match request_id {
        Some(id) => err.with_request_id(id),
        None => err,
    }
}

impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let request_id = request_id(&req);
        <Json<T> as FromRequest<S>>::from_request(req, state)
            .await
            .map(|Json(value)| Self(value))
            .map_err(|rejection| rejected(rejection, request_id))
    }
}

impl<T, S> OptionalFromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Option<Self>, Self::Rejection> {
        let request_id = request_id(&req);
        <Json<T> as OptionalFromRequest<S>>::from_request(req, state)
            .await
            .map(|body| body.map(|Json(value)| Self(value)))
            .map_err(|rejection| rejected(rejection, request_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, StatusCode};
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct CountBody {
        count: u32,
    }

    fn request(body: &str) -> Request {
        axum::http::Request::builder()
            .header(header::CONTENT_TYPE, "application/json")
            .header(REQUEST_ID_HEADER, "req-7")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_accepts_valid_body() {
        let req = request(r#"{"count": 3}"#);
        let ApiJson(body) = <ApiJson<CountBody> as FromRequest<()>>::from_request(req, &())
            .await
            .unwrap();
        assert_eq!(body.count, 3);
    }

    #[tokio::test]
    async fn test_rejects_with_problem_document() {
        let req = request(r#"{"count": -5}"#);
        let err = <ApiJson<CountBody> as FromRequest<()>>::from_request(req, &())
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.problem.code, "invalid_request_body");
        assert_eq!(err.problem.request_id, "req-7");
    }

    #[tokio::test]
    async fn test_missing_optional_body_is_none() {
        let req = axum::http::Request::builder().body(Body::empty()).unwrap();
        let body = <ApiJson<CountBody> as OptionalFromRequest<()>>::from_request(req, &())
            .await
            .unwrap();
        assert!(body.is_none());
    }
}
