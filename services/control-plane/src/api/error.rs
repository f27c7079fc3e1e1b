//! RFC 7807 problem documents.

use std::fmt::Display;

use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use crate::cascade::CascadeError;
use crate::deploy::DeployError;
use crate::error::ErrorKind;
use crate::hierarchy::HierarchyError;
use crate::ports::PortError;

#[derive(Debug, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    pub code: String,
    pub request_id: String,
    pub retryable: bool,
}

impl ProblemDetails {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let code = code.into();
        let title = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            r#type: format!("https://berth.dev/problems/{code}"),
            title,
            status: status.as_u16(),
            detail: detail.into(),
            instance: None,
            code,
            request_id: "unknown".to_string(),
            retryable: false,
        }
    }

    fn set_request_id(&mut self, request_id: impl Into<String>) {
        let request_id = request_id.into();
        self.request_id = request_id.clone();
        if self.instance.is_none() {
            self.instance = Some(request_id);
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    fn with_status(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        let problem = Box::new(ProblemDetails::new(status, code, message));
        Self { status, problem }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::NOT_FOUND, code, message)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::CONFLICT, code, message)
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        let mut err = Self::with_status(StatusCode::INTERNAL_SERVER_ERROR, code, message);
        err.problem.retryable = true;
        err
    }

    /// Maps a classified engine failure. Internal details are logged, not
    /// returned.
    pub fn from_kind(kind: ErrorKind, err: &dyn Display) -> Self {
        match kind {
            ErrorKind::Configuration => Self::bad_request("invalid_configuration", err.to_string()),
            ErrorKind::Precondition => Self::conflict("precondition_failed", err.to_string()),
            ErrorKind::Exhaustion => Self::with_status(
                StatusCode::SERVICE_UNAVAILABLE,
                "resource_exhausted",
                err.to_string(),
            ),
            ErrorKind::NotFound => Self::not_found("not_found", err.to_string()),
            ErrorKind::Internal => {
                error!(error = %err, "Internal error");
                Self::internal("internal_error", "internal error")
            }
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.problem.set_request_id(request_id);
        self
    }
}

macro_rules! from_domain_error {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for ApiError {
                fn from(err: $ty) -> Self {
                    Self::from_kind(err.kind(), &err)
                }
            }
        )*
    };
}

from_domain_error!(HierarchyError, CascadeError, PortError, DeployError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}
