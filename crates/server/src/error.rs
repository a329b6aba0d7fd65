//! API error types.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use ferry_mirror::{ErrorContext, MirrorError};
use serde::Serialize;

/// API error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
    /// Structured details for domain errors (model ids, scan state, ...).
    #[serde(skip_serializing_if = "ErrorContext::is_empty")]
    pub context: ErrorContext,
}

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Mirror(#[from] MirrorError),
}

impl ApiError {
    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::Internal(_) => "internal_error",
            Self::Unavailable(_) => "unavailable",
            Self::Mirror(e) => match e {
                MirrorError::Forbidden { .. } => "forbidden",
                MirrorError::BadRequest { .. } => "bad_request",
                MirrorError::NotFound { .. } => "not_found",
                MirrorError::Internal { .. } => "internal_error",
                MirrorError::Infra { .. } => "infra_error",
            },
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Mirror(e) => match e {
                MirrorError::Forbidden { .. } => StatusCode::FORBIDDEN,
                MirrorError::BadRequest { .. } => StatusCode::BAD_REQUEST,
                MirrorError::NotFound { .. } => StatusCode::NOT_FOUND,
                MirrorError::Internal { .. } | MirrorError::Infra { .. } => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }

    fn context(&self) -> ErrorContext {
        match self {
            Self::Mirror(e) if e.is_domain() => e.context().clone(),
            _ => ErrorContext::new(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "Request failed");
        }
        let body = ErrorResponse {
            code: self.code().to_string(),
            message: self.to_string(),
            context: self.context(),
        };
        (status, Json(body)).into_response()
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;
