//! Scheduler error types: the crate error and the API error surface.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Scheduler-internal error type.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("metadata error: {0}")]
    Metadata(#[from] courier_metadata::MetadataError),

    #[error("core error: {0}")]
    Core(#[from] courier_core::Error),

    #[error("node rpc error: {0}")]
    NodeRpc(String),
}

impl From<reqwest::Error> for SchedulerError {
    fn from(e: reqwest::Error) -> Self {
        Self::NodeRpc(e.to_string())
    }
}

/// Result type for scheduler operations.
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

/// API error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

/// API error type for the scheduler's HTTP surface.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::Metadata(err) if err.is_not_found() => Self::NotFound(err.to_string()),
            SchedulerError::Core(err) => Self::BadRequest(err.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<courier_metadata::MetadataError> for ApiError {
    fn from(e: courier_metadata::MetadataError) -> Self {
        ApiError::from(SchedulerError::from(e))
    }
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            code: self.code().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Result type for scheduler API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;
