//! Node error types: the crate error and the API error surface.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Node-internal error type.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("store error: {0}")]
    Store(#[from] courier_blockstore::StoreError),

    #[error("core error: {0}")]
    Core(#[from] courier_core::Error),

    #[error("signer error: {0}")]
    Signer(#[from] courier_signer::SignerError),

    #[error("scheduler rpc error: {0}")]
    Rpc(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for NodeError {
    fn from(e: reqwest::Error) -> Self {
        Self::Rpc(e.to_string())
    }
}

/// Result type for node operations.
pub type NodeResult<T> = std::result::Result<T, NodeError>;

/// API error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

/// API error type for the node's HTTP surface.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<NodeError> for ApiError {
    fn from(e: NodeError) -> Self {
        match e {
            NodeError::Store(err) if err.is_not_found() => Self::NotFound(err.to_string()),
            NodeError::Core(err) => Self::BadRequest(err.to_string()),
            NodeError::Signer(_) => Self::BadRequest("signature verification failed".to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<courier_blockstore::StoreError> for ApiError {
    fn from(e: courier_blockstore::StoreError) -> Self {
        ApiError::from(NodeError::from(e))
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

/// Result type for node API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;
