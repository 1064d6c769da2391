//! Unified server error type.
//!
//! Every handler returns `Result<T, ServerError>`, which implements
//! [`axum::response::IntoResponse`] so errors are automatically converted
//! to a JSON-body HTTP response with an appropriate status code.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use forgepool_types::RuntimeError;
use serde_json::json;
use thiserror::Error;

/// All errors that can occur in the forgepool-server request lifecycle.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Propagated from forgepool-core's dispatch core.
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// The caller referenced a resource that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller sent an invalid or malformed request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Admin token missing or incorrect.
    #[error("unauthorized")]
    Unauthorized,

    /// An unclassified internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            ServerError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ServerError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
            ServerError::Runtime(e) => (runtime_status(e), e.to_string()),
            ServerError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m.clone()),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

fn runtime_status(e: &RuntimeError) -> StatusCode {
    match e {
        RuntimeError::NoBackendsAvailable
        | RuntimeError::NoMatchingBackend
        | RuntimeError::AllBackendsFailedModel { .. } => StatusCode::SERVICE_UNAVAILABLE,
        RuntimeError::Timeout { .. } | RuntimeError::Stagnation { .. } => StatusCode::GATEWAY_TIMEOUT,
        RuntimeError::ConfigRefused { .. } | RuntimeError::RegistryFileCorrupt { .. } => {
            StatusCode::BAD_REQUEST
        }
        RuntimeError::BackendNotFound(_) | RuntimeError::RequestNotFound(_) => StatusCode::NOT_FOUND,
        RuntimeError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<anyhow::Error> for ServerError {
    fn from(e: anyhow::Error) -> Self {
        ServerError::Internal(e.to_string())
    }
}
