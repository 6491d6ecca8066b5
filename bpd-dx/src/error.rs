//! Error types for bpd-dx

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Conflict (409) - e.g., cancelling an already-terminal execution
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Execution exists but has not reached a terminal state yet (409).
    /// Distinct from NotFound so "still running" is never confused with
    /// "never existed".
    #[error("Execution still running: {0}")]
    StillRunning(String),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error(transparent)]
    Other(#[from] anyhow::Error),

    /// bpd-common error
    #[error("Common error: {0}")]
    Common(#[from] bpd_common::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
            ApiError::StillRunning(msg) => (StatusCode::CONFLICT, "STILL_RUNNING", msg),
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                msg,
            ),
            ApiError::Io(ref err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "IO_ERROR",
                err.to_string(),
            ),
            ApiError::Other(ref err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                err.to_string(),
            ),
            // Validation and lookup failures from shared code surface
            // with the same codes as their API-native counterparts
            ApiError::Common(bpd_common::Error::InvalidInput(msg)) => {
                (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg)
            }
            ApiError::Common(bpd_common::Error::NotFound(msg)) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND", msg)
            }
            ApiError::Common(ref err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "COMMON_ERROR",
                err.to_string(),
            ),
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_errors_map_to_client_codes() {
        let response =
            ApiError::from(bpd_common::Error::InvalidInput("bad".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response =
            ApiError::from(bpd_common::Error::NotFound("gone".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response =
            ApiError::from(bpd_common::Error::Internal("broken".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
