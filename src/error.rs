//! Crate-wide error taxonomy, mapped to an OpenAI-style error body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Error taxonomy. Each variant carries enough context to render a useful
/// `{"error": {...}}` body without leaking internal detail.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),

    #[error("dependency error: {0}")]
    DependencyLogic(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("worker transient error: {0}")]
    WorkerTransient(String),

    #[error("worker poison error: {0}")]
    WorkerPoison(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AppError {
    fn status_and_type(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "invalid_request_error"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found_error"),
            AppError::DependencyUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "dependency_unavailable_error")
            }
            AppError::DependencyLogic(_) => (StatusCode::BAD_GATEWAY, "dependency_error"),
            AppError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout_error"),
            AppError::WorkerTransient(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "worker_transient_error")
            }
            AppError::WorkerPoison(_) => (StatusCode::INTERNAL_SERVER_ERROR, "worker_poison_error"),
            AppError::Other(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }

    /// Whether a worker should retry the job that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::DependencyUnavailable(_) | AppError::Timeout(_) | AppError::WorkerTransient(_)
        )
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.status_and_type();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::warn!(error = %self, "request rejected");
        }
        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": error_type,
                "param": serde_json::Value::Null,
                "code": serde_json::Value::Null,
            }
        }));
        (status, body).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
