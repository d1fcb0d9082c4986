use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::services::orchestrator::OrchestratorError;

/// Error type for HTTP handlers.
///
/// Produces a JSON body `{"error": ..., "code": ...}`. A job owned by
/// someone else is reported exactly like a missing one.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),
}

impl From<garde::Report> for ApiError {
    fn from(report: garde::Report) -> Self {
        ApiError::Validation(report.to_string().trim_end().to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::Orchestrator(err) => match err {
                OrchestratorError::QueueFull => (
                    StatusCode::TOO_MANY_REQUESTS,
                    "QUEUE_FULL",
                    err.to_string(),
                ),
                OrchestratorError::NotFound | OrchestratorError::Forbidden => (
                    StatusCode::NOT_FOUND,
                    "NOT_FOUND",
                    "Job not found".to_string(),
                ),
                OrchestratorError::Validation(msg) => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
                }
                OrchestratorError::StorageFailure(e) => {
                    tracing::error!(error = %e, "Job store failure");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "INTERNAL_ERROR",
                        "An internal error occurred".to_string(),
                    )
                }
            },
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg.clone()),
        };

        (status, axum::Json(json!({ "error": message, "code": code }))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
