//! Application error type mapping to HTTP status codes and envelope format.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use weft_core::definition::DefinitionError;
use weft_core::engine::{BatchJobError, EngineError};
use weft_types::error::RepositoryError;

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// Engine errors (run lifecycle, callbacks, joins).
    Engine(EngineError),
    /// Workflow definition/validation errors.
    Definition(DefinitionError),
    /// Batch job errors.
    BatchJob(BatchJobError),
    /// Authentication failure.
    Unauthorized(String),
    /// Validation error raised at the HTTP boundary.
    Validation(String),
    /// Resource not found.
    NotFound(String),
    /// Generic internal error.
    Internal(String),
}

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        AppError::Engine(e)
    }
}

impl From<DefinitionError> for AppError {
    fn from(e: DefinitionError) -> Self {
        AppError::Definition(e)
    }
}

impl From<BatchJobError> for AppError {
    fn from(e: BatchJobError) -> Self {
        AppError::BatchJob(e)
    }
}

impl From<RepositoryError> for AppError {
    fn from(e: RepositoryError) -> Self {
        AppError::Internal(e.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Engine(EngineError::WorkflowNotFound)
            | AppError::Engine(EngineError::RunNotFound) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND", self_message(&self))
            }
            AppError::Engine(EngineError::UnknownStep(step)) => (
                StatusCode::NOT_FOUND,
                "STEP_NOT_FOUND",
                format!("step '{step}' not found"),
            ),
            AppError::Engine(EngineError::Unauthorized) => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                "callback authentication failed".to_string(),
            ),
            AppError::Engine(EngineError::WorkflowInactive(name)) => (
                StatusCode::CONFLICT,
                "WORKFLOW_INACTIVE",
                format!("workflow '{name}' is inactive and cannot be started"),
            ),
            AppError::Engine(e) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "ENGINE_ERROR", e.to_string())
            }
            AppError::Definition(e) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", e.to_string())
            }
            AppError::BatchJob(BatchJobError::NotFound) => (
                StatusCode::NOT_FOUND,
                "BATCH_JOB_NOT_FOUND",
                "batch job not found".to_string(),
            ),
            AppError::BatchJob(BatchJobError::Unauthorized) => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                "callback authentication failed".to_string(),
            ),
            AppError::BatchJob(e) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "BATCH_JOB_ERROR", e.to_string())
            }
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg.clone()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg.clone())
            }
        };

        let body = json!({
            "data": null,
            "meta": {
                "request_id": uuid::Uuid::now_v7().to_string(),
                "timestamp": chrono::Utc::now().to_rfc3339(),
            },
            "errors": [{
                "code": code,
                "message": message,
            }]
        });

        (
            status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}

fn self_message(err: &AppError) -> String {
    match err {
        AppError::Engine(e) => e.to_string(),
        AppError::Definition(e) => e.to_string(),
        AppError::BatchJob(e) => e.to_string(),
        AppError::Unauthorized(m)
        | AppError::Validation(m)
        | AppError::NotFound(m)
        | AppError::Internal(m) => m.clone(),
    }
}
