//! Run lifecycle handlers: start, status, cancel.

use std::time::Instant;

use axum::Json;
use axum::extract::{Path, State};
use serde_json::Value;
use uuid::Uuid;

use weft_types::run::Run;

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// POST /api/v1/workflows/{id}/runs - Start a run with the body as input.
///
/// The response includes the run's callback secret; the application is
/// responsible for distributing it to whichever actors will report results.
pub async fn start_run(
    State(state): State<AppState>,
    Path(workflow_id): Path<Uuid>,
    Json(input): Json<Value>,
) -> Result<Json<ApiResponse<Run>>, AppError> {
    let started = Instant::now();
    let run = state.engine.start_run(&workflow_id, input).await?;
    tracing::info!(run_id = %run.id, workflow_id = %workflow_id, "run started");
    Ok(ApiResponse::success(run, started))
}

/// GET /api/v1/runs/{id} - Fetch run status.
pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<ApiResponse<Run>>, AppError> {
    let started = Instant::now();
    let run = state.engine.run_status(&run_id).await?;
    Ok(ApiResponse::success(run, started))
}

/// POST /api/v1/runs/{id}/cancel - Cancel a run.
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<ApiResponse<Run>>, AppError> {
    let started = Instant::now();
    let run = state.engine.cancel_run(&run_id).await?;
    Ok(ApiResponse::success(run, started))
}
