//! Standalone batch job handlers: create and query.

use std::time::Instant;

use axum::Json;
use axum::extract::{Path, State};
use uuid::Uuid;

use weft_core::engine::BatchJobConfig;
use weft_types::batch::BatchJob;

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// POST /api/v1/batch-jobs - Create a batch job.
///
/// The response includes the job's callback secret for distribution to the
/// external workers reporting into it.
pub async fn create_batch_job(
    State(state): State<AppState>,
    Json(config): Json<BatchJobConfig>,
) -> Result<Json<ApiResponse<BatchJob>>, AppError> {
    let started = Instant::now();
    let job = state.jobs.create_job(config).await?;
    Ok(ApiResponse::success(job, started))
}

/// GET /api/v1/batch-jobs/{id} - Fetch a batch job.
pub async fn get_batch_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<ApiResponse<BatchJob>>, AppError> {
    let started = Instant::now();
    let job = state.jobs.get_job(&job_id).await?;
    Ok(ApiResponse::success(job, started))
}
