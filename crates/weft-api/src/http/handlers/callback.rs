//! The callback endpoint: external actors report progress/results here.
//!
//! Authentication accepts either the run's bearer secret
//! (`Authorization: Bearer <secret>`) or an HMAC-SHA256 body signature
//! (`X-Weft-Signature-256: sha256=<hex>`) keyed by the same secret. Control
//! signals travel in headers or payload fields:
//!
//! - `X-Weft-Expected-Count` -- declared expected total
//! - `X-Weft-Batch-Complete` -- explicit "no more items" signal
//! - `X-Weft-Idempotency-Key` -- delivery deduplication key

use std::time::Instant;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use serde_json::Value;
use uuid::Uuid;

use weft_core::engine::{CallbackAck, CallbackRequest};
use weft_infra::http::secret::verify_signature_with_prefix;

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// How the caller authenticated.
enum CallbackAuth {
    /// Bearer secret to be compared by the engine.
    Bearer(String),
    /// Body signature already verified at this boundary.
    Verified,
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn header_u32(headers: &HeaderMap, name: &str) -> Option<u32> {
    header_str(headers, name).and_then(|v| v.parse().ok())
}

fn header_bool(headers: &HeaderMap, name: &str) -> Option<bool> {
    header_str(headers, name).and_then(|v| v.parse().ok())
}

/// Authenticate a delivery against the known secret. Signature verification
/// happens here (it needs the raw body); bearer comparison is deferred to
/// the engine so it stays ahead of every state mutation.
fn authenticate(headers: &HeaderMap, body: &[u8], secret: &str) -> Result<CallbackAuth, AppError> {
    if let Some(signature) = header_str(headers, "x-weft-signature-256") {
        verify_signature_with_prefix(secret.as_bytes(), body, signature)
            .map_err(|_| AppError::Unauthorized("signature verification failed".to_string()))?;
        return Ok(CallbackAuth::Verified);
    }
    if let Some(auth) = header_str(headers, "authorization") {
        return Ok(CallbackAuth::Bearer(auth.to_string()));
    }
    Err(AppError::Unauthorized(
        "missing Authorization or X-Weft-Signature-256 header".to_string(),
    ))
}

fn build_request(headers: &HeaderMap, body: &[u8]) -> CallbackRequest {
    // Best-effort body parse; raw bytes become null if not valid JSON.
    let payload: Value = serde_json::from_slice(body).unwrap_or(Value::Null);
    CallbackRequest::from_parts(
        payload,
        header_u32(headers, "x-weft-expected-count"),
        header_bool(headers, "x-weft-batch-complete"),
        header_str(headers, "x-weft-idempotency-key").map(String::from),
    )
}

/// POST /api/v1/runs/{run_id}/steps/{step_id}/callback - Report results for
/// a run+step.
pub async fn run_step_callback(
    State(state): State<AppState>,
    Path((run_id, step_id)): Path<(Uuid, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ApiResponse<CallbackAck>>, AppError> {
    let started = Instant::now();

    // The signature path needs the run's secret before the engine is
    // involved; a missing run is a not-found either way.
    let run = state.engine.run_status(&run_id).await?;
    let auth = authenticate(&headers, &body, &run.callback_secret)?;
    let request = build_request(&headers, &body);

    let presented = match &auth {
        CallbackAuth::Bearer(token) => Some(token.as_str()),
        CallbackAuth::Verified => None,
    };
    let ack = state
        .engine
        .handle_callback(&run_id, &step_id, presented, request)
        .await?;

    tracing::debug!(
        run_id = %run_id,
        step_id = step_id.as_str(),
        received = ack.received_count,
        complete = ack.complete,
        "callback ingested"
    );
    Ok(ApiResponse::success(ack, started))
}

/// POST /api/v1/batch-jobs/{id}/callback - Report results for a standalone
/// batch job. Same contract as the run-step endpoint.
pub async fn batch_job_callback(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ApiResponse<CallbackAck>>, AppError> {
    let started = Instant::now();

    let job = state.jobs.get_job(&job_id).await?;
    let auth = authenticate(&headers, &body, &job.callback_secret)?;
    let request = build_request(&headers, &body);

    let presented = match &auth {
        CallbackAuth::Bearer(token) => Some(token.as_str()),
        CallbackAuth::Verified => None,
    };
    let ack = state
        .jobs
        .handle_callback(&job_id, presented, request)
        .await?;
    Ok(ApiResponse::success(ack, started))
}
