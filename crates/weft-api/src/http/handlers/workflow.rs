//! Workflow definition handlers: save, list, get, and the diagram compiler
//! surface.

use std::time::Instant;

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use weft_core::definition;
use weft_core::diagram::{decode_diagram, encode_diagram};
use weft_core::repository::run::RunStore;
use weft_types::workflow::Workflow;

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// POST /api/v1/workflows - Save a workflow document.
///
/// Accepts canonical or legacy shapes; the ingestion boundary normalizes
/// (`mode` -> type, `branches` -> connections) and repairs missing/duplicate
/// step ids before the write.
pub async fn create_workflow(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<ApiResponse<Workflow>>, AppError> {
    let started = Instant::now();
    let workflow = definition::parse_json(body)?;
    state.store.save_workflow(&workflow).await?;
    tracing::info!(
        workflow_id = %workflow.id,
        name = workflow.name.as_str(),
        steps = workflow.steps.len(),
        "workflow saved"
    );
    Ok(ApiResponse::success(workflow, started))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub include_inactive: bool,
}

/// GET /api/v1/workflows - List workflows. Inactive workflows are excluded
/// unless `?include_inactive=true`.
pub async fn list_workflows(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<ApiResponse<Vec<Workflow>>>, AppError> {
    let started = Instant::now();
    let workflows = state.store.list_workflows(params.include_inactive).await?;
    Ok(ApiResponse::success(workflows, started))
}

/// GET /api/v1/workflows/{id} - Fetch one workflow.
pub async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Workflow>>, AppError> {
    let started = Instant::now();
    let workflow = state
        .store
        .get_workflow(&id)
        .await?
        .ok_or_else(|| AppError::NotFound("workflow not found".to_string()))?;
    Ok(ApiResponse::success(workflow, started))
}

#[derive(Debug, Deserialize)]
pub struct DiagramBody {
    pub diagram: String,
}

/// POST /api/v1/workflows/{id}/diagram/decode - Replace a workflow's steps
/// with the graph decoded from diagram text.
///
/// The decoded graph passes through the same repair/validation pass as any
/// other save; the original text is kept for round-tripping.
pub async fn decode_workflow_diagram(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<DiagramBody>,
) -> Result<Json<ApiResponse<Workflow>>, AppError> {
    let started = Instant::now();
    let mut workflow = state
        .store
        .get_workflow(&id)
        .await?
        .ok_or_else(|| AppError::NotFound("workflow not found".to_string()))?;

    let mut steps = decode_diagram(&body.diagram);
    definition::repair_step_ids(&mut steps);
    workflow.steps = steps;
    workflow.diagram = Some(body.diagram);
    workflow.updated_at = chrono::Utc::now();
    definition::validate_workflow(&workflow)?;
    state.store.save_workflow(&workflow).await?;
    tracing::info!(
        workflow_id = %workflow.id,
        steps = workflow.steps.len(),
        "diagram decoded into workflow"
    );
    Ok(ApiResponse::success(workflow, started))
}

/// GET /api/v1/workflows/{id}/diagram/encode - Encode a workflow's steps as
/// diagram text.
pub async fn encode_workflow_diagram(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    let started = Instant::now();
    let workflow = state
        .store
        .get_workflow(&id)
        .await?
        .ok_or_else(|| AppError::NotFound("workflow not found".to_string()))?;
    let diagram = encode_diagram(&workflow.steps);
    Ok(ApiResponse::success(
        serde_json::json!({ "diagram": diagram }),
        started,
    ))
}
