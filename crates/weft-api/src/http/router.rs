//! Axum router configuration with middleware.
//!
//! All routes are under `/api/v1/`. Middleware: CORS, request tracing.

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

/// Build the complete API router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Workflows
        .route(
            "/workflows",
            post(handlers::workflow::create_workflow).get(handlers::workflow::list_workflows),
        )
        .route("/workflows/{id}", get(handlers::workflow::get_workflow))
        .route(
            "/workflows/{id}/diagram/decode",
            post(handlers::workflow::decode_workflow_diagram),
        )
        .route(
            "/workflows/{id}/diagram/encode",
            get(handlers::workflow::encode_workflow_diagram),
        )
        // Runs
        .route("/workflows/{id}/runs", post(handlers::run::start_run))
        .route("/runs/{id}", get(handlers::run::get_run))
        .route("/runs/{id}/cancel", post(handlers::run::cancel_run))
        // Callbacks
        .route(
            "/runs/{run_id}/steps/{step_id}/callback",
            post(handlers::callback::run_step_callback),
        )
        // Batch jobs
        .route(
            "/batch-jobs",
            post(handlers::batch_job::create_batch_job),
        )
        .route("/batch-jobs/{id}", get(handlers::batch_job::get_batch_job))
        .route(
            "/batch-jobs/{id}/callback",
            post(handlers::callback::batch_job_callback),
        )
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
