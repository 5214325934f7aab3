//! Standalone batch job aggregation.
//!
//! A context-free specialization of the fan-in aggregator for bulk external
//! work not anchored to a workflow step: same counters, same
//! threshold/timeout semantics (the decision logic in `engine::join` is
//! shared, not duplicated), plus a `requires_manual_review` escape hatch when
//! the success threshold is missed but the operator does not want automatic
//! hard failure.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;
use weft_types::batch::{BatchCounters, BatchDelta, BatchJob, BatchJobStatus, BatchKey};
use weft_types::error::RepositoryError;
use weft_types::event::RunEvent;

use crate::event::EventBus;
use crate::repository::run::{ExpectedOutcome, RunStore};

use super::ingest::{CallbackAck, CallbackRequest, normalize_items, secret_matches};
use super::join::{BoundaryDecision, JoinBoundary, build_aggregate, evaluate_boundary};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from batch job operations.
#[derive(Debug, thiserror::Error)]
pub enum BatchJobError {
    #[error("batch job not found")]
    NotFound,

    #[error("callback authentication failed")]
    Unauthorized,

    #[error("store error: {0}")]
    Repository(#[from] RepositoryError),
}

// ---------------------------------------------------------------------------
// BatchJobConfig
// ---------------------------------------------------------------------------

/// Boundary configuration for a new batch job.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchJobConfig {
    pub name: String,
    /// Declared total, when known up front.
    #[serde(default)]
    pub expected_count: Option<u32>,
    /// Required success percentage (default 100).
    #[serde(default)]
    pub min_success_percent: Option<f64>,
    #[serde(default)]
    pub max_wait_ms: Option<u64>,
    /// Whether timeout fails the job (default) or closes it partially.
    #[serde(default = "default_true")]
    pub fail_on_timeout: bool,
    /// Flag for review instead of failing when the threshold is missed.
    #[serde(default)]
    pub requires_manual_review: bool,
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// BatchJobManager
// ---------------------------------------------------------------------------

/// Creates and settles standalone batch jobs.
pub struct BatchJobManager<S> {
    store: Arc<S>,
    bus: EventBus,
}

impl<S> Clone for BatchJobManager<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            bus: self.bus.clone(),
        }
    }
}

impl<S: RunStore> BatchJobManager<S> {
    pub fn new(store: S, bus: EventBus) -> Self {
        Self {
            store: Arc::new(store),
            bus,
        }
    }

    /// Create a job and initialize its counters.
    pub async fn create_job(&self, config: BatchJobConfig) -> Result<BatchJob, BatchJobError> {
        let min_success_percent = config.min_success_percent.unwrap_or(100.0);
        let job = BatchJob {
            id: Uuid::now_v7(),
            name: config.name,
            min_success_percent,
            max_wait_ms: config.max_wait_ms,
            fail_on_timeout: config.fail_on_timeout,
            requires_manual_review: config.requires_manual_review,
            callback_secret: format!("bj_{}", Uuid::new_v4().simple()),
            status: BatchJobStatus::Accumulating,
            result: None,
            created_at: Utc::now(),
            completed_at: None,
        };

        let counters = BatchCounters {
            expected_count: config.expected_count,
            min_success_percent,
            ..BatchCounters::default()
        };
        self.store
            .init_batch(&BatchKey::for_job(job.id), counters)
            .await?;
        self.store.create_batch_job(&job).await?;
        tracing::info!(job_id = %job.id, name = job.name.as_str(), "batch job created");
        Ok(job)
    }

    /// Fetch a job by id.
    pub async fn get_job(&self, job_id: &Uuid) -> Result<BatchJob, BatchJobError> {
        self.store
            .get_batch_job(job_id)
            .await?
            .ok_or(BatchJobError::NotFound)
    }

    /// Ingest a callback for a job. Same shapes, control signals, and
    /// idempotency semantics as the run-step callback endpoint.
    pub async fn handle_callback(
        &self,
        job_id: &Uuid,
        presented_secret: Option<&str>,
        request: CallbackRequest,
    ) -> Result<CallbackAck, BatchJobError> {
        let job = self.get_job(job_id).await?;
        if let Some(presented) = presented_secret {
            if !secret_matches(&job.callback_secret, presented) {
                return Err(BatchJobError::Unauthorized);
            }
        }
        let key = BatchKey::for_job(job.id);

        // Late delivery for a settled job: acknowledged as a no-op.
        if job.status != BatchJobStatus::Accumulating {
            let state = self.store.get_batch(&key).await?;
            return Ok(ack(state.map(|s| s.counters), true, false, Vec::new()));
        }

        if let Some(idem) = &request.idempotency_key {
            if !self.store.register_ingest_key(&key, idem).await? {
                let state = self.store.get_batch(&key).await?;
                return Ok(ack(state.map(|s| s.counters), false, true, Vec::new()));
            }
        }

        let mut warnings = Vec::new();
        if let Some(expected) = request.expected_count {
            if let ExpectedOutcome::AlreadyKnown(known) =
                self.store.declare_expected(&key, expected).await?
            {
                if known != expected {
                    warnings.push(format!(
                        "expected count {expected} conflicts with previously declared {known}; keeping {known}"
                    ));
                }
            }
        }

        let mut delta = BatchDelta::default();
        for item in normalize_items(&request.payload) {
            delta.apply_item(item.status.is_success());
        }

        let mut state = if delta.is_empty() {
            self.store.get_batch(&key).await?
        } else {
            Some(self.store.apply_batch_delta(&key, delta).await?)
        };
        if request.complete {
            state = Some(self.store.mark_batch_complete(&key).await?);
        }

        if let Some(s) = &state {
            self.bus.publish(RunEvent::BatchProgress {
                run_id: job.id,
                step_id: "job".to_string(),
                received: s.counters.received_count,
                processed: s.counters.processed_count,
                failed: s.counters.failed_count,
                expected: s.counters.expected_count,
            });
        }

        self.settle_if_bounded(&job).await?;

        let final_state = self.store.get_batch(&key).await?;
        let mut response = ack(final_state.map(|s| s.counters), false, false, warnings);
        response.complete |= self
            .store
            .get_batch_job(job_id)
            .await?
            .is_some_and(|j| j.status != BatchJobStatus::Accumulating);
        Ok(response)
    }

    /// Re-evaluate a job's boundary, typically from a timer after its
    /// `max_wait_ms`. Returns whether this call settled it.
    pub async fn reevaluate(&self, job_id: &Uuid) -> Result<bool, BatchJobError> {
        let job = self.get_job(job_id).await?;
        if job.status != BatchJobStatus::Accumulating {
            return Ok(false);
        }
        self.settle_if_bounded(&job).await
    }

    /// Evaluate the shared boundary logic and settle the job if it fired.
    /// Firing goes through the store's compare-and-set, so exactly one
    /// caller settles a job.
    async fn settle_if_bounded(&self, job: &BatchJob) -> Result<bool, BatchJobError> {
        let key = BatchKey::for_job(job.id);
        let Some(state) = self.store.get_batch(&key).await? else {
            return Ok(false);
        };
        let boundary = JoinBoundary::from_job(job);
        let elapsed_ms = (Utc::now() - job.created_at).num_milliseconds().max(0) as u64;
        let decision = evaluate_boundary(&state.counters, &boundary, Some(elapsed_ms));
        if decision == BoundaryDecision::Wait {
            return Ok(false);
        }
        if !self.store.try_mark_fired(&key).await? {
            return Ok(false);
        }

        let mut settled = job.clone();
        settled.status = match decision {
            BoundaryDecision::Success | BoundaryDecision::TimeoutPartial => {
                BatchJobStatus::Completed
            }
            BoundaryDecision::ManualReview => BatchJobStatus::ManualReview,
            BoundaryDecision::Failure | BoundaryDecision::TimeoutFailure => BatchJobStatus::Failed,
            BoundaryDecision::Wait => unreachable!("wait filtered above"),
        };
        settled.result = Some(build_aggregate(&state.counters, &[], decision));
        settled.completed_at = Some(Utc::now());
        self.store.update_batch_job(&settled).await?;

        if settled.status == BatchJobStatus::ManualReview {
            self.bus
                .publish(RunEvent::BatchJobManualReview { job_id: settled.id });
            tracing::warn!(job_id = %settled.id, "batch job flagged for manual review");
        } else {
            tracing::info!(
                job_id = %settled.id,
                status = ?settled.status,
                processed = state.counters.processed_count,
                failed = state.counters.failed_count,
                "batch job settled"
            );
        }
        Ok(true)
    }
}

fn ack(
    counters: Option<BatchCounters>,
    no_op: bool,
    duplicate: bool,
    warnings: Vec<String>,
) -> CallbackAck {
    let counters = counters.unwrap_or_default();
    CallbackAck {
        received_count: counters.received_count,
        expected_count: counters.expected_count,
        processed_count: counters.processed_count,
        failed_count: counters.failed_count,
        complete: counters.is_complete || counters.count_satisfied(),
        duplicate,
        no_op,
        created_unit_ids: Vec::new(),
        warnings,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
