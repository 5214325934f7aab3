//! Fan-in boundary evaluation and aggregate construction.
//!
//! The decision logic here is shared verbatim by workflow `join` steps and
//! standalone batch jobs -- the counting/threshold semantics exist exactly
//! once. Firing itself is the caller's job and must go through the store's
//! compare-and-set so a join fires at most once per instance.

use serde_json::{Value, json};
use weft_types::batch::{BatchCounters, BatchJob};
use weft_types::run::ExecutionUnit;
use weft_types::step::{StepConfig, ThresholdMissPolicy};

// ---------------------------------------------------------------------------
// JoinBoundary
// ---------------------------------------------------------------------------

/// Boundary conditions controlling when and how a fan-in fires.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinBoundary {
    /// Fire as soon as this many outcomes are recorded, even without a
    /// completion signal or a reached expected count.
    pub min_count: Option<u32>,
    /// Required success percentage (default 100).
    pub min_success_percent: f64,
    /// Maximum wait before the timeout branch applies.
    pub max_wait_ms: Option<u64>,
    /// Whether timeout is a failure or a partial-success continuation.
    pub fail_on_timeout: bool,
    /// Flag for manual intervention instead of auto-failing on a missed
    /// threshold.
    pub manual_review_on_miss: bool,
}

impl JoinBoundary {
    /// Extract the boundary from a join step's configuration.
    /// Returns `None` for any other config variant.
    pub fn from_join_config(config: &StepConfig) -> Option<Self> {
        let StepConfig::Join {
            min_count,
            min_success_percent,
            max_wait_ms,
            fail_on_timeout,
            on_threshold_miss,
            ..
        } = config
        else {
            return None;
        };
        Some(Self {
            min_count: *min_count,
            min_success_percent: min_success_percent.unwrap_or(100.0),
            max_wait_ms: *max_wait_ms,
            fail_on_timeout: *fail_on_timeout,
            manual_review_on_miss: *on_threshold_miss == ThresholdMissPolicy::ManualReview,
        })
    }

    /// Boundary for a standalone batch job.
    pub fn from_job(job: &BatchJob) -> Self {
        Self {
            min_count: None,
            min_success_percent: job.min_success_percent,
            max_wait_ms: job.max_wait_ms,
            fail_on_timeout: job.fail_on_timeout,
            manual_review_on_miss: job.requires_manual_review,
        }
    }
}

// ---------------------------------------------------------------------------
// BoundaryDecision
// ---------------------------------------------------------------------------

/// What the aggregator should do right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryDecision {
    /// Nothing to do yet; keep accumulating.
    Wait,
    /// Fire as a success.
    Success,
    /// Fire as a failure (threshold missed).
    Failure,
    /// Threshold missed but the policy demotes failure to human review.
    ManualReview,
    /// Max wait elapsed; continue with whatever was aggregated.
    TimeoutPartial,
    /// Max wait elapsed; fail.
    TimeoutFailure,
}

impl BoundaryDecision {
    /// Whether the decision continues the run (as opposed to failing or
    /// parking it).
    pub fn is_continuation(&self) -> bool {
        matches!(self, BoundaryDecision::Success | BoundaryDecision::TimeoutPartial)
    }
}

/// Re-evaluate a batch against its boundary.
///
/// Called on every counter mutation and by the external timer. The batch is
/// considered closed when the source declared completion, the expected count
/// was reached, or the optional minimum outcome count is met; a closed batch
/// fires by success rate, an open one only by timeout.
pub fn evaluate_boundary(
    counters: &BatchCounters,
    boundary: &JoinBoundary,
    elapsed_ms: Option<u64>,
) -> BoundaryDecision {
    let min_count_met = boundary
        .min_count
        .is_some_and(|min| counters.outcome_count() >= min);
    let closed = counters.is_complete || counters.count_satisfied() || min_count_met;

    if closed {
        if counters.success_percent() + f64::EPSILON >= boundary.min_success_percent {
            return BoundaryDecision::Success;
        }
        if boundary.manual_review_on_miss {
            return BoundaryDecision::ManualReview;
        }
        return BoundaryDecision::Failure;
    }

    if let (Some(max_wait), Some(elapsed)) = (boundary.max_wait_ms, elapsed_ms) {
        if elapsed >= max_wait {
            return if boundary.fail_on_timeout {
                BoundaryDecision::TimeoutFailure
            } else {
                BoundaryDecision::TimeoutPartial
            };
        }
    }

    BoundaryDecision::Wait
}

// ---------------------------------------------------------------------------
// Aggregate result
// ---------------------------------------------------------------------------

/// Build the aggregate payload a fired join hands to whatever follows it.
pub fn build_aggregate(
    counters: &BatchCounters,
    units: &[ExecutionUnit],
    decision: BoundaryDecision,
) -> Value {
    let outcomes: Vec<Value> = units
        .iter()
        .map(|u| {
            json!({
                "unit_id": u.id,
                "index": u.loop_index,
                "status": u.status,
                "output": u.output,
                "error": u.error,
            })
        })
        .collect();

    json!({
        "outcomes": outcomes,
        "received": counters.received_count,
        "expected": counters.expected_count,
        "processed": counters.processed_count,
        "failed": counters.failed_count,
        "success_percent": counters.success_percent(),
        "timed_out": matches!(
            decision,
            BoundaryDecision::TimeoutPartial | BoundaryDecision::TimeoutFailure
        ),
        "partial": decision == BoundaryDecision::TimeoutPartial,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
