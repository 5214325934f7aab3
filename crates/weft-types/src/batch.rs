//! Batch accumulation state for fan-out/fan-in and standalone batch jobs.
//!
//! Counters only move forward, and every mutation is attributable to a single
//! idempotently-deduplicated ingestion event. The `is_complete` flag is
//! distinct from "count reached": an explicit completion signal can close a
//! batch before the expected count is hit, and the expected count can arrive
//! after items have already streamed in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// BatchKey
// ---------------------------------------------------------------------------

/// The (run id, originating step id) pair that scopes a set of counters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchKey {
    pub run_id: Uuid,
    pub step_id: String,
}

impl BatchKey {
    pub fn new(run_id: Uuid, step_id: impl Into<String>) -> Self {
        Self {
            run_id,
            step_id: step_id.into(),
        }
    }

    /// Key for a standalone batch job (not anchored to a workflow step).
    pub fn for_job(job_id: Uuid) -> Self {
        Self {
            run_id: job_id,
            step_id: "job".to_string(),
        }
    }
}

impl std::fmt::Display for BatchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.run_id, self.step_id)
    }
}

// ---------------------------------------------------------------------------
// BatchCounters
// ---------------------------------------------------------------------------

/// Accumulation counters for one batch key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchCounters {
    /// Total the source will send, when known. Streaming sources may never
    /// declare one.
    pub expected_count: Option<u32>,
    /// Items accepted so far (not necessarily processed yet).
    pub received_count: u32,
    /// Items that completed successfully.
    pub processed_count: u32,
    /// Items that failed.
    pub failed_count: u32,
    /// Required success percentage for the batch to count as a success.
    pub min_success_percent: f64,
    /// Explicit "no more items will be sent" signal.
    pub is_complete: bool,
}

impl Default for BatchCounters {
    fn default() -> Self {
        Self {
            expected_count: None,
            received_count: 0,
            processed_count: 0,
            failed_count: 0,
            min_success_percent: 100.0,
            is_complete: false,
        }
    }
}

impl BatchCounters {
    /// Counters for a statically-spawned batch: the collection length is known
    /// up front, so `expected` is set immediately. `received` counts reports
    /// as they are ingested, so it starts at zero.
    pub fn static_spawn(count: u32, min_success_percent: f64) -> Self {
        Self {
            expected_count: Some(count),
            received_count: 0,
            processed_count: 0,
            failed_count: 0,
            min_success_percent,
            is_complete: false,
        }
    }

    /// Number of outcomes recorded so far.
    pub fn outcome_count(&self) -> u32 {
        self.processed_count + self.failed_count
    }

    /// Success percentage over recorded outcomes. 100 when there are none.
    pub fn success_percent(&self) -> f64 {
        let outcomes = self.outcome_count();
        if outcomes == 0 {
            return 100.0;
        }
        f64::from(self.processed_count) / f64::from(outcomes) * 100.0
    }

    /// Whether the declared expected count has been reached.
    pub fn count_satisfied(&self) -> bool {
        self.expected_count
            .is_some_and(|expected| self.received_count >= expected)
    }

    /// Whether the success rate meets the configured threshold.
    pub fn threshold_met(&self) -> bool {
        self.success_percent() + f64::EPSILON >= self.min_success_percent
    }

    /// Apply a monotonic increment.
    pub fn apply(&mut self, delta: BatchDelta) {
        self.received_count = self.received_count.saturating_add(delta.received);
        self.processed_count = self.processed_count.saturating_add(delta.processed);
        self.failed_count = self.failed_count.saturating_add(delta.failed);
    }

    /// Counter invariant: `processed + failed <= received`.
    pub fn is_consistent(&self) -> bool {
        self.outcome_count() <= self.received_count
    }
}

// ---------------------------------------------------------------------------
// BatchDelta
// ---------------------------------------------------------------------------

/// A single atomic counter increment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchDelta {
    pub received: u32,
    pub processed: u32,
    pub failed: u32,
}

impl BatchDelta {
    pub fn received(n: u32) -> Self {
        Self {
            received: n,
            ..Self::default()
        }
    }

    /// One ingested item report: counts both the arrival and its outcome.
    pub fn item(success: bool) -> Self {
        Self {
            received: 1,
            processed: u32::from(success),
            failed: u32::from(!success),
        }
    }

    /// Fold one item report into this delta.
    pub fn apply_item(&mut self, success: bool) {
        self.received += 1;
        if success {
            self.processed += 1;
        } else {
            self.failed += 1;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.received == 0 && self.processed == 0 && self.failed == 0
    }
}

// ---------------------------------------------------------------------------
// BatchState
// ---------------------------------------------------------------------------

/// Full per-batch state as held by the run store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchState {
    pub key: BatchKey,
    pub counters: BatchCounters,
    /// One-shot flag: set exactly once, by compare-and-set, when the join
    /// (or batch job) fires.
    pub fired: bool,
    /// When the batch was initialized.
    pub created_at: DateTime<Utc>,
}

impl BatchState {
    pub fn new(key: BatchKey, counters: BatchCounters) -> Self {
        Self {
            key,
            counters,
            fired: false,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Batch jobs
// ---------------------------------------------------------------------------

/// Status of a standalone batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchJobStatus {
    /// Still accepting items/outcomes.
    Accumulating,
    Completed,
    Failed,
    /// Success threshold missed and the operator opted out of auto-failure.
    ManualReview,
}

/// Bulk external work not anchored to a workflow step.
///
/// Counter state lives in the run store under `BatchKey::for_job(id)`; this
/// record carries the job's boundary configuration and terminal result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJob {
    /// UUIDv7 job ID.
    pub id: Uuid,
    /// Human-readable job name.
    pub name: String,
    /// Required success percentage (default 100).
    pub min_success_percent: f64,
    /// Maximum wait before the timeout branch applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_wait_ms: Option<u64>,
    /// Whether timeout is a failure or a partial continuation.
    pub fail_on_timeout: bool,
    /// Escape hatch: flag for review instead of failing on threshold miss.
    pub requires_manual_review: bool,
    /// Secret presented by callers reporting into this job.
    pub callback_secret: String,
    /// Current job status.
    pub status: BatchJobStatus,
    /// Aggregate result once the job closes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
