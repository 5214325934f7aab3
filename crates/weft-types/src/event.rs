//! Run lifecycle events broadcast to UI/daemon subscribers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Events published by the engine over the broadcast bus.
///
/// The bus is the engine's "notification channel" collaborator: dashboards
/// subscribe to push live updates, nothing in the engine depends on anyone
/// listening.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: Uuid,
        workflow_name: String,
    },
    RunCompleted {
        run_id: Uuid,
        workflow_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
    },
    RunFailed {
        run_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failed_step_id: Option<String>,
        error: String,
    },
    RunCancelled {
        run_id: Uuid,
    },
    StepStarted {
        run_id: Uuid,
        step_id: String,
        step_type: String,
    },
    StepCompleted {
        run_id: Uuid,
        step_id: String,
    },
    StepFailed {
        run_id: Uuid,
        step_id: String,
        error: String,
    },
    /// Fan-out spawned `count` units for a step.
    UnitsSpawned {
        run_id: Uuid,
        step_id: String,
        count: u32,
    },
    /// Batch counters moved for a key.
    BatchProgress {
        run_id: Uuid,
        step_id: String,
        received: u32,
        processed: u32,
        failed: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected: Option<u32>,
    },
    /// A join fired (exactly once per join instance).
    JoinFired {
        run_id: Uuid,
        step_id: String,
        success: bool,
    },
    /// A join missed its threshold and was flagged instead of auto-failed.
    JoinManualReview {
        run_id: Uuid,
        step_id: String,
    },
    /// A standalone batch job missed its threshold and was flagged.
    BatchJobManualReview {
        job_id: Uuid,
    },
}
