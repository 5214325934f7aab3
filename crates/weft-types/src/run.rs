//! Run and execution unit types.
//!
//! A `Run` is one execution instance of a workflow. An `ExecutionUnit` is one
//! spawned piece of work belonging to a run+step -- fan-out children always
//! carry their originating step ID so the aggregator can later select "all
//! units produced by step X".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::step::StepType;

// ---------------------------------------------------------------------------
// RunStatus
// ---------------------------------------------------------------------------

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// One execution instance of a workflow.
///
/// Only the run state machine may mutate `status`, `current_step_ids` and
/// `completed_step_ids`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// UUIDv7 run ID.
    pub id: Uuid,
    /// ID of the workflow being executed.
    pub workflow_id: Uuid,
    /// Workflow name (denormalized for display).
    pub workflow_name: String,
    /// Current run status.
    pub status: RunStatus,
    /// Steps presently awaiting completion.
    #[serde(default)]
    pub current_step_ids: Vec<String>,
    /// Steps that have completed.
    #[serde(default)]
    pub completed_step_ids: Vec<String>,
    /// Step that caused an unrecoverable failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step_id: Option<String>,
    /// Error message if the run failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Input payload the run was started with.
    pub input: Value,
    /// Outputs of completed steps, keyed by step ID. Routing conditions and
    /// template interpolation read from here.
    #[serde(default, skip_serializing_if = "std::collections::HashMap::is_empty")]
    pub step_outputs: std::collections::HashMap<String, Value>,
    /// Output payload produced at completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Per-run secret used to authenticate callbacks.
    pub callback_secret: String,
    /// Parent run, when this run was started by a `flow` step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<Uuid>,
    /// The `flow` step in the parent that started this run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_step_id: Option<String>,
    /// When the start request was accepted.
    pub created_at: DateTime<Utc>,
    /// When the first step began.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// UnitStatus
// ---------------------------------------------------------------------------

/// Status of an individual execution unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Pending,
    InProgress,
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl UnitStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UnitStatus::Completed | UnitStatus::Failed | UnitStatus::Cancelled
        )
    }
}

// ---------------------------------------------------------------------------
// ExecutionUnit
// ---------------------------------------------------------------------------

/// One spawned unit of work belonging to exactly one step of exactly one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionUnit {
    /// UUIDv7 unit ID.
    pub id: Uuid,
    /// Parent run.
    pub run_id: Uuid,
    /// Originating step.
    pub step_id: String,
    /// Parent unit for fan-out children.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_unit_id: Option<Uuid>,
    /// Mirrors the originating step's type.
    pub unit_type: StepType,
    /// Current unit status.
    pub status: UnitStatus,
    /// Input payload for this unit (the collection element, for fan-out).
    pub input: Value,
    /// Output reported for this unit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Error message if the unit failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Zero-based position in the fan-out collection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_index: Option<u32>,
    /// Total collection size at spawn time, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_total: Option<u32>,
    /// Variable name the element is bound to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_var: Option<String>,
    /// Child run for `flow` units.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_run_id: Option<Uuid>,
    /// When the unit was spawned. Also the wait-start for `join` units.
    pub created_at: DateTime<Utc>,
    /// When the unit reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionUnit {
    /// Build a fresh unit in `Pending` state.
    pub fn new(run_id: Uuid, step_id: impl Into<String>, unit_type: StepType, input: Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            run_id,
            step_id: step_id.into(),
            parent_unit_id: None,
            unit_type,
            status: UnitStatus::Pending,
            input,
            output: None,
            error: None,
            loop_index: None,
            loop_total: None,
            item_var: None,
            sub_run_id: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn run_status_terminality() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Paused.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn unit_status_terminality() {
        assert!(!UnitStatus::Pending.is_terminal());
        assert!(!UnitStatus::InProgress.is_terminal());
        assert!(!UnitStatus::Waiting.is_terminal());
        assert!(UnitStatus::Completed.is_terminal());
        assert!(UnitStatus::Failed.is_terminal());
        assert!(UnitStatus::Cancelled.is_terminal());
    }

    #[test]
    fn run_json_round_trip() {
        let run = Run {
            id: Uuid::now_v7(),
            workflow_id: Uuid::now_v7(),
            workflow_name: "digest".to_string(),
            status: RunStatus::Running,
            current_step_ids: vec!["gather".to_string()],
            completed_step_ids: vec!["start".to_string()],
            failed_step_id: None,
            error: None,
            input: json!({"q": "news"}),
            step_outputs: std::collections::HashMap::new(),
            output: None,
            callback_secret: "s3cret".to_string(),
            parent_run_id: None,
            parent_step_id: None,
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            completed_at: None,
        };
        let s = serde_json::to_string(&run).unwrap();
        let parsed: Run = serde_json::from_str(&s).unwrap();
        assert_eq!(parsed.status, RunStatus::Running);
        assert_eq!(parsed.current_step_ids, vec!["gather"]);
        assert_eq!(parsed.callback_secret, "s3cret");
    }

    #[test]
    fn execution_unit_carries_lineage() {
        let run_id = Uuid::now_v7();
        let parent = ExecutionUnit::new(run_id, "fan", StepType::Foreach, json!(null));
        let mut child = ExecutionUnit::new(run_id, "fan", StepType::Agent, json!("a"));
        child.parent_unit_id = Some(parent.id);
        child.loop_index = Some(0);
        child.loop_total = Some(3);

        let s = serde_json::to_string(&child).unwrap();
        let parsed: ExecutionUnit = serde_json::from_str(&s).unwrap();
        assert_eq!(parsed.parent_unit_id, Some(parent.id));
        assert_eq!(parsed.step_id, "fan");
        assert_eq!(parsed.loop_total, Some(3));
    }
}
