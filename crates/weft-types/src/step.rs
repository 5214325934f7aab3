//! Step model: the closed set of step kinds and their configuration shapes.
//!
//! A step is one typed node in a workflow graph. `StepConfig` is an internally
//! tagged union keyed by `type`; every variant carries a flattened extra-field
//! bag so unknown configuration round-trips through encode/decode without
//! loss. Execution logic ignores the bag entirely.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// StepType
// ---------------------------------------------------------------------------

/// The kind of step in a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    /// Run entry point. Not reachable by connections.
    Trigger,
    /// An automated actor executes and reports a single result.
    Agent,
    /// A human must act.
    Manual,
    /// A request is sent to a third party; the step blocks until a callback.
    External,
    /// Outbound notification. Fire-and-forget unless `await_callback` is set.
    Webhook,
    /// Routes based on connection conditions evaluated against prior output.
    Decision,
    /// Fan-out: one execution unit per element of a collection.
    Foreach,
    /// Fan-in: aggregates outcomes of a referenced step's fan-out.
    Join,
    /// Delegates to a nested workflow as an opaque sub-run.
    Flow,
}

impl StepType {
    /// Lowercase snake_case name, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Trigger => "trigger",
            StepType::Agent => "agent",
            StepType::Manual => "manual",
            StepType::External => "external",
            StepType::Webhook => "webhook",
            StepType::Decision => "decision",
            StepType::Foreach => "foreach",
            StepType::Join => "join",
            StepType::Flow => "flow",
        }
    }

    /// Whether a step of this type waits for an external completion signal.
    pub fn awaits_callback(&self) -> bool {
        matches!(
            self,
            StepType::Agent | StepType::Manual | StepType::External
        )
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Directed edge to another step.
///
/// `condition` is an expression evaluated against the previous step's output;
/// `None` means default/unconditional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    /// Target step ID.
    pub to: String,
    /// Optional condition expression. `None` is the default branch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Optional display label for the edge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Connection {
    /// Unconditional connection to a step.
    pub fn to(target: impl Into<String>) -> Self {
        Self {
            to: target.into(),
            condition: None,
            label: None,
        }
    }

    /// Conditional connection to a step.
    pub fn when(target: impl Into<String>, condition: impl Into<String>) -> Self {
        Self {
            to: target.into(),
            condition: Some(condition.into()),
            label: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Policy enums
// ---------------------------------------------------------------------------

/// What a join does when the success threshold is missed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdMissPolicy {
    /// Fire the join as a failure (default).
    #[default]
    Fail,
    /// Flag for manual intervention instead of auto-failing.
    ManualReview,
}

// ---------------------------------------------------------------------------
// StepConfig
// ---------------------------------------------------------------------------

/// Step-specific configuration payload, internally tagged by `type`.
///
/// Every variant carries an `extra` bag of fields the execution logic does
/// not interpret but must preserve (forward compatibility).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepConfig {
    /// Run entry point. No configuration of its own.
    Trigger {
        #[serde(flatten)]
        extra: HashMap<String, Value>,
    },
    /// Automated actor.
    Agent {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        assignee: Option<String>,
        #[serde(flatten)]
        extra: HashMap<String, Value>,
    },
    /// Human task.
    Manual {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        instructions: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        assignee: Option<String>,
        #[serde(flatten)]
        extra: HashMap<String, Value>,
    },
    /// Outbound request that blocks the step until a callback arrives.
    External {
        url: String,
        #[serde(default = "default_method")]
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        headers: Option<HashMap<String, String>>,
        /// Body template with `{{ ... }}` interpolation.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        #[serde(flatten)]
        extra: HashMap<String, Value>,
    },
    /// Outbound notification. Completes on dispatch unless awaited.
    Webhook {
        url: String,
        #[serde(default = "default_method")]
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        headers: Option<HashMap<String, String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        /// When true, the step waits for a callback like `external`.
        #[serde(default)]
        await_callback: bool,
        #[serde(flatten)]
        extra: HashMap<String, Value>,
    },
    /// Routing step. Behavior is fully determined by the connection list
    /// plus this optional default fallback.
    Decision {
        /// Step ID to route to when no connection condition matches.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default_connection: Option<String>,
        #[serde(flatten)]
        extra: HashMap<String, Value>,
    },
    /// Fan-out over a collection located by a path expression.
    Foreach {
        /// Path into the previous step's output (e.g. `"result.items"`).
        /// Ignored when `streaming`.
        #[serde(default)]
        collection_path: String,
        /// Variable name each unit's element is bound to.
        #[serde(default = "default_item_var")]
        item_var: String,
        /// Safety cap override. Engine default is 100.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_items: Option<u32>,
        /// When true, no static collection exists: items (and their total)
        /// arrive entirely via callbacks.
        #[serde(default)]
        streaming: bool,
        #[serde(flatten)]
        extra: HashMap<String, Value>,
    },
    /// Fan-in over a referenced step's spawned units.
    Join {
        /// Step ID whose fan-out this join aggregates.
        source_step: String,
        /// Minimum number of outcomes before the join may fire.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_count: Option<u32>,
        /// Required success percentage (default 100).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_success_percent: Option<f64>,
        /// Maximum wait before the timeout branch applies.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_wait_ms: Option<u64>,
        /// Whether timeout is a failure or a partial-success continuation.
        #[serde(default = "default_true")]
        fail_on_timeout: bool,
        /// What to do when the success threshold is missed.
        #[serde(default)]
        on_threshold_miss: ThresholdMissPolicy,
        #[serde(flatten)]
        extra: HashMap<String, Value>,
    },
    /// Nested workflow invocation.
    Flow {
        /// Name or ID of the workflow to run.
        workflow: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
        #[serde(flatten)]
        extra: HashMap<String, Value>,
    },
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_item_var() -> String {
    "item".to_string()
}

fn default_true() -> bool {
    true
}

impl StepConfig {
    /// The step type this configuration belongs to.
    pub fn step_type(&self) -> StepType {
        match self {
            StepConfig::Trigger { .. } => StepType::Trigger,
            StepConfig::Agent { .. } => StepType::Agent,
            StepConfig::Manual { .. } => StepType::Manual,
            StepConfig::External { .. } => StepType::External,
            StepConfig::Webhook { .. } => StepType::Webhook,
            StepConfig::Decision { .. } => StepType::Decision,
            StepConfig::Foreach { .. } => StepType::Foreach,
            StepConfig::Join { .. } => StepType::Join,
            StepConfig::Flow { .. } => StepType::Flow,
        }
    }

    /// An empty configuration appropriate for the given step type.
    ///
    /// Used when decoding diagrams where a node declares only a shape and a
    /// label; required fields default to empty strings and are expected to be
    /// filled by annotations or metadata lines.
    pub fn empty_for(step_type: StepType) -> Self {
        match step_type {
            StepType::Trigger => StepConfig::Trigger {
                extra: HashMap::new(),
            },
            StepType::Agent => StepConfig::Agent {
                prompt: None,
                assignee: None,
                extra: HashMap::new(),
            },
            StepType::Manual => StepConfig::Manual {
                instructions: None,
                assignee: None,
                extra: HashMap::new(),
            },
            StepType::External => StepConfig::External {
                url: String::new(),
                method: default_method(),
                headers: None,
                body: None,
                extra: HashMap::new(),
            },
            StepType::Webhook => StepConfig::Webhook {
                url: String::new(),
                method: default_method(),
                headers: None,
                body: None,
                await_callback: false,
                extra: HashMap::new(),
            },
            StepType::Decision => StepConfig::Decision {
                default_connection: None,
                extra: HashMap::new(),
            },
            StepType::Foreach => StepConfig::Foreach {
                collection_path: String::new(),
                item_var: default_item_var(),
                max_items: None,
                streaming: false,
                extra: HashMap::new(),
            },
            StepType::Join => StepConfig::Join {
                source_step: String::new(),
                min_count: None,
                min_success_percent: None,
                max_wait_ms: None,
                fail_on_timeout: true,
                on_threshold_miss: ThresholdMissPolicy::default(),
                extra: HashMap::new(),
            },
            StepType::Flow => StepConfig::Flow {
                workflow: String::new(),
                input: None,
                extra: HashMap::new(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// StepDefinition
// ---------------------------------------------------------------------------

/// A single step in a workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique within a workflow, stable across edits.
    pub id: String,
    /// Human-readable display name.
    pub name: String,
    /// The kind of step.
    #[serde(rename = "type")]
    pub step_type: StepType,
    /// Step-specific configuration payload.
    pub config: StepConfig,
    /// Outgoing edges.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connections: Vec<Connection>,
}

impl StepDefinition {
    /// Build a step with an empty config for its type and no connections.
    pub fn new(id: impl Into<String>, name: impl Into<String>, step_type: StepType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            step_type,
            config: StepConfig::empty_for(step_type),
            connections: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
