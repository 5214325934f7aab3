//! Workflow container type.
//!
//! A workflow is a named, version-free container of steps. Edits mutate it in
//! place; inactive workflows are excluded from default listings and cannot be
//! started. The optional `diagram` field holds the round-trip flowchart text
//! the visual editor authored, when there is one.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::step::StepDefinition;

/// Named container of workflow steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// UUIDv7 assigned on first save.
    pub id: Uuid,
    /// Human-readable workflow name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Inactive workflows cannot be started and are hidden from listings.
    #[serde(default = "default_active")]
    pub is_active: bool,
    /// Ordered list of steps forming the graph.
    pub steps: Vec<StepDefinition>,
    /// Round-trip diagram text representation, when authored visually.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagram: Option<String>,
    /// Extensible metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
    /// When the workflow was first saved.
    pub created_at: DateTime<Utc>,
    /// When the workflow was last saved.
    pub updated_at: DateTime<Utc>,
}

fn default_active() -> bool {
    true
}

impl Workflow {
    /// Build an empty active workflow with a fresh ID.
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            description: None,
            is_active: true,
            steps: Vec::new(),
            diagram: None,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Look up a step by ID.
    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// IDs of the workflow's entry steps: all `trigger` steps, or -- for
    /// legacy graphs authored without one -- the first step.
    pub fn entry_step_ids(&self) -> Vec<String> {
        let triggers: Vec<String> = self
            .steps
            .iter()
            .filter(|s| s.step_type == crate::step::StepType::Trigger)
            .map(|s| s.id.clone())
            .collect();
        if !triggers.is_empty() {
            return triggers;
        }
        self.steps.first().map(|s| vec![s.id.clone()]).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
