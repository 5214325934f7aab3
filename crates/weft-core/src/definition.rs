//! Workflow ingestion boundary: parse, normalize, repair, validate.
//!
//! Workflows arrive from three sources -- YAML/JSON documents, the visual
//! diagram compiler, and the HTTP API -- and all of them pass through this
//! single normalization pass. Internal logic only ever sees the canonical
//! shape:
//!
//! - legacy `mode: manual|automated` becomes a `type` (`manual` / `agent`)
//! - a legacy `branches` list becomes the `connections` list
//! - duplicate or missing step ids are repaired by generating a fresh unique
//!   id, never by rejecting the write

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;
use weft_types::step::{Connection, StepConfig, StepDefinition, StepType};
use weft_types::workflow::Workflow;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised at workflow definition time.
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    /// The document could not be parsed at all.
    #[error("parse error: {0}")]
    Parse(String),

    /// The document could not be read or written.
    #[error("io error: {0}")]
    Io(String),

    /// A step declares neither a type nor a legacy execution mode.
    #[error("step '{0}' has no type and no legacy mode")]
    MissingType(String),

    /// Unrecognized legacy execution mode.
    #[error("step '{step}' has unknown mode '{mode}'")]
    UnknownMode { step: String, mode: String },

    /// A connection points at a step that does not exist.
    #[error("step '{step}' connects to unknown step '{target}'")]
    UnknownConnectionTarget { step: String, target: String },

    /// Trigger steps are run entry points and cannot be connection targets.
    #[error("trigger step '{0}' cannot be a connection target")]
    TriggerTargeted(String),

    /// A foreach step without a collection path cannot fan out.
    #[error("foreach step '{0}' has no collection path")]
    MissingCollectionPath(String),

    /// A join step without a source step cannot aggregate.
    #[error("join step '{0}' references no source step")]
    MissingJoinSource(String),

    /// A flow step without a workflow reference cannot delegate.
    #[error("flow step '{0}' references no workflow")]
    MissingFlowTarget(String),
}

// ---------------------------------------------------------------------------
// Raw (pre-normalization) shapes
// ---------------------------------------------------------------------------

/// A workflow document as authored, before normalization.
#[derive(Debug, Deserialize)]
pub struct RawWorkflow {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub steps: Vec<RawStep>,
    #[serde(default)]
    pub diagram: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

fn default_active() -> bool {
    true
}

/// A step as authored. `type`/`config`/`connections` are canonical; `mode`
/// and `branches` are the legacy spellings this boundary converts.
#[derive(Debug, Deserialize)]
pub struct RawStep {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "type")]
    pub step_type: Option<StepType>,
    /// Legacy execution mode: `manual` or `automated`.
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub config: Option<Value>,
    #[serde(default)]
    pub connections: Option<Vec<Connection>>,
    /// Legacy single-branch list, replaced by `connections`.
    #[serde(default)]
    pub branches: Option<Vec<RawBranch>>,
}

/// Legacy branch entry. `target` is an even older alias for `to`.
#[derive(Debug, Deserialize)]
pub struct RawBranch {
    #[serde(alias = "target")]
    pub to: String,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML workflow document and normalize it.
pub fn parse_yaml(text: &str) -> Result<Workflow, DefinitionError> {
    let raw: RawWorkflow =
        serde_yaml_ng::from_str(text).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    normalize_workflow(raw)
}

/// Parse a JSON workflow document and normalize it.
pub fn parse_json(value: Value) -> Result<Workflow, DefinitionError> {
    let raw: RawWorkflow =
        serde_json::from_value(value).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    normalize_workflow(raw)
}

/// Load a workflow document from disk. `.json` files parse as JSON,
/// everything else as YAML.
pub async fn load_workflow_file(path: &std::path::Path) -> Result<Workflow, DefinitionError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| DefinitionError::Io(format!("read {}: {e}", path.display())))?;
    if path.extension().and_then(|e| e.to_str()) == Some("json") {
        let value =
            serde_json::from_str(&text).map_err(|e| DefinitionError::Parse(e.to_string()))?;
        parse_json(value)
    } else {
        parse_yaml(&text)
    }
}

/// Save a canonical workflow to disk as YAML.
pub async fn save_workflow_file(
    workflow: &Workflow,
    path: &std::path::Path,
) -> Result<(), DefinitionError> {
    let yaml =
        serde_yaml_ng::to_string(workflow).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    tokio::fs::write(path, yaml)
        .await
        .map_err(|e| DefinitionError::Io(format!("write {}: {e}", path.display())))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Normalize a raw document into a canonical `Workflow`.
///
/// Applies legacy-field conversion, id repair, and validation. This is the
/// only place legacy shapes are interpreted.
pub fn normalize_workflow(raw: RawWorkflow) -> Result<Workflow, DefinitionError> {
    let mut steps = Vec::with_capacity(raw.steps.len());
    for (position, raw_step) in raw.steps.into_iter().enumerate() {
        steps.push(normalize_step(raw_step, position)?);
    }

    let repaired = repair_step_ids(&mut steps);
    if repaired > 0 {
        tracing::warn!(workflow = raw.name.as_str(), repaired, "repaired step ids at save");
    }

    let now = Utc::now();
    let workflow = Workflow {
        id: raw.id.unwrap_or_else(Uuid::now_v7),
        name: raw.name,
        description: raw.description,
        is_active: raw.is_active,
        steps,
        diagram: raw.diagram,
        metadata: raw.metadata,
        created_at: now,
        updated_at: now,
    };

    validate_workflow(&workflow)?;
    Ok(workflow)
}

fn normalize_step(raw: RawStep, position: usize) -> Result<StepDefinition, DefinitionError> {
    let display = raw
        .id
        .clone()
        .or_else(|| raw.name.clone())
        .unwrap_or_else(|| format!("#{position}"));

    // Legacy `mode` normalizes to a step type before any further processing.
    let step_type = match (raw.step_type, raw.mode.as_deref()) {
        (Some(ty), _) => ty,
        (None, Some("manual")) => StepType::Manual,
        (None, Some("automated")) => StepType::Agent,
        (None, Some(mode)) => {
            return Err(DefinitionError::UnknownMode {
                step: display,
                mode: mode.to_string(),
            });
        }
        (None, None) => return Err(DefinitionError::MissingType(display)),
    };

    let config = match raw.config {
        Some(value) => coerce_config(step_type, value),
        None => StepConfig::empty_for(step_type),
    };

    // `connections` wins over the legacy `branches` list when both appear.
    let connections = match (raw.connections, raw.branches) {
        (Some(conns), _) => conns,
        (None, Some(branches)) => branches
            .into_iter()
            .map(|b| Connection {
                to: b.to,
                condition: b.condition,
                label: b.label,
            })
            .collect(),
        (None, None) => Vec::new(),
    };

    let id = raw.id.unwrap_or_default();
    let name = raw.name.unwrap_or_else(|| id.clone());
    Ok(StepDefinition {
        id,
        name,
        step_type,
        config,
        connections,
    })
}

/// Deserialize a config payload under the step's type tag.
///
/// Authored configs may omit the redundant `type` field; it is injected from
/// the step's declared type. Unusable payloads fall back to an empty config
/// with the payload preserved in the extra bag.
fn coerce_config(step_type: StepType, value: Value) -> StepConfig {
    let Value::Object(mut map) = value else {
        return StepConfig::empty_for(step_type);
    };
    map.insert("type".to_string(), Value::String(step_type.as_str().to_string()));
    // The legacy branch list never belongs inside a config payload.
    map.remove("branches");
    serde_json::from_value(Value::Object(map.clone())).unwrap_or_else(|_| {
        let mut config = StepConfig::empty_for(step_type);
        if let StepConfig::Trigger { extra }
        | StepConfig::Agent { extra, .. }
        | StepConfig::Manual { extra, .. }
        | StepConfig::External { extra, .. }
        | StepConfig::Webhook { extra, .. }
        | StepConfig::Decision { extra, .. }
        | StepConfig::Foreach { extra, .. }
        | StepConfig::Join { extra, .. }
        | StepConfig::Flow { extra, .. } = &mut config
        {
            map.remove("type");
            extra.extend(map);
        }
        config
    })
}

/// Repair duplicate and missing step ids in place.
///
/// The first occurrence keeps its id; later duplicates and empty ids get a
/// fresh unique one. Returns the number of repairs. Connections referencing a
/// duplicated id keep pointing at the first occurrence -- a duplicate's
/// references are ambiguous by construction.
pub fn repair_step_ids(steps: &mut [StepDefinition]) -> u32 {
    let mut seen: HashSet<String> = HashSet::new();
    let mut repaired = 0;
    for step in steps.iter_mut() {
        if step.id.is_empty() || seen.contains(&step.id) {
            step.id = fresh_step_id(&seen);
            repaired += 1;
            if step.name.is_empty() {
                step.name = step.id.clone();
            }
        }
        seen.insert(step.id.clone());
    }
    repaired
}

fn fresh_step_id(seen: &HashSet<String>) -> String {
    loop {
        let id = format!("step-{}", &Uuid::new_v4().simple().to_string()[..8]);
        if !seen.contains(&id) {
            return id;
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a canonical workflow.
///
/// Rejected synchronously at definition time; nothing here is coerced.
pub fn validate_workflow(workflow: &Workflow) -> Result<(), DefinitionError> {
    let by_id: HashMap<&str, &StepDefinition> =
        workflow.steps.iter().map(|s| (s.id.as_str(), s)).collect();

    for step in &workflow.steps {
        for conn in &step.connections {
            let Some(target) = by_id.get(conn.to.as_str()) else {
                return Err(DefinitionError::UnknownConnectionTarget {
                    step: step.id.clone(),
                    target: conn.to.clone(),
                });
            };
            if target.step_type == StepType::Trigger {
                return Err(DefinitionError::TriggerTargeted(target.id.clone()));
            }
        }

        match &step.config {
            StepConfig::Foreach {
                collection_path,
                streaming,
                ..
            } if collection_path.is_empty() && !streaming => {
                return Err(DefinitionError::MissingCollectionPath(step.id.clone()));
            }
            StepConfig::Join { source_step, .. } if source_step.is_empty() => {
                return Err(DefinitionError::MissingJoinSource(step.id.clone()));
            }
            StepConfig::Flow {
                workflow: target, ..
            } if target.is_empty() => {
                return Err(DefinitionError::MissingFlowTarget(step.id.clone()));
            }
            _ => {}
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
