//! Step graph -> diagram text.
//!
//! The inverse of `decode`: each step emits a shape-appropriate declaration
//! line, connections emit edge lines, and any configuration not representable
//! by shape or label is serialized into a metadata comment line keyed by step
//! id. Output is stable -- the same input graph always produces the same text
//! -- so diagrams can be diffed.

use serde_json::{Map, Value, json};
use weft_types::step::{StepConfig, StepDefinition, StepType};

use super::shape::{brackets_for, prefix_for};

/// Encode a step graph as flowchart text.
pub fn encode_diagram(steps: &[StepDefinition]) -> String {
    let mut out = String::from("flowchart TD\n");

    for step in steps {
        let (open, close) = brackets_for(step.step_type);
        out.push_str(&format!("    {}{open}\"{}\"{close}\n", step.id, label_for(step)));
    }

    for step in steps {
        for conn in &step.connections {
            let pipe = if step.step_type == StepType::Decision {
                Some(conn.condition.clone().unwrap_or_else(|| "else".to_string()))
            } else {
                conn.label.clone()
            };
            match pipe {
                Some(text) => out.push_str(&format!("    {} -->|{text}| {}\n", step.id, conn.to)),
                None => out.push_str(&format!("    {} --> {}\n", step.id, conn.to)),
            }
        }
    }

    for step in steps {
        if let Some(residual) = metadata_residual(step) {
            let payload = serde_json::to_string(&Value::Object(residual))
                .unwrap_or_else(|_| "{}".to_string());
            out.push_str(&format!("    %% step metadata: {} {payload}\n", step.id));
        }
    }

    out
}

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// Compose a display label: refining prefix + name + trailing annotations.
fn label_for(step: &StepDefinition) -> String {
    let mut label = String::new();
    if let Some(prefix) = prefix_for(step.step_type) {
        label.push_str(prefix);
    }
    label.push_str(&step.name);

    match &step.config {
        StepConfig::Foreach {
            collection_path, ..
        } if !collection_path.is_empty() => {
            label.push_str(&format!(" ({collection_path})"));
        }
        StepConfig::External { url, .. } | StepConfig::Webhook { url, .. } if !url.is_empty() => {
            label.push_str(&format!(" ({url})"));
        }
        StepConfig::Join {
            min_success_percent: Some(pct),
            ..
        } => {
            label.push_str(&format!(" @{}%", format_percent(*pct)));
        }
        _ => {}
    }
    label
}

fn format_percent(pct: f64) -> String {
    if pct.fract() == 0.0 {
        format!("{}", pct as i64)
    } else {
        format!("{pct}")
    }
}

// ---------------------------------------------------------------------------
// Metadata residual
// ---------------------------------------------------------------------------

/// Configuration fields the shape and label cannot carry.
///
/// Defaults and label-expressed values are removed; whatever remains goes to
/// a metadata comment line. `None` when nothing remains.
fn metadata_residual(step: &StepDefinition) -> Option<Map<String, Value>> {
    let Ok(Value::Object(mut map)) = serde_json::to_value(&step.config) else {
        return None;
    };
    map.remove("type");

    match step.step_type {
        StepType::Foreach => {
            map.remove("collection_path");
            remove_if(&mut map, "item_var", &json!("item"));
            remove_if(&mut map, "streaming", &json!(false));
        }
        StepType::Join => {
            map.remove("min_success_percent");
            remove_if(&mut map, "source_step", &json!(""));
            remove_if(&mut map, "fail_on_timeout", &json!(true));
            remove_if(&mut map, "on_threshold_miss", &json!("fail"));
        }
        StepType::External => {
            map.remove("url");
            remove_if(&mut map, "method", &json!("POST"));
        }
        StepType::Webhook => {
            map.remove("url");
            remove_if(&mut map, "method", &json!("POST"));
            remove_if(&mut map, "await_callback", &json!(false));
        }
        StepType::Decision => {
            // Derivable from the connection list; re-synthesized on decode.
            map.remove("branches");
        }
        _ => {}
    }

    if map.is_empty() { None } else { Some(map) }
}

fn remove_if(map: &mut Map<String, Value>, key: &str, default: &Value) {
    if map.get(key) == Some(default) {
        map.remove(key);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
