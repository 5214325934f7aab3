//! Expression evaluation, JSON path lookup, and template interpolation.
//!
//! Wraps `jexl_eval::Evaluator` with pre-registered standard transforms for
//! decision conditions, and provides the dot-path resolver foreach steps use
//! to locate their collection plus the `{{ path }}` interpolation outbound
//! bodies use.
//!
//! **Security note:** payloads are always passed as context objects, NEVER
//! interpolated into expression strings.

use serde_json::{Value, json};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during expression evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

// ---------------------------------------------------------------------------
// ConditionEvaluator
// ---------------------------------------------------------------------------

/// JEXL expression evaluator with standard transforms pre-registered.
///
/// Used for decision-step connection conditions, evaluated against the
/// previous step's output.
pub struct ConditionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

// SAFETY: the wrapped `jexl_eval::Evaluator` holds only pure, non-capturing
// `Fn` transform closures and evaluates via `&self` with no interior
// mutability, so sharing/transferring a `ConditionEvaluator` across threads is
// sound. The underlying type lacks the auto-impls only because it boxes `dyn
// Fn`.
unsafe impl Send for ConditionEvaluator {}
unsafe impl Sync for ConditionEvaluator {}

impl ConditionEvaluator {
    /// Create a new evaluator with all standard transforms registered.
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("contains", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let search = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.contains(search)))
            })
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!value_to_bool(&val)))
            })
            .with_transform("length", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                let len = match &val {
                    Value::String(s) => s.len(),
                    Value::Array(a) => a.len(),
                    Value::Object(o) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            });

        Self { evaluator }
    }

    /// Evaluate an expression to a boolean result.
    ///
    /// The `context` must be a JSON object. Results are coerced to boolean
    /// using JavaScript-like truthiness rules.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }

        let result = self
            .evaluator
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))?;

        Ok(value_to_bool(&result))
    }
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// Coerce a JSON value to boolean using JavaScript-like truthiness.
fn value_to_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Path resolution
// ---------------------------------------------------------------------------

/// Resolve a dot-separated path into a JSON value.
///
/// Segments address object keys; numeric segments address array indices.
/// An empty path or `"."` resolves to the value itself.
pub fn resolve_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let trimmed = path.trim();
    if trimmed.is_empty() || trimmed == "." {
        return Some(value);
    }

    let mut current = value;
    for segment in trimmed.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => {
                let idx: usize = segment.parse().ok()?;
                items.get(idx)?
            }
            _ => return None,
        };
    }
    Some(current)
}

// ---------------------------------------------------------------------------
// Template interpolation
// ---------------------------------------------------------------------------

/// Resolve `{{ path }}` markers in a template against a context object.
///
/// String values substitute raw; other values substitute as JSON. Unknown
/// references are left as-is (not an error).
pub fn resolve_template(template: &str, context: &Value) -> String {
    let mut result = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let (before, marker_on) = rest.split_at(start);
        result.push_str(before);

        match marker_on.find("}}") {
            Some(end) => {
                let path = marker_on[2..end].trim();
                match resolve_path(context, path) {
                    Some(Value::String(s)) => result.push_str(s),
                    Some(other) => result.push_str(&other.to_string()),
                    None => result.push_str(&marker_on[..end + 2]),
                }
                rest = &marker_on[end + 2..];
            }
            None => {
                // Unterminated marker: emit verbatim
                result.push_str(marker_on);
                rest = "";
            }
        }
    }

    result.push_str(rest);
    result
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
