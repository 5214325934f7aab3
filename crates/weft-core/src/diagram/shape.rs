//! Node shape table: bracket pairs <-> step types, label prefixes, and
//! trailing annotations.
//!
//! A node's enclosing bracket shape determines its step type. Ambiguous
//! shapes (double-square, hexagon) are refined by a free-text prefix on the
//! label; trailing annotations extract auxiliary config and are stripped from
//! the display name.

use weft_types::step::StepType;

// ---------------------------------------------------------------------------
// NodeShape
// ---------------------------------------------------------------------------

/// Bracket shapes the notation recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeShape {
    /// `([x])` -- trigger
    Stadium,
    /// `[[x]]` -- foreach / join / flow, by prefix
    DoubleSquare,
    /// `((x))` -- manual
    DoubleRound,
    /// `{{x}}` -- external / webhook, by prefix
    Hexagon,
    /// `[x]` -- agent
    Square,
    /// `(x)` -- manual
    Round,
    /// `{x}` -- decision
    Diamond,
}

/// Bracket pairs in match order. Compound pairs come first so `[[` is not
/// read as `[`.
const BRACKETS: &[(NodeShape, &str, &str)] = &[
    (NodeShape::Stadium, "([", "])"),
    (NodeShape::DoubleSquare, "[[", "]]"),
    (NodeShape::DoubleRound, "((", "))"),
    (NodeShape::Hexagon, "{{", "}}"),
    (NodeShape::Square, "[", "]"),
    (NodeShape::Round, "(", ")"),
    (NodeShape::Diamond, "{", "}"),
];

/// Split a node declaration into (id, shape, raw label).
///
/// Returns `None` for anything that is not `ident` + bracket pair + closing
/// bracket at end of string.
pub fn split_declaration(decl: &str) -> Option<(&str, NodeShape, &str)> {
    let decl = decl.trim();
    let id_end = decl
        .find(|c: char| !is_ident_char(c))
        .unwrap_or(decl.len());
    if id_end == 0 {
        return None;
    }
    let (id, rest) = decl.split_at(id_end);
    if !is_valid_ident(id) || rest.is_empty() {
        return None;
    }

    for (shape, open, close) in BRACKETS {
        if let Some(inner) = rest.strip_prefix(open) {
            let inner = inner.strip_suffix(close)?;
            return Some((id, *shape, strip_quotes(inner)));
        }
    }
    None
}

/// Whether a string is a valid diagram-local node identifier.
pub fn is_valid_ident(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    s.chars().all(is_ident_char)
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn strip_quotes(s: &str) -> &str {
    let s = s.trim();
    s.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(s)
}

// ---------------------------------------------------------------------------
// Shape -> step type (with prefix refinement)
// ---------------------------------------------------------------------------

/// Resolve a shape and raw label to a step type, returning the label with any
/// refining prefix stripped.
pub fn step_type_for(shape: NodeShape, label: &str) -> (StepType, String) {
    let label = label.trim();
    match shape {
        NodeShape::Stadium => (StepType::Trigger, label.to_string()),
        NodeShape::Square => (StepType::Agent, label.to_string()),
        NodeShape::Round | NodeShape::DoubleRound => (StepType::Manual, label.to_string()),
        NodeShape::Diamond => (StepType::Decision, label.to_string()),
        NodeShape::Hexagon => match strip_prefix_word(label, "hook:") {
            Some(rest) => (StepType::Webhook, rest),
            None => (StepType::External, label.to_string()),
        },
        NodeShape::DoubleSquare => {
            if let Some(rest) = strip_prefix_word(label, "each:") {
                (StepType::Foreach, rest)
            } else if let Some(rest) = strip_prefix_word(label, "join:") {
                (StepType::Join, rest)
            } else if let Some(rest) = strip_prefix_word(label, "run:") {
                (StepType::Flow, rest)
            } else {
                (StepType::Foreach, label.to_string())
            }
        }
    }
}

fn strip_prefix_word(label: &str, prefix: &str) -> Option<String> {
    label.strip_prefix(prefix).map(|rest| rest.trim().to_string())
}

/// Bracket pair used when encoding a step of the given type.
pub fn brackets_for(step_type: StepType) -> (&'static str, &'static str) {
    match step_type {
        StepType::Trigger => ("([", "])"),
        StepType::Agent => ("[", "]"),
        StepType::Manual => ("((", "))"),
        StepType::External | StepType::Webhook => ("{{", "}}"),
        StepType::Decision => ("{", "}"),
        StepType::Foreach | StepType::Join | StepType::Flow => ("[[", "]]"),
    }
}

/// Label prefix emitted when encoding, for shapes the bracket alone cannot
/// disambiguate. Foreach is the double-square default and needs none.
pub fn prefix_for(step_type: StepType) -> Option<&'static str> {
    match step_type {
        StepType::Join => Some("join: "),
        StepType::Flow => Some("run: "),
        StepType::Webhook => Some("hook: "),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Trailing annotations
// ---------------------------------------------------------------------------

/// Auxiliary config extracted from a label's trailing annotations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelAux {
    /// From a trailing `(text)`: a foreach's collection path or an
    /// external/webhook target address.
    pub paren: Option<String>,
    /// From a trailing `@NN%`: a join's success threshold.
    pub percent: Option<f64>,
}

/// Strip trailing annotations from a label, returning the display name and
/// the extracted values.
pub fn strip_annotations(step_type: StepType, label: &str) -> (String, LabelAux) {
    let mut name = label.trim().to_string();
    let mut aux = LabelAux::default();

    if step_type == StepType::Join {
        if let Some(at) = name.rfind('@') {
            let tail = name[at + 1..].trim();
            if let Some(digits) = tail.strip_suffix('%') {
                if let Ok(pct) = digits.trim().parse::<f64>() {
                    aux.percent = Some(pct);
                    name.truncate(at);
                    name = name.trim_end().to_string();
                }
            }
        }
    }

    if matches!(
        step_type,
        StepType::Foreach | StepType::External | StepType::Webhook
    ) && name.ends_with(')')
    {
        if let Some(open) = name.rfind('(') {
            let inner = name[open + 1..name.len() - 1].trim().to_string();
            if !inner.is_empty() {
                aux.paren = Some(inner);
                name.truncate(open);
                name = name.trim_end().to_string();
            }
        }
    }

    (name, aux)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
