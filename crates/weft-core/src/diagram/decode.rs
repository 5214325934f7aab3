//! Diagram text -> step graph.
//!
//! Tokenizes the text into node-declaration lines, edge lines, and metadata
//! comment lines. Malformed lines are skipped, not fatal: the decoder parses
//! whatever it can, and an empty step list is a valid result.
//!
//! Nodes are linearized by Kahn's algorithm over the parsed edges so the
//! resulting step order is deterministic and independent of diagram layout;
//! nodes the sort cannot reach (cycle members) are appended in their original
//! textual order. Edges are recorded against diagram-local identifiers during
//! parsing and remapped to the graph's stable step ids once all nodes are
//! known.

use std::collections::HashMap;

use petgraph::graph::{DiGraph, NodeIndex};
use serde_json::Value;
use weft_types::step::{Connection, StepConfig, StepDefinition, StepType};

use super::shape::{is_valid_ident, split_declaration, step_type_for, strip_annotations};

/// Marker introducing a metadata comment line.
const METADATA_MARKER: &str = "step metadata:";

// ---------------------------------------------------------------------------
// Parsed intermediate state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct ParsedNode {
    local_id: String,
    name: String,
    step_type: StepType,
    config: StepConfig,
}

#[derive(Debug)]
struct ParsedEdge {
    from: String,
    to: String,
    pipe: Option<String>,
}

#[derive(Debug, Default)]
struct Parser {
    /// Nodes in textual order.
    nodes: Vec<ParsedNode>,
    /// local id -> index into `nodes`.
    index: HashMap<String, usize>,
    /// Edges in textual order, referencing diagram-local ids.
    edges: Vec<ParsedEdge>,
    /// Metadata payloads keyed by local id. Later lines win.
    metadata: HashMap<String, serde_json::Map<String, Value>>,
}

impl Parser {
    /// Register a node from a full declaration, upgrading an implicit node.
    fn declare(&mut self, local_id: &str, step_type: StepType, name: String, config: StepConfig) {
        match self.index.get(local_id) {
            Some(&i) => {
                let node = &mut self.nodes[i];
                node.step_type = step_type;
                node.name = name;
                node.config = config;
            }
            None => {
                self.index.insert(local_id.to_string(), self.nodes.len());
                self.nodes.push(ParsedNode {
                    local_id: local_id.to_string(),
                    name,
                    step_type,
                    config,
                });
            }
        }
    }

    /// Register a bare identifier reference. Bare references default to
    /// `agent` nodes named after their id, like Mermaid's implicit nodes.
    fn reference(&mut self, local_id: &str) {
        if !self.index.contains_key(local_id) {
            self.index.insert(local_id.to_string(), self.nodes.len());
            self.nodes.push(ParsedNode {
                local_id: local_id.to_string(),
                name: local_id.to_string(),
                step_type: StepType::Agent,
                config: StepConfig::empty_for(StepType::Agent),
            });
        }
    }

    /// Parse one node reference: a full declaration or a bare id.
    /// Returns the local id, or `None` if the segment is malformed.
    fn node_ref(&mut self, segment: &str) -> Option<String> {
        let segment = segment.trim();
        if let Some((id, shape, label)) = split_declaration(segment) {
            let (step_type, stripped) = step_type_for(shape, label);
            let (name, aux) = strip_annotations(step_type, &stripped);
            let config = config_from_aux(step_type, &aux);
            self.declare(id, step_type, name, config);
            return Some(id.to_string());
        }
        if is_valid_ident(segment) {
            self.reference(segment);
            return Some(segment.to_string());
        }
        None
    }

    /// Parse an edge line, possibly a chain: `a -->|yes| b --> c`.
    /// The whole line is skipped if any segment is malformed.
    fn edge_line(&mut self, line: &str) {
        let segments: Vec<&str> = line.split("-->").collect();
        let mut resolved: Vec<(Option<String>, String)> = Vec::with_capacity(segments.len());

        for (i, raw) in segments.iter().enumerate() {
            let mut rest = raw.trim();
            let mut pipe = None;
            if i > 0 && rest.starts_with('|') {
                let Some(close) = rest[1..].find('|') else {
                    return; // unterminated pipe label
                };
                pipe = Some(rest[1..close + 1].trim().to_string());
                rest = rest[close + 2..].trim();
            }
            resolved.push((pipe, rest.to_string()));
        }

        // Validate every segment before registering anything, so a malformed
        // later segment does not half-apply the line.
        for (_, seg) in &resolved {
            if split_declaration(seg).is_none() && !is_valid_ident(seg) {
                return;
            }
        }

        let mut prev: Option<String> = None;
        for (pipe, seg) in resolved {
            let Some(id) = self.node_ref(&seg) else {
                return;
            };
            if let Some(from) = prev {
                self.edges.push(ParsedEdge {
                    from,
                    to: id.clone(),
                    pipe,
                });
            }
            prev = Some(id);
        }
    }

    /// Parse a `%% step metadata: <id> <json>` comment line.
    fn metadata_line(&mut self, comment: &str) {
        let Some(rest) = comment.trim().strip_prefix(METADATA_MARKER) else {
            return; // ordinary comment
        };
        let rest = rest.trim();
        let Some(space) = rest.find(char::is_whitespace) else {
            return;
        };
        let (id, payload) = rest.split_at(space);
        if !is_valid_ident(id) {
            return;
        }
        match serde_json::from_str::<Value>(payload.trim()) {
            Ok(Value::Object(map)) => {
                self.metadata.insert(id.to_string(), map);
            }
            _ => {
                tracing::debug!(node = id, "skipping unparseable metadata line");
            }
        }
    }
}

/// Seed a config from label-derived auxiliary values.
fn config_from_aux(step_type: StepType, aux: &super::shape::LabelAux) -> StepConfig {
    let mut config = StepConfig::empty_for(step_type);
    match &mut config {
        StepConfig::Foreach {
            collection_path, ..
        } => {
            if let Some(p) = &aux.paren {
                *collection_path = p.clone();
            }
        }
        StepConfig::External { url, .. } | StepConfig::Webhook { url, .. } => {
            if let Some(u) = &aux.paren {
                *url = u.clone();
            }
        }
        StepConfig::Join {
            min_success_percent,
            ..
        } => {
            if aux.percent.is_some() {
                *min_success_percent = aux.percent;
            }
        }
        _ => {}
    }
    config
}

/// Overlay metadata fields onto a config. Metadata takes precedence over
/// label-derived values; the `type` key is owned by the shape and ignored.
/// Unparseable merges leave the config unchanged.
fn apply_metadata(config: &StepConfig, meta: &serde_json::Map<String, Value>) -> StepConfig {
    let Ok(Value::Object(mut map)) = serde_json::to_value(config) else {
        return config.clone();
    };
    for (k, v) in meta {
        if k == "type" {
            continue;
        }
        map.insert(k.clone(), v.clone());
    }
    serde_json::from_value(Value::Object(map)).unwrap_or_else(|_| config.clone())
}

// ---------------------------------------------------------------------------
// Kahn linearization
// ---------------------------------------------------------------------------

/// Deterministic topological order over the parsed nodes.
///
/// Zero-in-degree nodes are taken in textual order; removing a node
/// decrements its successors. Nodes never reaching zero in-degree (cycle
/// members) are appended in textual order.
fn linearize(nodes: &[ParsedNode], edges: &[ParsedEdge], index: &HashMap<String, usize>) -> Vec<usize> {
    let mut graph = DiGraph::<usize, ()>::new();
    let node_indices: Vec<NodeIndex> = (0..nodes.len()).map(|i| graph.add_node(i)).collect();
    for edge in edges {
        // Both endpoints exist: parsing registers implicit nodes.
        let (Some(&f), Some(&t)) = (index.get(&edge.from), index.get(&edge.to)) else {
            continue;
        };
        if f != t {
            graph.update_edge(node_indices[f], node_indices[t], ());
        }
    }

    let mut in_degree: Vec<usize> = node_indices
        .iter()
        .map(|&n| graph.neighbors_directed(n, petgraph::Direction::Incoming).count())
        .collect();
    let mut placed = vec![false; nodes.len()];
    let mut order = Vec::with_capacity(nodes.len());

    loop {
        // First unplaced zero-in-degree node in textual order.
        let Some(next) = (0..nodes.len()).find(|&i| !placed[i] && in_degree[i] == 0) else {
            break;
        };
        placed[next] = true;
        order.push(next);
        for succ in graph.neighbors_directed(node_indices[next], petgraph::Direction::Outgoing) {
            let succ_pos = graph[succ];
            in_degree[succ_pos] = in_degree[succ_pos].saturating_sub(1);
        }
    }

    // Cycle members keep their textual order.
    for i in 0..nodes.len() {
        if !placed[i] {
            order.push(i);
        }
    }
    order
}

// ---------------------------------------------------------------------------
// decode_diagram
// ---------------------------------------------------------------------------

/// Decode flowchart text into a step graph.
///
/// Never fails: malformed lines are skipped and whatever parses is returned.
pub fn decode_diagram(text: &str) -> Vec<StepDefinition> {
    let mut parser = Parser::default();

    for raw_line in text.lines() {
        let line = raw_line.trim().trim_end_matches(';').trim();
        if line.is_empty() {
            continue;
        }
        if let Some(comment) = line.strip_prefix("%%") {
            parser.metadata_line(comment);
            continue;
        }
        let head = line.split_whitespace().next().unwrap_or("");
        if head == "flowchart" || head == "graph" {
            continue;
        }
        if line.contains("-->") {
            parser.edge_line(line);
            continue;
        }
        if parser.node_ref(line).is_none() {
            tracing::debug!(line = raw_line, "skipping unparseable diagram line");
        }
    }

    // Metadata overlays, now that every node is known.
    for node in &mut parser.nodes {
        if let Some(meta) = parser.metadata.get(&node.local_id) {
            node.config = apply_metadata(&node.config, meta);
        }
    }

    // Diagram-local ids -> stable step ids. Local ids are unique within the
    // parse, so the mapping is the identity today; edges still resolve
    // through it so repaired ids would follow automatically.
    let stable: HashMap<String, String> = parser
        .nodes
        .iter()
        .map(|n| (n.local_id.clone(), n.local_id.clone()))
        .collect();

    // Group connections by source, preserving edge order.
    let mut connections: HashMap<String, Vec<Connection>> = HashMap::new();
    for edge in &parser.edges {
        let Some(&src_idx) = parser.index.get(&edge.from) else {
            continue;
        };
        let is_decision = parser.nodes[src_idx].step_type == StepType::Decision;
        let (condition, label) = match (&edge.pipe, is_decision) {
            (Some(p), true) if p == "else" || p == "default" => (None, None),
            (Some(p), true) => (Some(p.clone()), None),
            (Some(p), false) => (None, Some(p.clone())),
            (None, _) => (None, None),
        };
        connections
            .entry(edge.from.clone())
            .or_default()
            .push(Connection {
                to: stable[&edge.to].clone(),
                condition,
                label,
            });
    }

    let order = linearize(&parser.nodes, &parser.edges, &parser.index);

    order
        .into_iter()
        .map(|i| {
            let node = &parser.nodes[i];
            let conns = connections.remove(&node.local_id).unwrap_or_default();
            let mut config = node.config.clone();
            // Legacy consumers read a single-branch list off decision nodes;
            // synthesize it from the connection list.
            if let StepConfig::Decision { extra, .. } = &mut config {
                let branches: Vec<Value> = conns
                    .iter()
                    .map(|c| {
                        serde_json::json!({
                            "to": c.to,
                            "condition": c.condition,
                        })
                    })
                    .collect();
                extra.insert("branches".to_string(), Value::Array(branches));
            }
            StepDefinition {
                id: stable[&node.local_id].clone(),
                name: node.name.clone(),
                step_type: node.step_type,
                config,
                connections: conns,
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
