//! Lenient graph parsing.
//!
//! Arbitrary JSON (editor saves, hand edits, older schemas) is coerced into a
//! [`FlowGraph`] that upholds every structural invariant. Invalid nodes and
//! edges are dropped rather than failing the whole graph; each drop or coercion
//! is reported as a [`Diagnostic`] so stricter callers can surface it.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::defaults::{default_graph, DEFAULT_MAX_DEPTH};
use crate::types::{
    EdgeTrigger, FlowEdge, FlowGraph, FlowNode, NodeKind, Position, ReplyIntent, GRAPH_VERSION,
    MAX_DEPTH, MAX_MINUTES, MAX_PRIORITY, MIN_DEPTH, MIN_PRIORITY,
};

const DEFAULT_PRIORITY: u32 = MAX_PRIORITY;

/// A graph plus everything that was changed to get it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Normalized {
    pub graph: FlowGraph,
    pub diagnostics: Vec<Diagnostic>,
}

impl Normalized {
    pub fn is_clean(&self) -> bool {
        self.diagnostics.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub code: DiagnosticCode,
    /// Node id, edge id, or graph field the diagnostic is about.
    pub subject: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticCode {
    GraphNotAnObject,
    GraphReplacedByDefault,
    NodeInvalid,
    NodeMissingId,
    NodeDuplicateId,
    NodeEmptyBody,
    NodeKindCoerced,
    TerminalContentCleared,
    EdgeInvalid,
    EdgeMissingId,
    EdgeDuplicateId,
    EdgeDanglingReference,
    EdgeTriggerCoerced,
    EdgeIntentCoerced,
    ValueClamped,
    StartNodeReassigned,
    MaxDepthDefaulted,
}

/// Coerce `raw` into a valid graph. Never fails.
pub fn normalize_graph(raw: &Value) -> FlowGraph {
    normalize_graph_with_diagnostics(raw).graph
}

/// Coerce `raw` into a valid graph and report every drop and coercion.
pub fn normalize_graph_with_diagnostics(raw: &Value) -> Normalized {
    let mut diags = Diagnostics::default();

    let Some(obj) = raw.as_object() else {
        diags.push(
            DiagnosticCode::GraphNotAnObject,
            "graph",
            "graph is not a JSON object; using the default template",
        );
        return diags.finish(default_graph());
    };

    let mut nodes: Vec<FlowNode> = Vec::new();
    let mut node_ids: HashSet<String> = HashSet::new();
    for (index, raw_node) in array_field(obj, "nodes").iter().enumerate() {
        if let Some(node) = normalize_node(index, raw_node, &mut diags) {
            if !node_ids.insert(node.id.clone()) {
                diags.push(
                    DiagnosticCode::NodeDuplicateId,
                    &node.id,
                    "duplicate node id dropped",
                );
                continue;
            }
            nodes.push(node);
        }
    }

    if nodes.is_empty() {
        diags.push(
            DiagnosticCode::GraphReplacedByDefault,
            "nodes",
            "no valid nodes survived; using the default template",
        );
        return diags.finish(default_graph());
    }

    let mut edges: Vec<FlowEdge> = Vec::new();
    let mut edge_ids: HashSet<String> = HashSet::new();
    for (index, raw_edge) in array_field(obj, "edges").iter().enumerate() {
        let Some(edge) = normalize_edge(index, raw_edge, &mut diags) else {
            continue;
        };
        if !node_ids.contains(&edge.from_node_id) || !node_ids.contains(&edge.to_node_id) {
            diags.push(
                DiagnosticCode::EdgeDanglingReference,
                &edge.id,
                format!(
                    "edge {} -> {} references a missing node",
                    edge.from_node_id, edge.to_node_id
                ),
            );
            continue;
        }
        if !edge_ids.insert(edge.id.clone()) {
            diags.push(
                DiagnosticCode::EdgeDuplicateId,
                &edge.id,
                "duplicate edge id dropped",
            );
            continue;
        }
        edges.push(edge);
    }

    let requested_start = str_field(obj, &["startNodeId", "start_node_id"]).unwrap_or_default();
    let start_node_id = if node_ids.contains(requested_start) {
        requested_start.to_string()
    } else {
        let first = nodes[0].id.clone();
        diags.push(
            DiagnosticCode::StartNodeReassigned,
            "startNodeId",
            format!("start node {requested_start:?} not found; using {first:?}"),
        );
        first
    };

    let max_depth = match number_field(obj, &["maxDepth", "max_depth"]) {
        Some(depth) => clamp_u32(depth, MIN_DEPTH, MAX_DEPTH, "maxDepth", "graph", &mut diags),
        None => {
            diags.push(
                DiagnosticCode::MaxDepthDefaulted,
                "maxDepth",
                format!("maxDepth missing or invalid; using {DEFAULT_MAX_DEPTH}"),
            );
            DEFAULT_MAX_DEPTH
        }
    };

    diags.finish(FlowGraph {
        version: GRAPH_VERSION,
        max_depth,
        start_node_id,
        nodes,
        edges,
    })
}

fn normalize_node(index: usize, raw: &Value, diags: &mut Diagnostics) -> Option<FlowNode> {
    let Some(obj) = raw.as_object() else {
        diags.push(
            DiagnosticCode::NodeInvalid,
            format!("nodes[{index}]"),
            "node is not an object",
        );
        return None;
    };

    let id = match str_field(obj, &["id"]) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => {
            diags.push(
                DiagnosticCode::NodeMissingId,
                format!("nodes[{index}]"),
                "node has no id",
            );
            return None;
        }
    };

    let kind = match str_field(obj, &["kind"]) {
        Some("terminal") => NodeKind::Terminal,
        Some("message") => NodeKind::Message,
        other => {
            diags.push(
                DiagnosticCode::NodeKindCoerced,
                &id,
                format!("unknown node kind {other:?} coerced to message"),
            );
            NodeKind::Message
        }
    };

    let title = str_field(obj, &["title"]).unwrap_or_default().to_string();
    let mut subject = str_field(obj, &["subject"]).unwrap_or_default().to_string();
    let mut body = str_field(obj, &["body"]).unwrap_or_default().to_string();
    let mut auto_send = bool_field(obj, &["autoSend", "auto_send"]).unwrap_or(false);

    match kind {
        NodeKind::Message if body.trim().is_empty() => {
            diags.push(
                DiagnosticCode::NodeEmptyBody,
                &id,
                "message node has an empty body",
            );
            return None;
        }
        NodeKind::Terminal => {
            if !subject.is_empty() || !body.is_empty() || auto_send {
                diags.push(
                    DiagnosticCode::TerminalContentCleared,
                    &id,
                    "terminal node content and autoSend cleared",
                );
            }
            subject.clear();
            body.clear();
            auto_send = false;
        }
        NodeKind::Message => {}
    }

    let delay_minutes = number_field(obj, &["delayMinutes", "delay_minutes"])
        .map(|v| clamp_u32(v, 0, MAX_MINUTES, "delayMinutes", &id, diags))
        .unwrap_or(0);

    let position_obj = obj.get("position").and_then(Value::as_object);
    let coord = |key: &str| {
        position_obj
            .and_then(|p| p.get(key))
            .or_else(|| obj.get(key))
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
    };
    let position = Position {
        x: coord("x"),
        y: coord("y"),
    };

    Some(FlowNode {
        id,
        kind,
        title,
        subject,
        body,
        auto_send,
        delay_minutes,
        position,
    })
}

fn normalize_edge(index: usize, raw: &Value, diags: &mut Diagnostics) -> Option<FlowEdge> {
    let Some(obj) = raw.as_object() else {
        diags.push(
            DiagnosticCode::EdgeInvalid,
            format!("edges[{index}]"),
            "edge is not an object",
        );
        return None;
    };

    let id = match str_field(obj, &["id"]) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => {
            diags.push(
                DiagnosticCode::EdgeMissingId,
                format!("edges[{index}]"),
                "edge has no id",
            );
            return None;
        }
    };

    let from_node_id = str_field(obj, &["fromNodeId", "from_node_id"])
        .unwrap_or_default()
        .to_string();
    let to_node_id = str_field(obj, &["toNodeId", "to_node_id"])
        .unwrap_or_default()
        .to_string();

    let trigger = match str_field(obj, &["trigger"]) {
        Some("intent") => EdgeTrigger::Intent,
        Some("timer") => EdgeTrigger::Timer,
        Some("fallback") => EdgeTrigger::Fallback,
        other => {
            diags.push(
                DiagnosticCode::EdgeTriggerCoerced,
                &id,
                format!("unknown trigger {other:?} coerced to fallback"),
            );
            EdgeTrigger::Fallback
        }
    };

    let intent = match str_field(obj, &["intent"]) {
        None | Some("") => None,
        Some(raw) => {
            let parsed = ReplyIntent::parse(raw);
            if parsed.is_none() {
                diags.push(
                    DiagnosticCode::EdgeIntentCoerced,
                    &id,
                    format!("unknown intent {raw:?} cleared"),
                );
            }
            parsed
        }
    };

    let wait_minutes = number_field(obj, &["waitMinutes", "wait_minutes"])
        .map(|v| clamp_u32(v, 0, MAX_MINUTES, "waitMinutes", &id, diags))
        .unwrap_or(0);

    let confidence_threshold =
        match number_field(obj, &["confidenceThreshold", "confidence_threshold"]) {
            Some(v) if !(0.0..=1.0).contains(&v) => {
                diags.push(
                    DiagnosticCode::ValueClamped,
                    &id,
                    format!("confidenceThreshold {v} clamped to [0, 1]"),
                );
                v.clamp(0.0, 1.0)
            }
            Some(v) => v,
            None => 0.0,
        };

    let priority = number_field(obj, &["priority"])
        .map(|v| clamp_u32(v, MIN_PRIORITY, MAX_PRIORITY, "priority", &id, diags))
        .unwrap_or(DEFAULT_PRIORITY);

    Some(FlowEdge {
        id,
        from_node_id,
        to_node_id,
        trigger,
        intent,
        wait_minutes,
        confidence_threshold,
        priority,
    })
}

#[derive(Default)]
struct Diagnostics(Vec<Diagnostic>);

impl Diagnostics {
    fn push(&mut self, code: DiagnosticCode, subject: impl Into<String>, message: impl Into<String>) {
        let diagnostic = Diagnostic {
            code,
            subject: subject.into(),
            message: message.into(),
        };
        debug!(code = ?diagnostic.code, subject = %diagnostic.subject, "{}", diagnostic.message);
        self.0.push(diagnostic);
    }

    fn finish(self, graph: FlowGraph) -> Normalized {
        Normalized {
            graph,
            diagnostics: self.0,
        }
    }
}

fn array_field<'a>(obj: &'a Map<String, Value>, key: &str) -> &'a [Value] {
    obj.get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn str_field<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| obj.get(*k).and_then(Value::as_str))
}

fn bool_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<bool> {
    keys.iter().find_map(|k| match obj.get(*k)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) if s == "true" => Some(true),
        Value::String(s) if s == "false" => Some(false),
        _ => None,
    })
}

/// Numbers, or numeric strings from form posts.
fn number_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter()
        .find_map(|k| match obj.get(*k)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        })
        .filter(|v| v.is_finite())
}

fn clamp_u32(
    value: f64,
    min: u32,
    max: u32,
    field: &str,
    subject: &str,
    diags: &mut Diagnostics,
) -> u32 {
    let rounded = value.round();
    if rounded < min as f64 || rounded > max as f64 {
        diags.push(
            DiagnosticCode::ValueClamped,
            subject,
            format!("{field} {value} clamped to [{min}, {max}]"),
        );
    }
    rounded.clamp(min as f64, max as f64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw_graph() -> Value {
        json!({
            "version": 1,
            "maxDepth": 3,
            "startNodeId": "start",
            "nodes": [
                { "id": "start", "kind": "message", "title": "Intro", "subject": "Hi",
                  "body": "Hello there", "autoSend": true, "delayMinutes": 0,
                  "position": { "x": 10.0, "y": 20.0 } },
                { "id": "reply", "kind": "message", "body": "Thanks!", "autoSend": false },
                { "id": "end", "kind": "terminal" }
            ],
            "edges": [
                { "id": "e1", "fromNodeId": "start", "toNodeId": "reply", "trigger": "intent",
                  "intent": "interest", "confidenceThreshold": 0.65, "priority": 1 },
                { "id": "e2", "fromNodeId": "start", "toNodeId": "end", "trigger": "fallback",
                  "priority": 99 }
            ]
        })
    }

    #[test]
    fn test_valid_graph_is_clean() {
        let normalized = normalize_graph_with_diagnostics(&raw_graph());
        assert!(normalized.is_clean(), "{:?}", normalized.diagnostics);
        let graph = normalized.graph;
        assert_eq!(graph.max_depth, 3);
        assert_eq!(graph.nodes.len(), 3);
        assert_eq!(graph.edges.len(), 2);
        assert_eq!(graph.nodes[0].position, Position { x: 10.0, y: 20.0 });
        assert_eq!(graph.edges[0].intent, Some(ReplyIntent::Interest));
    }

    #[test]
    fn test_empty_message_node_dropped_with_its_edges() {
        let mut raw = raw_graph();
        raw["nodes"][1]["body"] = json!("   ");
        let normalized = normalize_graph_with_diagnostics(&raw);

        assert!(normalized.graph.node("reply").is_none());
        assert_eq!(normalized.graph.edges.len(), 1);
        assert_eq!(normalized.graph.edges[0].id, "e2");
        let codes: Vec<_> = normalized.diagnostics.iter().map(|d| d.code).collect();
        assert!(codes.contains(&DiagnosticCode::NodeEmptyBody));
        assert!(codes.contains(&DiagnosticCode::EdgeDanglingReference));
    }

    #[test]
    fn test_unknown_kind_trigger_and_intent_coerced() {
        let raw = json!({
            "startNodeId": "a",
            "nodes": [
                { "id": "a", "kind": "sms", "body": "Ping" },
                { "id": "b", "kind": "terminal", "body": "should vanish", "autoSend": true }
            ],
            "edges": [
                { "id": "e", "fromNodeId": "a", "toNodeId": "b", "trigger": "webhook",
                  "intent": "purchase" }
            ]
        });
        let normalized = normalize_graph_with_diagnostics(&raw);
        let graph = &normalized.graph;

        assert_eq!(graph.nodes[0].kind, NodeKind::Message);
        assert_eq!(graph.nodes[1].body, "");
        assert!(!graph.nodes[1].auto_send);
        assert_eq!(graph.edges[0].trigger, EdgeTrigger::Fallback);
        assert_eq!(graph.edges[0].intent, None);
        assert_eq!(graph.max_depth, DEFAULT_MAX_DEPTH);
        let codes: Vec<_> = normalized.diagnostics.iter().map(|d| d.code).collect();
        assert!(codes.contains(&DiagnosticCode::MaxDepthDefaulted));
        assert!(codes.contains(&DiagnosticCode::TerminalContentCleared));
    }

    #[test]
    fn test_numeric_fields_clamped() {
        let raw = json!({
            "maxDepth": 42,
            "startNodeId": "a",
            "nodes": [{ "id": "a", "body": "x", "kind": "message", "delayMinutes": 99999 }],
            "edges": [{ "id": "e", "fromNodeId": "a", "toNodeId": "a", "trigger": "intent",
                        "intent": "question", "confidenceThreshold": 1.7, "priority": 0,
                        "waitMinutes": -5 }]
        });
        let graph = normalize_graph(&raw);
        assert_eq!(graph.max_depth, MAX_DEPTH);
        assert_eq!(graph.nodes[0].delay_minutes, MAX_MINUTES);
        assert_eq!(graph.edges[0].confidence_threshold, 1.0);
        assert_eq!(graph.edges[0].priority, MIN_PRIORITY);
        assert_eq!(graph.edges[0].wait_minutes, 0);
    }

    #[test]
    fn test_missing_start_falls_back_to_first_node() {
        let mut raw = raw_graph();
        raw["startNodeId"] = json!("ghost");
        let graph = normalize_graph(&raw);
        assert_eq!(graph.start_node_id, "start");
    }

    #[test]
    fn test_nothing_survives_yields_default() {
        let graph = normalize_graph(&json!({ "nodes": [{ "id": "x", "body": "" }] }));
        assert_eq!(graph, default_graph());
        assert_eq!(normalize_graph(&json!("garbage")), default_graph());
    }

    #[test]
    fn test_top_level_coordinates_and_snake_case_keys() {
        let raw = json!({
            "start_node_id": "a",
            "max_depth": 2,
            "nodes": [{ "id": "a", "body": "x", "kind": "message", "x": 5, "auto_send": true }],
            "edges": []
        });
        let graph = normalize_graph(&raw);
        assert_eq!(graph.max_depth, 2);
        assert!(graph.nodes[0].auto_send);
        assert_eq!(graph.nodes[0].position.x, 5.0);
        assert_eq!(graph.nodes[0].position.y, 0.0);
    }

    #[test]
    fn test_duplicate_ids_first_wins() {
        let raw = json!({
            "startNodeId": "a",
            "nodes": [
                { "id": "a", "body": "first", "kind": "message" },
                { "id": "a", "body": "second", "kind": "message" }
            ],
            "edges": [
                { "id": "e", "fromNodeId": "a", "toNodeId": "a", "trigger": "fallback" },
                { "id": "e", "fromNodeId": "a", "toNodeId": "a", "trigger": "timer" }
            ]
        });
        let graph = normalize_graph(&raw);
        assert_eq!(graph.nodes.len(), 1);
        assert_eq!(graph.nodes[0].body, "first");
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.edges[0].trigger, EdgeTrigger::Fallback);
    }

    #[test]
    fn test_normalization_is_idempotent() {
        let samples = vec![
            raw_graph(),
            json!({ "nodes": [{ "id": "a", "kind": "??", "body": "b", "delayMinutes": "30" }],
                    "edges": [{ "id": "e", "fromNodeId": "a", "toNodeId": "zz" }] }),
            json!(null),
            serde_json::to_value(default_graph()).unwrap(),
        ];
        for raw in samples {
            let once = normalize_graph(&raw);
            let twice_raw = serde_json::to_value(&once).unwrap();
            let twice = normalize_graph_with_diagnostics(&twice_raw);
            assert_eq!(once, twice.graph);
            assert!(twice.is_clean(), "{:?}", twice.diagnostics);
        }
    }

    #[test]
    fn test_referential_integrity() {
        let raw = json!({
            "startNodeId": "a",
            "nodes": [{ "id": "a", "body": "x", "kind": "message" }, { "id": "b", "body": "", "kind": "message" }],
            "edges": [
                { "id": "e1", "fromNodeId": "a", "toNodeId": "b", "trigger": "fallback" },
                { "id": "e2", "fromNodeId": "b", "toNodeId": "a", "trigger": "fallback" },
                { "id": "e3", "fromNodeId": "a", "toNodeId": "a", "trigger": "fallback" }
            ]
        });
        let graph = normalize_graph(&raw);
        assert!(graph.node(&graph.start_node_id).is_some());
        for edge in &graph.edges {
            assert!(graph.node(&edge.from_node_id).is_some());
            assert!(graph.node(&edge.to_node_id).is_some());
        }
        assert_eq!(graph.edges.len(), 1);
    }

    #[test]
    fn test_deserialize_goes_through_normalizer() {
        let graph: FlowGraph = serde_json::from_value(json!({ "maxDepth": 9 })).unwrap();
        assert_eq!(graph, default_graph());
    }
}
