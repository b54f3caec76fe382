use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::normalizer::normalize_graph;

/// Inclusive upper bound for `delayMinutes` and `waitMinutes` (7 days).
pub const MAX_MINUTES: u32 = 10_080;
pub const MIN_DEPTH: u32 = 1;
pub const MAX_DEPTH: u32 = 5;
pub const MIN_PRIORITY: u32 = 1;
pub const MAX_PRIORITY: u32 = 100;
pub const GRAPH_VERSION: u32 = 1;

/// A directed conversation graph: outbound messages joined by conditional edges.
///
/// Deserialization always goes through the lenient normalizer, so any JSON
/// value produces a usable graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "serde_json::Value")]
pub struct FlowGraph {
    pub version: u32,
    pub max_depth: u32,
    pub start_node_id: String,
    pub nodes: Vec<FlowNode>,
    pub edges: Vec<FlowEdge>,
}

impl From<serde_json::Value> for FlowGraph {
    fn from(raw: serde_json::Value) -> Self {
        normalize_graph(&raw)
    }
}

impl FlowGraph {
    pub fn node(&self, id: &str) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn start_node(&self) -> Option<&FlowNode> {
        self.node(&self.start_node_id)
    }

    /// Outgoing edges of `node_id` in insertion order.
    pub fn edges_from<'a>(&'a self, node_id: &str) -> impl Iterator<Item = &'a FlowEdge> + 'a {
        let node_id = node_id.to_owned();
        self.edges.iter().filter(move |e| e.from_node_id == node_id)
    }

    pub fn first_terminal(&self) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.kind == NodeKind::Terminal)
    }
}

/// A point in the conversation: an outbound message or the end of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowNode {
    pub id: String,
    pub kind: NodeKind,
    pub title: String,
    pub subject: String,
    pub body: String,
    pub auto_send: bool,
    pub delay_minutes: u32,
    pub position: Position,
}

impl FlowNode {
    pub fn is_terminal(&self) -> bool {
        self.kind == NodeKind::Terminal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Message,
    Terminal,
}

/// Editor canvas coordinates; no effect on flow semantics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A directed, conditional transition between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowEdge {
    pub id: String,
    pub from_node_id: String,
    pub to_node_id: String,
    pub trigger: EdgeTrigger,
    #[serde(with = "intent_or_empty")]
    pub intent: Option<ReplyIntent>,
    pub wait_minutes: u32,
    pub confidence_threshold: f64,
    pub priority: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeTrigger {
    Intent,
    Timer,
    Fallback,
}

/// Classified intent of an inbound reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyIntent {
    Question,
    Interest,
    Objection,
    Unsubscribe,
    Other,
}

impl ReplyIntent {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "question" => Some(ReplyIntent::Question),
            "interest" => Some(ReplyIntent::Interest),
            "objection" => Some(ReplyIntent::Objection),
            "unsubscribe" => Some(ReplyIntent::Unsubscribe),
            "other" => Some(ReplyIntent::Other),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReplyIntent::Question => "question",
            ReplyIntent::Interest => "interest",
            ReplyIntent::Objection => "objection",
            ReplyIntent::Unsubscribe => "unsubscribe",
            ReplyIntent::Other => "other",
        }
    }
}

/// Edge intents persist as `""` when unset.
mod intent_or_empty {
    use super::ReplyIntent;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        intent: &Option<ReplyIntent>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(intent.map(|i| i.as_str()).unwrap_or(""))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<ReplyIntent>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.as_deref().and_then(ReplyIntent::parse))
    }
}

/// An inbound trigger delivered to a session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FlowEvent {
    Intent {
        intent: ReplyIntent,
        confidence: f64,
    },
    TimerElapsed {
        #[serde(rename = "elapsedMinutes")]
        elapsed_minutes: u32,
    },
}

impl FlowEvent {
    pub fn label(&self) -> &'static str {
        match self {
            FlowEvent::Intent { .. } => "intent",
            FlowEvent::TimerElapsed { .. } => "timer_elapsed",
        }
    }
}

/// Versioned draft/published wrapper around a graph, one per experiment variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMap {
    pub id: Uuid,
    pub brand_id: String,
    pub campaign_id: String,
    pub experiment_id: String,
    pub name: String,
    pub status: MapStatus,
    pub draft_graph: FlowGraph,
    pub published_graph: Option<FlowGraph>,
    pub published_revision: u32,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapStatus {
    Draft,
    Published,
    Archived,
}

/// The live traversal of a published graph for one lead in one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSession {
    pub id: Uuid,
    pub run_id: String,
    pub lead_id: String,
    pub map_id: Uuid,
    pub state: SessionState,
    pub current_node_id: String,
    pub turn_count: u32,
    pub last_intent: Option<ReplyIntent>,
    pub last_confidence: Option<f64>,
    /// Published revision this session is pinned to.
    pub map_revision: u32,
    pub ended_reason: Option<String>,
    pub last_node_entered_at: DateTime<Utc>,
    /// Storage version, bumped on every committed write.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    WaitingManual,
    Completed,
    Failed,
}

impl SessionState {
    pub fn is_closed(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Active => "active",
            SessionState::WaitingManual => "waiting_manual",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
        }
    }
}

/// Append-only audit record attached to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationEvent {
    pub id: Uuid,
    pub session_id: Uuid,
    pub run_id: String,
    pub event_type: ConversationEventType,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl ConversationEvent {
    pub fn new(
        session: &ConversationSession,
        event_type: ConversationEventType,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: session.id,
            run_id: session.run_id.clone(),
            event_type,
            payload,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationEventType {
    SessionStarted,
    Transitioned,
    NoTransition,
    Approved,
    Completed,
    Failed,
}
