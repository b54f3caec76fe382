//! Starter template used for new maps and as the last resort of the normalizer.

use crate::types::{
    EdgeTrigger, FlowEdge, FlowGraph, FlowNode, NodeKind, Position, ReplyIntent, GRAPH_VERSION,
    MAX_PRIORITY,
};

pub const DEFAULT_MAX_DEPTH: u32 = 5;

pub const START_NODE_ID: &str = "start";
pub const TERMINAL_NODE_ID: &str = "end";

const NUDGE_WAIT_MINUTES: u32 = 1440;
const NUDGE_FOLLOWUP_WAIT_MINUTES: u32 = 2880;

/// Builds the canonical branching starter graph.
///
/// The opener branches on interest, question and objection replies, sends
/// unsubscribes straight to the terminal node and nudges after a day of
/// silence. Every non-terminal leaf falls back to the terminal node.
pub fn default_graph() -> FlowGraph {
    let nodes = vec![
        message(
            START_NODE_ID,
            "Opening email",
            "Quick question about {{company}}",
            "Hi {{first_name}},\n\nI noticed {{company}} is growing its team and wanted to share how we help similar companies book more meetings.\n\nWorth a quick chat?",
            true,
            (0.0, 0.0),
        ),
        message(
            "interest",
            "Interested reply",
            "Re: Quick question about {{company}}",
            "Great to hear, {{first_name}}! Here is a link to grab 20 minutes on my calendar: {{booking_link}}",
            false,
            (-320.0, 220.0),
        ),
        message(
            "question",
            "Answer question",
            "Re: Quick question about {{company}}",
            "Good question, {{first_name}}. Happy to walk you through the details. Would a short call this week work?",
            false,
            (0.0, 220.0),
        ),
        message(
            "objection",
            "Handle objection",
            "Re: Quick question about {{company}}",
            "Totally understand, {{first_name}}. Many teams felt the same before seeing the results. Open to a 10 minute overview later this quarter?",
            false,
            (320.0, 220.0),
        ),
        message(
            "nudge",
            "No-reply nudge",
            "Following up",
            "Hi {{first_name}}, just bumping this to the top of your inbox. Any interest?",
            true,
            (640.0, 220.0),
        ),
        FlowNode {
            id: TERMINAL_NODE_ID.to_string(),
            kind: NodeKind::Terminal,
            title: "End conversation".to_string(),
            subject: String::new(),
            body: String::new(),
            auto_send: false,
            delay_minutes: 0,
            position: Position { x: 0.0, y: 480.0 },
        },
    ];

    let edges = vec![
        intent_edge("start-interest", START_NODE_ID, "interest", ReplyIntent::Interest, 0.65, 1),
        intent_edge("start-question", START_NODE_ID, "question", ReplyIntent::Question, 0.65, 2),
        intent_edge("start-objection", START_NODE_ID, "objection", ReplyIntent::Objection, 0.7, 3),
        intent_edge(
            "start-unsubscribe",
            START_NODE_ID,
            TERMINAL_NODE_ID,
            ReplyIntent::Unsubscribe,
            0.5,
            4,
        ),
        timer_edge("start-nudge", START_NODE_ID, "nudge", NUDGE_WAIT_MINUTES, 5),
        timer_edge(
            "nudge-end",
            "nudge",
            TERMINAL_NODE_ID,
            NUDGE_FOLLOWUP_WAIT_MINUTES,
            1,
        ),
        fallback_edge("interest-end", "interest"),
        fallback_edge("question-end", "question"),
        fallback_edge("objection-end", "objection"),
        fallback_edge("nudge-fallback", "nudge"),
    ];

    FlowGraph {
        version: GRAPH_VERSION,
        max_depth: DEFAULT_MAX_DEPTH,
        start_node_id: START_NODE_ID.to_string(),
        nodes,
        edges,
    }
}

fn message(
    id: &str,
    title: &str,
    subject: &str,
    body: &str,
    auto_send: bool,
    (x, y): (f64, f64),
) -> FlowNode {
    FlowNode {
        id: id.to_string(),
        kind: NodeKind::Message,
        title: title.to_string(),
        subject: subject.to_string(),
        body: body.to_string(),
        auto_send,
        delay_minutes: 0,
        position: Position { x, y },
    }
}

fn intent_edge(
    id: &str,
    from: &str,
    to: &str,
    intent: ReplyIntent,
    threshold: f64,
    priority: u32,
) -> FlowEdge {
    FlowEdge {
        id: id.to_string(),
        from_node_id: from.to_string(),
        to_node_id: to.to_string(),
        trigger: EdgeTrigger::Intent,
        intent: Some(intent),
        wait_minutes: 0,
        confidence_threshold: threshold,
        priority,
    }
}

fn timer_edge(id: &str, from: &str, to: &str, wait_minutes: u32, priority: u32) -> FlowEdge {
    FlowEdge {
        id: id.to_string(),
        from_node_id: from.to_string(),
        to_node_id: to.to_string(),
        trigger: EdgeTrigger::Timer,
        intent: None,
        wait_minutes,
        confidence_threshold: 0.0,
        priority,
    }
}

fn fallback_edge(id: &str, from: &str) -> FlowEdge {
    FlowEdge {
        id: id.to_string(),
        from_node_id: from.to_string(),
        to_node_id: TERMINAL_NODE_ID.to_string(),
        trigger: EdgeTrigger::Fallback,
        intent: None,
        wait_minutes: 0,
        confidence_threshold: 0.0,
        priority: MAX_PRIORITY,
    }
}
