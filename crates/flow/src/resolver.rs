use tracing::debug;

use crate::types::{EdgeTrigger, FlowEdge, FlowEvent, FlowGraph};

/// Selects the edge a session follows out of a node for a given event.
///
/// Pure function of `(graph, node, event)`; safe to share across sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct EdgeResolver;

impl EdgeResolver {
    pub fn new() -> Self {
        Self
    }

    /// Resolves the next edge out of `current_node_id`.
    ///
    /// Outgoing edges are ranked by ascending priority (stable, so insertion
    /// order breaks ties). Intent events take the first intent edge with the
    /// same intent whose threshold the confidence meets; timer events take the
    /// first timer edge whose wait has elapsed. Otherwise the first fallback
    /// edge wins, and `None` leaves the session where it is.
    pub fn resolve<'g>(
        &self,
        graph: &'g FlowGraph,
        current_node_id: &str,
        event: &FlowEvent,
    ) -> Option<&'g FlowEdge> {
        let mut candidates: Vec<&FlowEdge> = graph.edges_from(current_node_id).collect();
        candidates.sort_by_key(|e| e.priority);

        let matched = match event {
            FlowEvent::Intent { intent, confidence } => candidates.iter().copied().find(|e| {
                e.trigger == EdgeTrigger::Intent
                    && e.intent == Some(*intent)
                    && *confidence >= e.confidence_threshold
            }),
            FlowEvent::TimerElapsed { elapsed_minutes } => candidates
                .iter()
                .copied()
                .find(|e| e.trigger == EdgeTrigger::Timer && *elapsed_minutes >= e.wait_minutes),
        };

        let resolved = matched.or_else(|| {
            candidates
                .iter()
                .copied()
                .find(|e| e.trigger == EdgeTrigger::Fallback)
        });

        debug!(
            node_id = current_node_id,
            event = event.label(),
            edge_id = resolved.map(|e| e.id.as_str()).unwrap_or("none"),
            "Resolved edge"
        );

        resolved
    }
}

/// Free-function form of [`EdgeResolver::resolve`].
pub fn resolve_edge<'g>(
    graph: &'g FlowGraph,
    current_node_id: &str,
    event: &FlowEvent,
) -> Option<&'g FlowEdge> {
    EdgeResolver.resolve(graph, current_node_id, event)
}
