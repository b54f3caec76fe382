//! Per-session state machine: creation, event application, approval, cancellation.
//!
//! Everything here is synchronous and side-effect free apart from the session
//! passed in. Persistence and locking live in [`crate::engine`].

use chrono::{DateTime, Utc};
use outreach_core::config::UnsubscribePolicy;
use outreach_core::{OutreachError, OutreachResult};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::resolver::resolve_edge;
use crate::state_machine::SessionStateMachine;
use crate::types::{
    ConversationMap, ConversationSession, FlowEvent, FlowGraph, ReplyIntent, SessionState,
};

/// Values recorded in `ConversationSession::ended_reason`.
pub mod ended_reason {
    pub const REACHED_TERMINAL: &str = "reached_terminal";
    pub const MAX_DEPTH_EXCEEDED: &str = "max_depth_exceeded";
    pub const UNSUBSCRIBE_WITHOUT_PATH: &str = "unsubscribe_without_terminal_path";
    pub const NODE_MISSING: &str = "node_missing";
}

/// What applying one event did to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    pub outcome: TransitionOutcome,
    pub edge_id: Option<String>,
    pub from_node_id: String,
    pub to_node_id: String,
    pub state: SessionState,
    pub turn_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionOutcome {
    /// The session moved along an edge.
    Advanced,
    /// No edge matched; the session waits for a later event.
    NoMatch,
    /// Timer event on a session whose message is still awaiting approval.
    Deferred,
    /// The session was stopped as failed.
    Stopped,
}

/// Opens a session for `lead_id` at the start node of the map's published graph.
///
/// The session is pinned to the current published revision.
pub fn start_session(
    run_id: &str,
    lead_id: &str,
    map: &ConversationMap,
) -> OutreachResult<ConversationSession> {
    let graph = match (&map.published_graph, map.published_revision) {
        (Some(graph), revision) if revision > 0 => graph,
        _ => {
            return Err(OutreachError::NoPublishedMap {
                experiment_id: map.experiment_id.clone(),
            })
        }
    };

    let start = graph.start_node().ok_or_else(|| {
        OutreachError::Internal(anyhow::anyhow!(
            "start node {} missing from published graph of map {}",
            graph.start_node_id,
            map.id
        ))
    })?;

    let (state, ended_reason) = if start.is_terminal() {
        (
            SessionState::Completed,
            Some(ended_reason::REACHED_TERMINAL.to_string()),
        )
    } else if start.auto_send {
        (SessionState::Active, None)
    } else {
        (SessionState::WaitingManual, None)
    };

    let now = Utc::now();
    let session = ConversationSession {
        id: Uuid::new_v4(),
        run_id: run_id.to_string(),
        lead_id: lead_id.to_string(),
        map_id: map.id,
        state,
        current_node_id: start.id.clone(),
        turn_count: 0,
        last_intent: None,
        last_confidence: None,
        map_revision: map.published_revision,
        ended_reason,
        last_node_entered_at: now,
        version: 0,
        created_at: now,
        updated_at: now,
    };

    info!(
        session_id = %session.id,
        run_id = run_id,
        lead_id = lead_id,
        revision = session.map_revision,
        state = session.state.as_str(),
        "Session started"
    );

    Ok(session)
}

/// Applies `event` with the default unsubscribe policy (fail).
pub fn advance_session(
    session: &mut ConversationSession,
    graph: &FlowGraph,
    event: &FlowEvent,
) -> OutreachResult<Transition> {
    advance_session_with_policy(session, graph, event, UnsubscribePolicy::Fail)
}

/// Applies one inbound event to `session`.
///
/// Closed sessions are rejected. Each resolved edge costs one turn; a turn
/// beyond `graph.max_depth` fails the session without moving it.
pub fn advance_session_with_policy(
    session: &mut ConversationSession,
    graph: &FlowGraph,
    event: &FlowEvent,
    policy: UnsubscribePolicy,
) -> OutreachResult<Transition> {
    ensure_open(session)?;
    let now = Utc::now();

    if let FlowEvent::Intent { intent, confidence } = event {
        session.last_intent = Some(*intent);
        session.last_confidence = Some(*confidence);
        session.updated_at = now;
    }

    if graph.node(&session.current_node_id).is_none() {
        warn!(
            session_id = %session.id,
            node_id = %session.current_node_id,
            "Current node missing from graph"
        );
        return fail(session, ended_reason::NODE_MISSING, None, now);
    }

    if session.state == SessionState::WaitingManual
        && matches!(event, FlowEvent::TimerElapsed { .. })
    {
        return Ok(stay(session, TransitionOutcome::Deferred));
    }

    let Some(edge) = resolve_edge(graph, &session.current_node_id, event) else {
        if let FlowEvent::Intent {
            intent: ReplyIntent::Unsubscribe,
            ..
        } = event
        {
            return unsubscribe_without_edge(session, graph, policy, now);
        }
        return Ok(stay(session, TransitionOutcome::NoMatch));
    };

    if session.turn_count + 1 > graph.max_depth {
        warn!(
            session_id = %session.id,
            turn_count = session.turn_count,
            max_depth = graph.max_depth,
            "Conversation depth exhausted"
        );
        return fail(
            session,
            ended_reason::MAX_DEPTH_EXCEEDED,
            Some(edge.id.clone()),
            now,
        );
    }

    enter_node(session, graph, &edge.to_node_id, Some(edge.id.clone()), true, now)
}

/// Releases a session held for human approval.
///
/// The approved message goes out now, so the node's timers start counting
/// from the approval rather than from when the node was entered.
pub fn approve_send(session: &mut ConversationSession) -> OutreachResult<()> {
    ensure_open(session)?;
    if session.state != SessionState::WaitingManual {
        return Err(OutreachError::InvalidTransition {
            from: session.state.as_str().to_string(),
            to: SessionState::Active.as_str().to_string(),
        });
    }
    let mut machine = SessionStateMachine::new(session.state);
    machine.transition(SessionState::Active)?;
    let now = Utc::now();
    session.state = machine.state;
    session.last_node_entered_at = now;
    session.updated_at = now;
    info!(session_id = %session.id, "Send approved");
    Ok(())
}

/// Externally stops an open session, e.g. when its run is canceled.
pub fn cancel_session(session: &mut ConversationSession, reason: &str) -> OutreachResult<()> {
    ensure_open(session)?;
    fail(session, reason, None, Utc::now()).map(|_| ())
}

fn ensure_open(session: &ConversationSession) -> OutreachResult<()> {
    if session.state.is_closed() {
        return Err(OutreachError::SessionClosed {
            session_id: session.id,
            state: session.state.as_str().to_string(),
        });
    }
    Ok(())
}

fn unsubscribe_without_edge(
    session: &mut ConversationSession,
    graph: &FlowGraph,
    policy: UnsubscribePolicy,
    now: DateTime<Utc>,
) -> OutreachResult<Transition> {
    warn!(
        session_id = %session.id,
        node_id = %session.current_node_id,
        ?policy,
        "Unsubscribe reply has no path out of node"
    );
    match (policy, graph.first_terminal()) {
        (UnsubscribePolicy::RouteToTerminal, Some(terminal)) => {
            // Forced completion: only spends a turn if the budget has one left.
            let terminal_id = terminal.id.clone();
            let counts_turn = session.turn_count < graph.max_depth;
            enter_node(session, graph, &terminal_id, None, counts_turn, now)
        }
        _ => fail(session, ended_reason::UNSUBSCRIBE_WITHOUT_PATH, None, now),
    }
}

fn enter_node(
    session: &mut ConversationSession,
    graph: &FlowGraph,
    node_id: &str,
    edge_id: Option<String>,
    counts_turn: bool,
    now: DateTime<Utc>,
) -> OutreachResult<Transition> {
    let Some(node) = graph.node(node_id) else {
        return fail(session, ended_reason::NODE_MISSING, edge_id, now);
    };

    let target = if node.is_terminal() {
        SessionState::Completed
    } else if node.auto_send {
        SessionState::Active
    } else {
        SessionState::WaitingManual
    };

    let mut machine = SessionStateMachine::new(session.state);
    machine.transition(target)?;

    let from_node_id = std::mem::replace(&mut session.current_node_id, node.id.clone());
    session.state = machine.state;
    if counts_turn {
        session.turn_count += 1;
    }
    session.last_node_entered_at = now;
    session.updated_at = now;
    if target == SessionState::Completed {
        session.ended_reason = Some(ended_reason::REACHED_TERMINAL.to_string());
    }

    info!(
        session_id = %session.id,
        from = %from_node_id,
        to = %session.current_node_id,
        edge_id = edge_id.as_deref().unwrap_or("-"),
        turn = session.turn_count,
        state = session.state.as_str(),
        "Session advanced"
    );

    Ok(Transition {
        outcome: TransitionOutcome::Advanced,
        edge_id,
        from_node_id,
        to_node_id: session.current_node_id.clone(),
        state: session.state,
        turn_count: session.turn_count,
    })
}

fn fail(
    session: &mut ConversationSession,
    reason: &str,
    edge_id: Option<String>,
    now: DateTime<Utc>,
) -> OutreachResult<Transition> {
    let mut machine = SessionStateMachine::new(session.state);
    machine.transition(SessionState::Failed)?;
    session.state = machine.state;
    session.ended_reason = Some(reason.to_string());
    session.updated_at = now;

    info!(session_id = %session.id, reason = reason, "Session failed");

    Ok(Transition {
        outcome: TransitionOutcome::Stopped,
        edge_id,
        from_node_id: session.current_node_id.clone(),
        to_node_id: session.current_node_id.clone(),
        state: session.state,
        turn_count: session.turn_count,
    })
}

fn stay(session: &ConversationSession, outcome: TransitionOutcome) -> Transition {
    Transition {
        outcome,
        edge_id: None,
        from_node_id: session.current_node_id.clone(),
        to_node_id: session.current_node_id.clone(),
        state: session.state,
        turn_count: session.turn_count,
    }
}
