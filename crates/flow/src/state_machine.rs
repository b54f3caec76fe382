use outreach_core::{OutreachError, OutreachResult};
use serde::{Deserialize, Serialize};

use crate::types::SessionState;

/// Describes a single valid state transition for a conversation session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: SessionState,
    pub to: SessionState,
    pub trigger: String,
}

/// Guards the session lifecycle by enforcing a finite set of valid state
/// transitions. `completed` and `failed` have no way out.
#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    pub state: SessionState,
    pub transitions: Vec<StateTransition>,
}

impl SessionStateMachine {
    /// Creates a state machine positioned at `state` with all valid
    /// transitions pre-configured.
    pub fn new(state: SessionState) -> Self {
        use SessionState::*;

        let table = [
            // Active ->
            (Active, Active, "auto_send_node"),
            (Active, WaitingManual, "manual_send_node"),
            (Active, Completed, "terminal_node"),
            (Active, Failed, "failure"),
            // WaitingManual ->
            (WaitingManual, Active, "approved"),
            (WaitingManual, WaitingManual, "manual_send_node"),
            (WaitingManual, Completed, "terminal_node"),
            (WaitingManual, Failed, "failure"),
        ];

        let transitions = table
            .into_iter()
            .map(|(from, to, trigger)| StateTransition {
                from,
                to,
                trigger: trigger.to_string(),
            })
            .collect();

        Self { state, transitions }
    }

    /// Returns `true` if the given transition is allowed.
    pub fn can_transition(&self, from: &SessionState, to: &SessionState) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == *from && t.to == *to)
    }

    /// Attempts to move the state machine to `to`.
    pub fn transition(&mut self, to: SessionState) -> OutreachResult<()> {
        if self.can_transition(&self.state, &to) {
            self.state = to;
            Ok(())
        } else {
            Err(OutreachError::InvalidTransition {
                from: self.state.as_str().to_string(),
                to: to.as_str().to_string(),
            })
        }
    }
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new(SessionState::Active)
    }
}
