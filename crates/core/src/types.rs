use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Analytics event emitted for every conversation lifecycle change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowAnalyticsEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub run_id: Option<String>,
    pub lead_id: Option<String>,
    pub session_id: Option<Uuid>,
    pub map_id: Option<Uuid>,
    pub node_id: Option<String>,
    pub detail: serde_json::Value,
    pub source_node: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // Map events
    MapCreated,
    DraftSaved,
    MapPublished,
    MapArchived,
    // Session events
    SessionStarted,
    SessionAdvanced,
    SessionWaitingManual,
    SessionApproved,
    SessionCompleted,
    SessionFailed,
    SessionNoTransition,
}
