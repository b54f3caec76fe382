use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub type OutreachResult<T> = Result<T, OutreachError>;

/// Lifecycle errors. Data-shape problems in graphs never surface here; the
/// normalizer resolves those by dropping elements.
#[derive(Error, Debug)]
pub enum OutreachError {
    #[error("No published conversation map for experiment {experiment_id}")]
    NoPublishedMap { experiment_id: String },

    #[error("Conversation map not found for experiment {experiment_id}")]
    MapNotFound { experiment_id: String },

    #[error("Conversation map {map_id} is archived")]
    MapArchived { map_id: Uuid },

    #[error("Published revision {revision} of map {map_id} is missing")]
    RevisionMissing { map_id: Uuid, revision: u32 },

    #[error("Session {session_id} not found")]
    SessionNotFound { session_id: Uuid },

    #[error("Session {session_id} is closed ({state})")]
    SessionClosed { session_id: Uuid, state: String },

    #[error("Session already exists for lead {lead_id} in run {run_id}")]
    SessionExists { run_id: String, lead_id: String },

    #[error("Invalid session transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Concurrent update conflict on {entity} {id}")]
    Conflict { entity: &'static str, id: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Machine-readable error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NoPublishedMap,
    MapNotFound,
    MapArchived,
    RevisionMissing,
    SessionNotFound,
    SessionClosed,
    SessionExists,
    InvalidTransition,
    Conflict,
    Storage,
    Config,
    Serialization,
    Io,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NoPublishedMap => "no_published_map",
            ErrorKind::MapNotFound => "map_not_found",
            ErrorKind::MapArchived => "map_archived",
            ErrorKind::RevisionMissing => "revision_missing",
            ErrorKind::SessionNotFound => "session_not_found",
            ErrorKind::SessionClosed => "session_closed",
            ErrorKind::SessionExists => "session_exists",
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Storage => "storage",
            ErrorKind::Config => "config",
            ErrorKind::Serialization => "serialization",
            ErrorKind::Io => "io",
            ErrorKind::Internal => "internal",
        }
    }
}

impl OutreachError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OutreachError::NoPublishedMap { .. } => ErrorKind::NoPublishedMap,
            OutreachError::MapNotFound { .. } => ErrorKind::MapNotFound,
            OutreachError::MapArchived { .. } => ErrorKind::MapArchived,
            OutreachError::RevisionMissing { .. } => ErrorKind::RevisionMissing,
            OutreachError::SessionNotFound { .. } => ErrorKind::SessionNotFound,
            OutreachError::SessionClosed { .. } => ErrorKind::SessionClosed,
            OutreachError::SessionExists { .. } => ErrorKind::SessionExists,
            OutreachError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            OutreachError::Conflict { .. } => ErrorKind::Conflict,
            OutreachError::Storage(_) => ErrorKind::Storage,
            OutreachError::Config(_) => ErrorKind::Config,
            OutreachError::Serialization(_) => ErrorKind::Serialization,
            OutreachError::Io(_) => ErrorKind::Io,
            OutreachError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Operator-facing hint on what to do next.
    pub fn hint(&self) -> &'static str {
        match self {
            OutreachError::NoPublishedMap { .. } => {
                "Publish the experiment's conversation map before launching the run"
            }
            OutreachError::MapNotFound { .. } => {
                "Open the experiment variant once to create its conversation map"
            }
            OutreachError::MapArchived { .. } => "Archived maps are read-only; create a new map",
            OutreachError::RevisionMissing { .. } => {
                "The session's pinned revision is gone from storage; inspect the map history"
            }
            OutreachError::SessionNotFound { .. } => "Check the session id",
            OutreachError::SessionClosed { .. } => {
                "Completed and failed sessions are never revived"
            }
            OutreachError::SessionExists { .. } => "A lead can only have one session per run",
            OutreachError::InvalidTransition { .. } => {
                "The session is not in a state that allows this action"
            }
            OutreachError::Conflict { .. } => "Another writer updated the record; retry",
            OutreachError::Storage(_) => "Check the storage backend is reachable and writable",
            OutreachError::Config(_) => "Check OUTREACH__* environment variables and config file",
            OutreachError::Serialization(_) => "Persisted data could not be encoded or decoded",
            OutreachError::Io(_) => "Check file permissions and disk space",
            OutreachError::Internal(_) => "Unexpected failure; see logs",
        }
    }

    /// Structured debug context for logs and API responses.
    pub fn context(&self) -> serde_json::Value {
        match self {
            OutreachError::NoPublishedMap { experiment_id }
            | OutreachError::MapNotFound { experiment_id } => {
                serde_json::json!({ "experiment_id": experiment_id })
            }
            OutreachError::MapArchived { map_id } => serde_json::json!({ "map_id": map_id }),
            OutreachError::RevisionMissing { map_id, revision } => {
                serde_json::json!({ "map_id": map_id, "revision": revision })
            }
            OutreachError::SessionNotFound { session_id } => {
                serde_json::json!({ "session_id": session_id })
            }
            OutreachError::SessionClosed { session_id, state } => {
                serde_json::json!({ "session_id": session_id, "state": state })
            }
            OutreachError::SessionExists { run_id, lead_id } => {
                serde_json::json!({ "run_id": run_id, "lead_id": lead_id })
            }
            OutreachError::InvalidTransition { from, to } => {
                serde_json::json!({ "from": from, "to": to })
            }
            OutreachError::Conflict { entity, id } => {
                serde_json::json!({ "entity": entity, "id": id })
            }
            OutreachError::Storage(msg)
            | OutreachError::Config(msg) => serde_json::json!({ "detail": msg }),
            other => serde_json::json!({ "detail": other.to_string() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_context() {
        let err = OutreachError::NoPublishedMap {
            experiment_id: "exp-1".into(),
        };
        assert_eq!(err.kind(), ErrorKind::NoPublishedMap);
        assert_eq!(err.kind().as_str(), "no_published_map");
        assert_eq!(err.context()["experiment_id"], "exp-1");
        assert!(err.hint().contains("Publish"));
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::SessionClosed).unwrap();
        assert_eq!(json, "\"session_closed\"");
    }
}
