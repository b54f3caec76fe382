//! Persistence boundary for maps, sessions, and the audit log.
//!
//! Backends are picked once at startup and injected as
//! `Arc<dyn ConversationStore>`. The in-memory backend lives here; file and
//! Redis backends live in `outreach-store`.

use async_trait::async_trait;
use dashmap::DashMap;
use outreach_core::{OutreachError, OutreachResult};
use tracing::info;
use uuid::Uuid;

use crate::types::{ConversationEvent, ConversationMap, ConversationSession, FlowGraph, MapStatus};

/// Storage contract. Every method is atomic for the entity it touches.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Short backend name for logs.
    fn backend(&self) -> &'static str;

    async fn get_map_by_experiment(
        &self,
        experiment_id: &str,
    ) -> OutreachResult<Option<ConversationMap>>;

    /// Inserts `map` if its experiment has none yet; otherwise replaces only
    /// the stored draft graph and name. Returns the stored map.
    async fn upsert_draft(&self, map: &ConversationMap) -> OutreachResult<ConversationMap>;

    /// Commits the publish fields of `map` and snapshots its published graph
    /// under its revision. Fails with `Conflict` unless the stored revision is
    /// exactly one behind.
    async fn publish(&self, map: &ConversationMap) -> OutreachResult<()>;

    /// Marks the experiment's map archived, taking `status` and `updatedAt`
    /// from `map`. Fails with `MapNotFound` when the experiment has no map.
    async fn archive_map(&self, map: &ConversationMap) -> OutreachResult<()>;

    async fn get_published_graph(
        &self,
        map_id: Uuid,
        revision: u32,
    ) -> OutreachResult<Option<FlowGraph>>;

    /// Fails with `SessionExists` when the (run, lead) pair already has one.
    async fn create_session(&self, session: &ConversationSession) -> OutreachResult<()>;

    async fn get_session(&self, session_id: Uuid) -> OutreachResult<Option<ConversationSession>>;

    /// Writes `session` only if the stored version equals `expected_version`.
    async fn update_session(
        &self,
        session: &ConversationSession,
        expected_version: u64,
    ) -> OutreachResult<()>;

    /// Sessions that are neither completed nor failed.
    async fn list_open_sessions(&self) -> OutreachResult<Vec<ConversationSession>>;

    async fn append_event(&self, event: &ConversationEvent) -> OutreachResult<()>;

    /// Events of a run in append order.
    async fn list_events_by_run(&self, run_id: &str) -> OutreachResult<Vec<ConversationEvent>>;
}

/// Thread-safe in-memory store backed by DashMap. Used by tests and the
/// `memory` backend; contents vanish with the process.
#[derive(Default)]
pub struct MemoryStore {
    maps: DashMap<String, ConversationMap>,
    revisions: DashMap<(Uuid, u32), FlowGraph>,
    sessions: DashMap<Uuid, ConversationSession>,
    leads: DashMap<(String, String), Uuid>,
    events: DashMap<String, Vec<ConversationEvent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        info!("Memory conversation store initialized");
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get_map_by_experiment(
        &self,
        experiment_id: &str,
    ) -> OutreachResult<Option<ConversationMap>> {
        Ok(self.maps.get(experiment_id).map(|r| r.value().clone()))
    }

    async fn upsert_draft(&self, map: &ConversationMap) -> OutreachResult<ConversationMap> {
        let entry = self
            .maps
            .entry(map.experiment_id.clone())
            .and_modify(|stored| {
                stored.draft_graph = map.draft_graph.clone();
                stored.name = map.name.clone();
                stored.updated_at = map.updated_at;
            })
            .or_insert_with(|| map.clone());
        Ok(entry.value().clone())
    }

    async fn publish(&self, map: &ConversationMap) -> OutreachResult<()> {
        let mut stored = self
            .maps
            .get_mut(&map.experiment_id)
            .ok_or_else(|| OutreachError::MapNotFound {
                experiment_id: map.experiment_id.clone(),
            })?;
        if stored.status == MapStatus::Archived {
            return Err(OutreachError::MapArchived { map_id: stored.id });
        }
        if stored.published_revision + 1 != map.published_revision {
            return Err(OutreachError::Conflict {
                entity: "conversation_map",
                id: map.id.to_string(),
            });
        }
        let graph = map
            .published_graph
            .clone()
            .ok_or_else(|| OutreachError::Storage("publish without a published graph".into()))?;

        stored.published_graph = Some(graph.clone());
        stored.published_revision = map.published_revision;
        stored.published_at = map.published_at;
        stored.status = map.status;
        stored.updated_at = map.updated_at;
        self.revisions.insert((map.id, map.published_revision), graph);
        Ok(())
    }

    async fn archive_map(&self, map: &ConversationMap) -> OutreachResult<()> {
        let mut stored = self
            .maps
            .get_mut(&map.experiment_id)
            .ok_or_else(|| OutreachError::MapNotFound {
                experiment_id: map.experiment_id.clone(),
            })?;
        stored.status = MapStatus::Archived;
        stored.updated_at = map.updated_at;
        Ok(())
    }

    async fn get_published_graph(
        &self,
        map_id: Uuid,
        revision: u32,
    ) -> OutreachResult<Option<FlowGraph>> {
        Ok(self.revisions.get(&(map_id, revision)).map(|r| r.value().clone()))
    }

    async fn create_session(&self, session: &ConversationSession) -> OutreachResult<()> {
        let key = (session.run_id.clone(), session.lead_id.clone());
        match self.leads.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(OutreachError::SessionExists {
                run_id: session.run_id.clone(),
                lead_id: session.lead_id.clone(),
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(session.id);
                self.sessions.insert(session.id, session.clone());
                Ok(())
            }
        }
    }

    async fn get_session(&self, session_id: Uuid) -> OutreachResult<Option<ConversationSession>> {
        Ok(self.sessions.get(&session_id).map(|r| r.value().clone()))
    }

    async fn update_session(
        &self,
        session: &ConversationSession,
        expected_version: u64,
    ) -> OutreachResult<()> {
        let mut stored = self
            .sessions
            .get_mut(&session.id)
            .ok_or(OutreachError::SessionNotFound {
                session_id: session.id,
            })?;
        if stored.version != expected_version {
            return Err(OutreachError::Conflict {
                entity: "conversation_session",
                id: session.id.to_string(),
            });
        }
        *stored = session.clone();
        Ok(())
    }

    async fn list_open_sessions(&self) -> OutreachResult<Vec<ConversationSession>> {
        Ok(self
            .sessions
            .iter()
            .filter(|r| !r.value().state.is_closed())
            .map(|r| r.value().clone())
            .collect())
    }

    async fn append_event(&self, event: &ConversationEvent) -> OutreachResult<()> {
        self.events
            .entry(event.run_id.clone())
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn list_events_by_run(&self, run_id: &str) -> OutreachResult<Vec<ConversationEvent>> {
        Ok(self
            .events
            .get(run_id)
            .map(|r| r.value().clone())
            .unwrap_or_default())
    }
}
