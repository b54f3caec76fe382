//! Single-file JSON store for single-node deployments.
//!
//! The whole state lives in memory behind one async mutex. Every mutation is
//! built on a copy, flushed to disk (sibling temp file, then rename), and only
//! then swapped in, so a failed write leaves memory and disk in agreement.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use outreach_core::{OutreachError, OutreachResult};
use outreach_flow::store::ConversationStore;
use outreach_flow::types::{
    ConversationEvent, ConversationMap, ConversationSession, FlowGraph, MapStatus,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileState {
    #[serde(default)]
    maps: HashMap<String, ConversationMap>,
    /// Published snapshots keyed by `"{map_id}:{revision}"`.
    #[serde(default)]
    revisions: HashMap<String, FlowGraph>,
    #[serde(default)]
    sessions: HashMap<Uuid, ConversationSession>,
    #[serde(default)]
    events: HashMap<String, Vec<ConversationEvent>>,
}

impl FileState {
    fn has_lead(&self, run_id: &str, lead_id: &str) -> bool {
        self.sessions
            .values()
            .any(|s| s.run_id == run_id && s.lead_id == lead_id)
    }
}

fn revision_key(map_id: Uuid, revision: u32) -> String {
    format!("{map_id}:{revision}")
}

pub struct FileStore {
    path: PathBuf,
    state: Mutex<FileState>,
}

impl FileStore {
    /// Opens `path`, creating parent directories. A missing file is an empty store.
    pub async fn open(path: impl AsRef<Path>) -> OutreachResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let state = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => FileState::default(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => FileState::default(),
            Err(e) => return Err(e.into()),
        };

        info!(
            path = %path.display(),
            maps = state.maps.len(),
            sessions = state.sessions.len(),
            "File conversation store opened"
        );

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    async fn flush(&self, state: &FileState) -> OutreachResult<()> {
        let json = serde_json::to_vec_pretty(state)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        metrics::counter!("store.file.flushes").increment(1);
        debug!(path = %self.path.display(), bytes = json.len(), "Store flushed");
        Ok(())
    }

    /// Persists `next` and makes it the live state. On error `state` is untouched.
    async fn commit(&self, state: &mut FileState, next: FileState) -> OutreachResult<()> {
        self.flush(&next).await?;
        *state = next;
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for FileStore {
    fn backend(&self) -> &'static str {
        "file"
    }

    async fn get_map_by_experiment(
        &self,
        experiment_id: &str,
    ) -> OutreachResult<Option<ConversationMap>> {
        Ok(self.state.lock().await.maps.get(experiment_id).cloned())
    }

    async fn upsert_draft(&self, map: &ConversationMap) -> OutreachResult<ConversationMap> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let stored = next
            .maps
            .entry(map.experiment_id.clone())
            .and_modify(|stored| {
                stored.draft_graph = map.draft_graph.clone();
                stored.name = map.name.clone();
                stored.updated_at = map.updated_at;
            })
            .or_insert_with(|| map.clone())
            .clone();
        self.commit(&mut state, next).await?;
        Ok(stored)
    }

    async fn publish(&self, map: &ConversationMap) -> OutreachResult<()> {
        let mut state = self.state.lock().await;
        let graph = map
            .published_graph
            .clone()
            .ok_or_else(|| OutreachError::Storage("publish without a published graph".into()))?;

        let mut next = state.clone();
        let stored = next
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
        stored.published_graph = Some(graph.clone());
        stored.published_revision = map.published_revision;
        stored.published_at = map.published_at;
        stored.status = map.status;
        stored.updated_at = map.updated_at;

        next.revisions
            .insert(revision_key(map.id, map.published_revision), graph);
        self.commit(&mut state, next).await
    }

    async fn archive_map(&self, map: &ConversationMap) -> OutreachResult<()> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let stored = next
            .maps
            .get_mut(&map.experiment_id)
            .ok_or_else(|| OutreachError::MapNotFound {
                experiment_id: map.experiment_id.clone(),
            })?;
        stored.status = MapStatus::Archived;
        stored.updated_at = map.updated_at;
        self.commit(&mut state, next).await
    }

    async fn get_published_graph(
        &self,
        map_id: Uuid,
        revision: u32,
    ) -> OutreachResult<Option<FlowGraph>> {
        Ok(self
            .state
            .lock()
            .await
            .revisions
            .get(&revision_key(map_id, revision))
            .cloned())
    }

    async fn create_session(&self, session: &ConversationSession) -> OutreachResult<()> {
        let mut state = self.state.lock().await;
        if state.has_lead(&session.run_id, &session.lead_id) {
            return Err(OutreachError::SessionExists {
                run_id: session.run_id.clone(),
                lead_id: session.lead_id.clone(),
            });
        }
        let mut next = state.clone();
        next.sessions.insert(session.id, session.clone());
        self.commit(&mut state, next).await
    }

    async fn get_session(&self, session_id: Uuid) -> OutreachResult<Option<ConversationSession>> {
        Ok(self.state.lock().await.sessions.get(&session_id).cloned())
    }

    async fn update_session(
        &self,
        session: &ConversationSession,
        expected_version: u64,
    ) -> OutreachResult<()> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let stored = next
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
        self.commit(&mut state, next).await
    }

    async fn list_open_sessions(&self) -> OutreachResult<Vec<ConversationSession>> {
        Ok(self
            .state
            .lock()
            .await
            .sessions
            .values()
            .filter(|s| !s.state.is_closed())
            .cloned()
            .collect())
    }

    async fn append_event(&self, event: &ConversationEvent) -> OutreachResult<()> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        next.events
            .entry(event.run_id.clone())
            .or_default()
            .push(event.clone());
        self.commit(&mut state, next).await
    }

    async fn list_events_by_run(&self, run_id: &str) -> OutreachResult<Vec<ConversationEvent>> {
        Ok(self
            .state
            .lock()
            .await
            .events
            .get(run_id)
            .cloned()
            .unwrap_or_default())
    }
}
