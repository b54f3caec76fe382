use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use outreach_core::config::EngineConfig;
use outreach_core::event_bus::{make_event, EventSink};
use outreach_core::types::EventType;
use outreach_core::{OutreachError, OutreachResult};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::lifecycle::{
    advance_session_with_policy, approve_send, cancel_session, start_session, Transition,
    TransitionOutcome,
};
use crate::map::publish_map;
use crate::normalizer::{normalize_graph_with_diagnostics, Diagnostic};
use crate::store::ConversationStore;
use crate::types::{
    ConversationEvent, ConversationEventType, ConversationMap, ConversationSession, EdgeTrigger,
    FlowEvent, FlowGraph, MapStatus, SessionState,
};

/// Orchestrates maps and sessions on top of a [`ConversationStore`].
///
/// Work on one session is serialized by a per-session lock, and every commit
/// is checked against the session's stored version so that writers in other
/// processes cannot interleave either.
#[derive(Clone)]
pub struct ConversationEngine {
    store: Arc<dyn ConversationStore>,
    event_sink: Arc<dyn EventSink>,
    config: EngineConfig,
    session_locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
    graphs: Arc<DashMap<(Uuid, u32), Arc<FlowGraph>>>,
}

impl std::fmt::Debug for ConversationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationEngine")
            .field("store", &self.store.backend())
            .field("locks", &self.session_locks.len())
            .field("cached_graphs", &self.graphs.len())
            .finish()
    }
}

impl ConversationEngine {
    pub fn new(store: Arc<dyn ConversationStore>, config: EngineConfig) -> Self {
        Self {
            store,
            event_sink: outreach_core::event_bus::noop_sink(),
            config,
            session_locks: Arc::new(DashMap::new()),
            graphs: Arc::new(DashMap::new()),
        }
    }

    /// Attach an event sink for emitting analytics events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    // ─── Maps ─────────────────────────────────────────────────────────────

    /// Returns the experiment's map, creating it with the default graph the
    /// first time the variant is opened.
    pub async fn open_map(
        &self,
        brand_id: &str,
        campaign_id: &str,
        experiment_id: &str,
        name: &str,
    ) -> OutreachResult<ConversationMap> {
        if let Some(map) = self.store.get_map_by_experiment(experiment_id).await? {
            return Ok(map);
        }
        let map = ConversationMap::new(brand_id, campaign_id, experiment_id, name);
        let stored = self.store.upsert_draft(&map).await?;
        info!(map_id = %stored.id, experiment_id, "Conversation map created");
        self.emit_map(EventType::MapCreated, &stored);
        Ok(stored)
    }

    pub async fn get_map(&self, experiment_id: &str) -> OutreachResult<ConversationMap> {
        self.store
            .get_map_by_experiment(experiment_id)
            .await?
            .ok_or_else(|| OutreachError::MapNotFound {
                experiment_id: experiment_id.to_string(),
            })
    }

    /// Normalizes `raw` and stores it as the experiment's draft.
    pub async fn save_draft(
        &self,
        experiment_id: &str,
        raw: &serde_json::Value,
    ) -> OutreachResult<(ConversationMap, Vec<Diagnostic>)> {
        let mut map = self.get_map(experiment_id).await?;
        let normalized = normalize_graph_with_diagnostics(raw);
        if !normalized.is_clean() {
            warn!(
                experiment_id,
                dropped = normalized.diagnostics.len(),
                "Draft graph normalized with diagnostics"
            );
        }
        map.update_draft(normalized.graph)?;
        let stored = self.store.upsert_draft(&map).await?;
        self.emit_map(EventType::DraftSaved, &stored);
        Ok((stored, normalized.diagnostics))
    }

    /// Publishes the experiment's current draft.
    pub async fn publish(&self, experiment_id: &str) -> OutreachResult<ConversationMap> {
        let map = self.get_map(experiment_id).await?;
        let published = publish_map(&map)?;
        self.store.publish(&published).await?;
        if let Some(graph) = &published.published_graph {
            self.graphs.insert(
                (published.id, published.published_revision),
                Arc::new(graph.clone()),
            );
        }
        metrics::counter!("flow.maps.published").increment(1);
        self.emit_map(EventType::MapPublished, &published);
        Ok(published)
    }

    /// Retires the experiment's map. Its draft can no longer be edited or
    /// published and no new sessions start on it; open sessions finish on
    /// their pinned revision.
    pub async fn archive_map(&self, experiment_id: &str) -> OutreachResult<ConversationMap> {
        let mut map = self.get_map(experiment_id).await?;
        map.archive();
        self.store.archive_map(&map).await?;
        info!(map_id = %map.id, experiment_id, "Conversation map archived");
        metrics::counter!("flow.maps.archived").increment(1);
        self.emit_map(EventType::MapArchived, &map);
        Ok(map)
    }

    // ─── Sessions ─────────────────────────────────────────────────────────

    /// Opens a session for a sourced lead against the experiment's published map.
    pub async fn start_session(
        &self,
        run_id: &str,
        lead_id: &str,
        experiment_id: &str,
    ) -> OutreachResult<ConversationSession> {
        let map = self.store.get_map_by_experiment(experiment_id).await?;
        if let Some(archived) = map.as_ref().filter(|m| m.status == MapStatus::Archived) {
            return Err(OutreachError::MapArchived {
                map_id: archived.id,
            });
        }
        let map = map
            .filter(ConversationMap::is_published)
            .ok_or_else(|| OutreachError::NoPublishedMap {
                experiment_id: experiment_id.to_string(),
            })?;

        let session = start_session(run_id, lead_id, &map)?;
        self.store.create_session(&session).await?;

        metrics::counter!("flow.sessions.started").increment(1);
        self.record(
            &session,
            ConversationEventType::SessionStarted,
            json!({
                "nodeId": session.current_node_id,
                "mapRevision": session.map_revision,
                "state": session.state,
            }),
            EventType::SessionStarted,
        )
        .await;
        if session.state == SessionState::Completed {
            self.record_closed(&session).await;
        }
        Ok(session)
    }

    pub async fn get_session(&self, session_id: Uuid) -> OutreachResult<ConversationSession> {
        self.store
            .get_session(session_id)
            .await?
            .ok_or(OutreachError::SessionNotFound { session_id })
    }

    /// Applies an inbound event (classified reply or elapsed timer) to a session.
    pub async fn handle_event(
        &self,
        session_id: Uuid,
        event: FlowEvent,
    ) -> OutreachResult<Transition> {
        let policy = self.config.unsubscribe_policy;
        let (session, transition) = self
            .commit(session_id, |session, graph| {
                advance_session_with_policy(session, graph, &event, policy)
            })
            .await?;

        metrics::counter!("flow.transitions", "outcome" => outcome_label(transition.outcome))
            .increment(1);

        let (event_type, analytics) = match transition.outcome {
            TransitionOutcome::Advanced => (
                ConversationEventType::Transitioned,
                if session.state == SessionState::WaitingManual {
                    EventType::SessionWaitingManual
                } else {
                    EventType::SessionAdvanced
                },
            ),
            TransitionOutcome::Stopped => {
                (ConversationEventType::Failed, EventType::SessionFailed)
            }
            TransitionOutcome::NoMatch | TransitionOutcome::Deferred => (
                ConversationEventType::NoTransition,
                EventType::SessionNoTransition,
            ),
        };

        self.record(
            &session,
            event_type,
            json!({
                "event": event,
                "outcome": transition.outcome,
                "edgeId": transition.edge_id,
                "fromNodeId": transition.from_node_id,
                "toNodeId": transition.to_node_id,
                "turnCount": transition.turn_count,
                "state": session.state,
                "endedReason": session.ended_reason,
            }),
            analytics,
        )
        .await;

        if session.state == SessionState::Completed {
            self.record_closed(&session).await;
        }
        if session.state == SessionState::Failed {
            metrics::counter!("flow.sessions.failed").increment(1);
        }
        if session.state.is_closed() {
            self.session_locks.remove(&session_id);
        }
        Ok(transition)
    }

    /// Human approval of a held message: `waiting_manual` → `active`.
    pub async fn approve(&self, session_id: Uuid) -> OutreachResult<ConversationSession> {
        let (session, ()) = self
            .commit(session_id, |session, _| approve_send(session))
            .await?;
        self.record(
            &session,
            ConversationEventType::Approved,
            json!({ "nodeId": session.current_node_id }),
            EventType::SessionApproved,
        )
        .await;
        Ok(session)
    }

    /// Stops a session regardless of where it is in the graph.
    pub async fn cancel(
        &self,
        session_id: Uuid,
        reason: &str,
    ) -> OutreachResult<ConversationSession> {
        let (session, ()) = self
            .commit(session_id, |session, _| cancel_session(session, reason))
            .await?;
        metrics::counter!("flow.sessions.failed").increment(1);
        self.record(
            &session,
            ConversationEventType::Failed,
            json!({ "endedReason": session.ended_reason, "nodeId": session.current_node_id }),
            EventType::SessionFailed,
        )
        .await;
        self.session_locks.remove(&session_id);
        Ok(session)
    }

    pub async fn list_events_by_run(&self, run_id: &str) -> OutreachResult<Vec<ConversationEvent>> {
        self.store.list_events_by_run(run_id).await
    }

    /// Feeds `timer_elapsed` events to active sessions whose current node has
    /// a timer edge that is due at `now`. Returns how many sessions moved.
    ///
    /// Sessions whose node only has fallback edges are left alone; those wait
    /// for a reply.
    pub async fn sweep_timers(&self, now: DateTime<Utc>) -> OutreachResult<usize> {
        let mut advanced = 0;
        for session in self.store.list_open_sessions().await? {
            if session.state != SessionState::Active {
                continue;
            }
            let elapsed = (now - session.last_node_entered_at).num_minutes().max(0);
            let elapsed_minutes = u32::try_from(elapsed).unwrap_or(u32::MAX);

            let graph = match self.load_graph(session.map_id, session.map_revision).await {
                Ok(graph) => graph,
                Err(e) => {
                    warn!(session_id = %session.id, error = %e, "Timer sweep skipped session");
                    continue;
                }
            };
            let due = graph.edges_from(&session.current_node_id).any(|e| {
                e.trigger == EdgeTrigger::Timer && elapsed_minutes >= e.wait_minutes
            });
            if !due {
                continue;
            }

            match self
                .handle_event(session.id, FlowEvent::TimerElapsed { elapsed_minutes })
                .await
            {
                Ok(t) if t.outcome == TransitionOutcome::Advanced => advanced += 1,
                Ok(_) => {}
                Err(e) => warn!(session_id = %session.id, error = %e, "Timer event failed"),
            }
        }
        if advanced > 0 {
            info!(advanced, "Timer sweep advanced sessions");
        }
        Ok(advanced)
    }

    // ─── Internal helpers ─────────────────────────────────────────────────

    /// Load-apply-commit under the session lock, retrying on version conflicts.
    async fn commit<T, F>(
        &self,
        session_id: Uuid,
        mut apply: F,
    ) -> OutreachResult<(ConversationSession, T)>
    where
        F: FnMut(&mut ConversationSession, &FlowGraph) -> OutreachResult<T>,
    {
        let lock = self
            .session_locks
            .entry(session_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let mut attempt = 0;
        loop {
            let mut session = self.get_session(session_id).await?;
            let graph = self.load_graph(session.map_id, session.map_revision).await?;
            let expected = session.version;

            let value = apply(&mut session, graph.as_ref())?;
            session.version = expected + 1;

            match self.store.update_session(&session, expected).await {
                Ok(()) => return Ok((session, value)),
                Err(OutreachError::Conflict { .. }) if attempt < self.config.max_advance_retries => {
                    attempt += 1;
                    warn!(session_id = %session_id, attempt, "Session write conflict, retrying");
                    metrics::counter!("flow.sessions.conflicts").increment(1);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn load_graph(&self, map_id: Uuid, revision: u32) -> OutreachResult<Arc<FlowGraph>> {
        if let Some(graph) = self.graphs.get(&(map_id, revision)) {
            return Ok(graph.clone());
        }
        let graph = self
            .store
            .get_published_graph(map_id, revision)
            .await?
            .ok_or(OutreachError::RevisionMissing { map_id, revision })?;
        let graph = Arc::new(graph);
        self.graphs.insert((map_id, revision), graph.clone());
        Ok(graph)
    }

    /// Emits the analytics event and appends the audit entry for a change that
    /// is already committed. An append failure is logged and counted but never
    /// surfaced, so callers do not retry a transition that already happened.
    async fn record(
        &self,
        session: &ConversationSession,
        event_type: ConversationEventType,
        payload: serde_json::Value,
        analytics: EventType,
    ) {
        let mut event = make_event(
            analytics,
            Some(session.run_id.clone()),
            Some(session.lead_id.clone()),
            Some(session.id),
        );
        event.map_id = Some(session.map_id);
        event.node_id = Some(session.current_node_id.clone());
        event.detail = payload.clone();
        self.event_sink.emit(event);

        if let Err(e) = self
            .store
            .append_event(&ConversationEvent::new(session, event_type, payload))
            .await
        {
            warn!(
                session_id = %session.id,
                run_id = %session.run_id,
                event_type = ?event_type,
                error = %e,
                "Audit event append failed after commit"
            );
            metrics::counter!("flow.audit.append_failures").increment(1);
        }
    }

    async fn record_closed(&self, session: &ConversationSession) {
        metrics::counter!("flow.sessions.completed").increment(1);
        self.record(
            session,
            ConversationEventType::Completed,
            json!({ "nodeId": session.current_node_id, "endedReason": session.ended_reason }),
            EventType::SessionCompleted,
        )
        .await
    }

    fn emit_map(&self, event_type: EventType, map: &ConversationMap) {
        let mut event = make_event(event_type, None, None, None);
        event.map_id = Some(map.id);
        event.detail = json!({
            "experimentId": map.experiment_id,
            "publishedRevision": map.published_revision,
        });
        self.event_sink.emit(event);
    }
}

fn outcome_label(outcome: TransitionOutcome) -> &'static str {
    match outcome {
        TransitionOutcome::Advanced => "advanced",
        TransitionOutcome::NoMatch => "no_match",
        TransitionOutcome::Deferred => "deferred",
        TransitionOutcome::Stopped => "stopped",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::ReplyIntent;
    use outreach_core::event_bus::capture_sink;
    use outreach_core::ErrorKind;

    fn engine() -> (ConversationEngine, Arc<outreach_core::event_bus::CaptureSink>) {
        let sink = capture_sink();
        let engine = ConversationEngine::new(Arc::new(MemoryStore::new()), EngineConfig::default())
            .with_event_sink(sink.clone());
        (engine, sink)
    }

    fn interest(confidence: f64) -> FlowEvent {
        FlowEvent::Intent {
            intent: ReplyIntent::Interest,
            confidence,
        }
    }

    #[tokio::test]
    async fn test_open_map_is_idempotent() {
        let (engine, sink) = engine();
        let first = engine.open_map("b", "c", "exp-1", "Variant A").await.unwrap();
        let second = engine.open_map("b", "c", "exp-1", "Other").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.name, "Variant A");
        assert_eq!(sink.count_type(EventType::MapCreated), 1);
    }

    #[tokio::test]
    async fn test_start_session_without_publish_is_blocked() {
        let (engine, _) = engine();
        engine.open_map("b", "c", "exp-1", "Variant A").await.unwrap();
        let err = engine
            .start_session("run-1", "lead-1", "exp-1")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoPublishedMap);

        let err = engine
            .start_session("run-1", "lead-1", "exp-unknown")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoPublishedMap);
    }

    #[tokio::test]
    async fn test_session_stays_on_pinned_revision() {
        let (engine, _) = engine();
        engine.open_map("b", "c", "exp-1", "Variant A").await.unwrap();
        engine.publish("exp-1").await.unwrap();
        let session = engine.start_session("run-1", "lead-1", "exp-1").await.unwrap();

        // Republish a graph where interest replies end immediately.
        engine
            .save_draft(
                "exp-1",
                &json!({
                    "startNodeId": "start",
                    "nodes": [
                        { "id": "start", "kind": "message", "body": "hi", "autoSend": true },
                        { "id": "end", "kind": "terminal" }
                    ],
                    "edges": [{ "id": "x", "fromNodeId": "start", "toNodeId": "end",
                                "trigger": "intent", "intent": "interest" }]
                }),
            )
            .await
            .unwrap();
        let republished = engine.publish("exp-1").await.unwrap();
        assert_eq!(republished.published_revision, 2);

        let transition = engine.handle_event(session.id, interest(0.9)).await.unwrap();
        assert_eq!(transition.to_node_id, "interest");
        let stored = engine.get_session(session.id).await.unwrap();
        assert_eq!(stored.map_revision, 1);
        assert_eq!(stored.state, SessionState::WaitingManual);
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn test_full_conversation_records_audit_log() {
        let (engine, sink) = engine();
        engine.open_map("b", "c", "exp-1", "Variant A").await.unwrap();
        engine.publish("exp-1").await.unwrap();
        let session = engine.start_session("run-1", "lead-1", "exp-1").await.unwrap();

        engine.handle_event(session.id, interest(0.8)).await.unwrap();
        engine.approve(session.id).await.unwrap();
        let done = engine
            .handle_event(
                session.id,
                FlowEvent::Intent {
                    intent: ReplyIntent::Other,
                    confidence: 0.4,
                },
            )
            .await
            .unwrap();
        assert_eq!(done.state, SessionState::Completed);

        let types: Vec<_> = engine
            .list_events_by_run("run-1")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(
            types,
            vec![
                ConversationEventType::SessionStarted,
                ConversationEventType::Transitioned,
                ConversationEventType::Approved,
                ConversationEventType::Transitioned,
                ConversationEventType::Completed,
            ]
        );
        assert_eq!(sink.count_type(EventType::SessionCompleted), 1);
        assert_eq!(sink.count_type(EventType::SessionWaitingManual), 1);

        let err = engine.handle_event(session.id, interest(0.9)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionClosed);
    }

    #[tokio::test]
    async fn test_cancel_blocks_further_events() {
        let (engine, _) = engine();
        engine.open_map("b", "c", "exp-1", "Variant A").await.unwrap();
        engine.publish("exp-1").await.unwrap();
        let session = engine.start_session("run-1", "lead-1", "exp-1").await.unwrap();

        let canceled = engine.cancel(session.id, "run_canceled").await.unwrap();
        assert_eq!(canceled.state, SessionState::Failed);
        assert_eq!(canceled.ended_reason.as_deref(), Some("run_canceled"));

        let err = engine.handle_event(session.id, interest(0.9)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionClosed);
    }

    #[tokio::test]
    async fn test_concurrent_events_on_one_session_serialize() {
        let (engine, _) = engine();
        engine.open_map("b", "c", "exp-1", "Variant A").await.unwrap();
        engine.publish("exp-1").await.unwrap();
        let session = engine.start_session("run-1", "lead-1", "exp-1").await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .handle_event(
                        session.id,
                        FlowEvent::Intent {
                            intent: ReplyIntent::Question,
                            confidence: 0.9,
                        },
                    )
                    .await
            }));
        }
        for handle in handles {
            let _ = handle.await.unwrap();
        }

        let stored = engine.get_session(session.id).await.unwrap();
        // start -> question (manual) -> end via fallback, then closed.
        assert_eq!(stored.turn_count, 2);
        assert_eq!(stored.state, SessionState::Completed);
    }

    #[tokio::test]
    async fn test_timer_sweep_only_fires_due_timers() {
        let (engine, _) = engine();
        engine.open_map("b", "c", "exp-1", "Variant A").await.unwrap();
        engine.publish("exp-1").await.unwrap();
        let session = engine.start_session("run-1", "lead-1", "exp-1").await.unwrap();

        let moved = engine.sweep_timers(Utc::now()).await.unwrap();
        assert_eq!(moved, 0);

        let later = Utc::now() + chrono::Duration::minutes(1441);
        let moved = engine.sweep_timers(later).await.unwrap();
        assert_eq!(moved, 1);
        let stored = engine.get_session(session.id).await.unwrap();
        assert_eq!(stored.current_node_id, "nudge");
        assert_eq!(stored.turn_count, 1);
    }

    #[tokio::test]
    async fn test_archived_map_is_frozen_but_sessions_finish() {
        let (engine, sink) = engine();
        engine.open_map("b", "c", "exp-1", "Variant A").await.unwrap();
        engine.publish("exp-1").await.unwrap();
        let session = engine.start_session("run-1", "lead-1", "exp-1").await.unwrap();

        let archived = engine.archive_map("exp-1").await.unwrap();
        assert_eq!(archived.status, MapStatus::Archived);
        assert_eq!(sink.count_type(EventType::MapArchived), 1);
        assert_eq!(
            engine.get_map("exp-1").await.unwrap().status,
            MapStatus::Archived
        );

        let err = engine.publish("exp-1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MapArchived);
        let err = engine
            .save_draft("exp-1", &json!({ "nodes": [] }))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MapArchived);
        let err = engine
            .start_session("run-1", "lead-2", "exp-1")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MapArchived);

        let transition = engine.handle_event(session.id, interest(0.9)).await.unwrap();
        assert_eq!(transition.outcome, TransitionOutcome::Advanced);

        let err = engine.archive_map("exp-missing").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MapNotFound);
    }

    /// Memory store whose audit log rejects every append.
    struct BrokenAuditStore(MemoryStore);

    #[async_trait::async_trait]
    impl ConversationStore for BrokenAuditStore {
        fn backend(&self) -> &'static str {
            "broken-audit"
        }
        async fn get_map_by_experiment(
            &self,
            experiment_id: &str,
        ) -> OutreachResult<Option<ConversationMap>> {
            self.0.get_map_by_experiment(experiment_id).await
        }
        async fn upsert_draft(&self, map: &ConversationMap) -> OutreachResult<ConversationMap> {
            self.0.upsert_draft(map).await
        }
        async fn publish(&self, map: &ConversationMap) -> OutreachResult<()> {
            self.0.publish(map).await
        }
        async fn archive_map(&self, map: &ConversationMap) -> OutreachResult<()> {
            self.0.archive_map(map).await
        }
        async fn get_published_graph(
            &self,
            map_id: Uuid,
            revision: u32,
        ) -> OutreachResult<Option<FlowGraph>> {
            self.0.get_published_graph(map_id, revision).await
        }
        async fn create_session(&self, session: &ConversationSession) -> OutreachResult<()> {
            self.0.create_session(session).await
        }
        async fn get_session(
            &self,
            session_id: Uuid,
        ) -> OutreachResult<Option<ConversationSession>> {
            self.0.get_session(session_id).await
        }
        async fn update_session(
            &self,
            session: &ConversationSession,
            expected_version: u64,
        ) -> OutreachResult<()> {
            self.0.update_session(session, expected_version).await
        }
        async fn list_open_sessions(&self) -> OutreachResult<Vec<ConversationSession>> {
            self.0.list_open_sessions().await
        }
        async fn append_event(&self, _event: &ConversationEvent) -> OutreachResult<()> {
            Err(OutreachError::Storage("audit log unavailable".into()))
        }
        async fn list_events_by_run(
            &self,
            run_id: &str,
        ) -> OutreachResult<Vec<ConversationEvent>> {
            self.0.list_events_by_run(run_id).await
        }
    }

    #[tokio::test]
    async fn test_audit_failure_does_not_fail_committed_transition() {
        let sink = capture_sink();
        let engine = ConversationEngine::new(
            Arc::new(BrokenAuditStore(MemoryStore::new())),
            EngineConfig::default(),
        )
        .with_event_sink(sink.clone());
        engine.open_map("b", "c", "exp-1", "Variant A").await.unwrap();
        engine.publish("exp-1").await.unwrap();

        let session = engine.start_session("run-1", "lead-1", "exp-1").await.unwrap();
        let transition = engine.handle_event(session.id, interest(0.9)).await.unwrap();
        assert_eq!(transition.to_node_id, "interest");
        assert_eq!(transition.turn_count, 1);

        let approved = engine.approve(session.id).await.unwrap();
        assert_eq!(approved.state, SessionState::Active);
        let canceled = engine.cancel(session.id, "run_canceled").await.unwrap();
        assert_eq!(canceled.state, SessionState::Failed);

        let stored = engine.get_session(session.id).await.unwrap();
        assert_eq!(stored.version, 3);
        assert_eq!(stored.turn_count, 1);
        assert!(engine.list_events_by_run("run-1").await.unwrap().is_empty());
        assert_eq!(sink.count_type(EventType::SessionAdvanced), 0);
        assert_eq!(sink.count_type(EventType::SessionWaitingManual), 1);
    }

    #[tokio::test]
    async fn test_save_draft_reports_diagnostics() {
        let (engine, _) = engine();
        engine.open_map("b", "c", "exp-1", "Variant A").await.unwrap();
        let (map, diagnostics) = engine
            .save_draft(
                "exp-1",
                &json!({
                    "startNodeId": "a",
                    "nodes": [
                        { "id": "a", "kind": "message", "body": "hello" },
                        { "id": "b", "kind": "message", "body": "" }
                    ],
                    "edges": [{ "id": "ab", "fromNodeId": "a", "toNodeId": "b", "trigger": "fallback" }]
                }),
            )
            .await
            .unwrap();
        assert_eq!(map.draft_graph.nodes.len(), 1);
        assert!(map.draft_graph.edges.is_empty());
        assert_eq!(diagnostics.len(), 3);
        assert!(map.published_graph.is_none());
    }
}
