//! End-to-end conversation flows across the engine and the store backends.
//! Redis-backed cases need a running server (run with --ignored).

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use outreach_core::config::{EngineConfig, RedisConfig, UnsubscribePolicy};
    use outreach_core::event_bus::capture_sink;
    use outreach_core::types::EventType;
    use outreach_core::ErrorKind;
    use outreach_flow::store::ConversationStore;
    use outreach_flow::types::{FlowEvent, ReplyIntent, SessionState};
    use outreach_flow::{ConversationEngine, MemoryStore, TransitionOutcome};
    use outreach_store::{FileStore, RedisStore};
    use serde_json::json;
    use std::sync::Arc;

    fn reply(intent: ReplyIntent, confidence: f64) -> FlowEvent {
        FlowEvent::Intent { intent, confidence }
    }

    /// Two-step nurture graph with a hard unsubscribe dead end on step two.
    fn nurture_graph() -> serde_json::Value {
        json!({
            "maxDepth": 3,
            "startNodeId": "intro",
            "nodes": [
                { "id": "intro", "kind": "message", "subject": "Hi", "body": "Intro", "autoSend": true },
                { "id": "pitch", "kind": "message", "body": "Pitch", "autoSend": true },
                { "id": "close", "kind": "terminal", "body": "ignored" }
            ],
            "edges": [
                { "id": "intro-pitch", "fromNodeId": "intro", "toNodeId": "pitch",
                  "trigger": "intent", "intent": "interest", "confidenceThreshold": 0.6, "priority": 1 },
                { "id": "intro-wait", "fromNodeId": "intro", "toNodeId": "pitch",
                  "trigger": "timer", "waitMinutes": 60, "priority": 2 },
                { "id": "pitch-close", "fromNodeId": "pitch", "toNodeId": "close",
                  "trigger": "intent", "intent": "interest", "confidenceThreshold": 0.8, "priority": 1 }
            ]
        })
    }

    async fn launch(engine: &ConversationEngine, experiment_id: &str) {
        engine
            .open_map("brand", "campaign", experiment_id, "Nurture")
            .await
            .unwrap();
        let (_, diagnostics) = engine
            .save_draft(experiment_id, &nurture_graph())
            .await
            .unwrap();
        // Terminal body is cleared on normalization.
        assert_eq!(diagnostics.len(), 1);
        engine.publish(experiment_id).await.unwrap();
    }

    async fn run_nurture_flow(store: Arc<dyn ConversationStore>) {
        let sink = capture_sink();
        let engine = ConversationEngine::new(store, EngineConfig::default())
            .with_event_sink(sink.clone());
        launch(&engine, "exp-nurture").await;

        let session = engine
            .start_session("run-1", "lead-1", "exp-nurture")
            .await
            .unwrap();
        assert_eq!(session.state, SessionState::Active);

        // Below threshold and no fallback: nothing moves.
        let stay = engine
            .handle_event(session.id, reply(ReplyIntent::Interest, 0.59))
            .await
            .unwrap();
        assert_eq!(stay.outcome, TransitionOutcome::NoMatch);

        let moved = engine
            .handle_event(session.id, reply(ReplyIntent::Interest, 0.6))
            .await
            .unwrap();
        assert_eq!(moved.edge_id.as_deref(), Some("intro-pitch"));

        let done = engine
            .handle_event(session.id, reply(ReplyIntent::Interest, 0.95))
            .await
            .unwrap();
        assert_eq!(done.state, SessionState::Completed);
        assert_eq!(done.turn_count, 2);

        let stored = engine.get_session(session.id).await.unwrap();
        assert_eq!(stored.ended_reason.as_deref(), Some("reached_terminal"));
        assert_eq!(stored.last_confidence, Some(0.95));
        assert_eq!(engine.list_events_by_run("run-1").await.unwrap().len(), 5);
        assert_eq!(sink.count_type(EventType::SessionCompleted), 1);
    }

    #[tokio::test]
    async fn test_nurture_flow_on_memory_store() {
        run_nurture_flow(Arc::new(MemoryStore::new())).await;
    }

    #[tokio::test]
    async fn test_nurture_flow_on_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("flows.json")).await.unwrap();
        run_nurture_flow(Arc::new(store)).await;
    }

    #[tokio::test]
    #[ignore = "requires a running Redis"]
    async fn test_nurture_flow_on_redis_store() {
        let config = RedisConfig {
            url: std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into()),
            key_prefix: format!("outreach-it-{}", uuid::Uuid::new_v4()),
        };
        run_nurture_flow(Arc::new(RedisStore::connect(&config).await.unwrap())).await;
    }

    #[tokio::test]
    async fn test_sessions_resume_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flows.json");

        let session_id = {
            let store = Arc::new(FileStore::open(&path).await.unwrap());
            let engine = ConversationEngine::new(store, EngineConfig::default());
            launch(&engine, "exp-1").await;
            engine
                .start_session("run-1", "lead-1", "exp-1")
                .await
                .unwrap()
                .id
        };

        let store = Arc::new(FileStore::open(&path).await.unwrap());
        let engine = ConversationEngine::new(store, EngineConfig::default());
        let later = Utc::now() + Duration::minutes(61);
        assert_eq!(engine.sweep_timers(later).await.unwrap(), 1);

        let session = engine.get_session(session_id).await.unwrap();
        assert_eq!(session.current_node_id, "pitch");
        assert_eq!(session.map_revision, 1);
    }

    #[tokio::test]
    async fn test_engines_sharing_a_store_never_lose_a_turn() {
        let store: Arc<dyn ConversationStore> = Arc::new(MemoryStore::new());
        let first = ConversationEngine::new(store.clone(), EngineConfig::default());
        let second = ConversationEngine::new(
            store,
            EngineConfig {
                max_advance_retries: 10,
                ..EngineConfig::default()
            },
        );
        launch(&first, "exp-1").await;
        let session = first.start_session("run-1", "lead-1", "exp-1").await.unwrap();

        let a = {
            let engine = first.clone();
            tokio::spawn(async move {
                engine
                    .handle_event(session.id, reply(ReplyIntent::Interest, 0.9))
                    .await
            })
        };
        let b = {
            let engine = second.clone();
            tokio::spawn(async move {
                engine
                    .handle_event(session.id, reply(ReplyIntent::Interest, 0.9))
                    .await
            })
        };
        let _ = a.await.unwrap();
        let _ = b.await.unwrap();

        let stored = first.get_session(session.id).await.unwrap();
        assert_eq!(stored.turn_count, 2);
        assert_eq!(stored.version, 2);
        assert_eq!(stored.state, SessionState::Completed);
    }

    #[tokio::test]
    async fn test_unsubscribe_policies() {
        let graph = json!({
            "startNodeId": "a",
            "nodes": [
                { "id": "a", "kind": "message", "body": "hi", "autoSend": true },
                { "id": "bye", "kind": "terminal" }
            ],
            "edges": []
        });

        for (policy, expected) in [
            (UnsubscribePolicy::Fail, SessionState::Failed),
            (UnsubscribePolicy::RouteToTerminal, SessionState::Completed),
        ] {
            let engine = ConversationEngine::new(
                Arc::new(MemoryStore::new()),
                EngineConfig {
                    unsubscribe_policy: policy,
                    ..EngineConfig::default()
                },
            );
            engine.open_map("b", "c", "exp-1", "Map").await.unwrap();
            engine.save_draft("exp-1", &graph).await.unwrap();
            engine.publish("exp-1").await.unwrap();
            let session = engine.start_session("run-1", "lead-1", "exp-1").await.unwrap();

            let transition = engine
                .handle_event(session.id, reply(ReplyIntent::Unsubscribe, 0.99))
                .await
                .unwrap();
            assert_eq!(transition.state, expected);
        }
    }

    #[tokio::test]
    async fn test_duplicate_lead_in_run_rejected() {
        let engine = ConversationEngine::new(Arc::new(MemoryStore::new()), EngineConfig::default());
        launch(&engine, "exp-1").await;
        engine.start_session("run-1", "lead-1", "exp-1").await.unwrap();
        let err = engine
            .start_session("run-1", "lead-1", "exp-1")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionExists);
    }
}
