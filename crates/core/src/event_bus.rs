//! Event bus: trait for emitting analytics events from the flow engine.
//!
//! The engine accepts an `Arc<dyn EventSink>` and emits one event per
//! lifecycle change, independently of the persisted audit log.

use crate::types::{EventType, FlowAnalyticsEvent};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

/// Trait for emitting analytics events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: FlowAnalyticsEvent);
}

/// No-op sink for tests and deployments without analytics.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: FlowAnalyticsEvent) {}
}

/// Forwards every event to `tracing` at debug level.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: FlowAnalyticsEvent) {
        tracing::debug!(
            event_type = ?event.event_type,
            session_id = ?event.session_id,
            run_id = ?event.run_id,
            node_id = ?event.node_id,
            "flow event"
        );
    }
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<FlowAnalyticsEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<FlowAnalyticsEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn count_type(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: FlowAnalyticsEvent) {
        self.events.lock().push(event);
    }
}

/// Convenience builder for creating a `FlowAnalyticsEvent` with minimal boilerplate.
pub fn make_event(
    event_type: EventType,
    run_id: Option<String>,
    lead_id: Option<String>,
    session_id: Option<Uuid>,
) -> FlowAnalyticsEvent {
    FlowAnalyticsEvent {
        event_id: Uuid::new_v4(),
        event_type,
        run_id,
        lead_id,
        session_id,
        map_id: None,
        node_id: None,
        detail: serde_json::Value::Null,
        source_node: "local".into(),
        timestamp: Utc::now(),
    }
}

/// Convenience: create a no-op event bus.
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

/// Convenience: create a capture sink for tests.
pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}
