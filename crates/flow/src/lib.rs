//! Conversation flow engine: graph normalization, edge resolution, versioned
//! maps, and per-lead sessions that walk a published graph as replies and
//! timers arrive.

pub mod defaults;
pub mod engine;
pub mod lifecycle;
pub mod map;
pub mod normalizer;
pub mod resolver;
pub mod state_machine;
pub mod store;
pub mod types;

pub use defaults::default_graph;
pub use engine::ConversationEngine;
pub use lifecycle::{advance_session, start_session, Transition, TransitionOutcome};
pub use map::publish_map;
pub use normalizer::{normalize_graph, normalize_graph_with_diagnostics, Diagnostic};
pub use resolver::{resolve_edge, EdgeResolver};
pub use store::{ConversationStore, MemoryStore};
