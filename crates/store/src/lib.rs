#![warn(clippy::unwrap_used)]

//! Durable `ConversationStore` backends and the startup factory that picks one.

pub mod file;
pub mod redis_store;

use std::sync::Arc;

use outreach_core::config::{AppConfig, StoreBackend};
use outreach_core::OutreachResult;
use outreach_flow::store::{ConversationStore, MemoryStore};
use tracing::info;

pub use file::FileStore;
pub use redis_store::RedisStore;

/// Builds the backend named in `config.store.backend`.
pub async fn open_store(config: &AppConfig) -> OutreachResult<Arc<dyn ConversationStore>> {
    let store: Arc<dyn ConversationStore> = match config.store.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::File => Arc::new(FileStore::open(&config.store.file_path).await?),
        StoreBackend::Redis => Arc::new(RedisStore::connect(&config.redis).await?),
    };
    info!(backend = store.backend(), "Conversation store ready");
    Ok(store)
}
