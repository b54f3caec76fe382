//! Redis-backed store for multi-process deployments.
//!
//! Every compare-and-set (publish, archive, session create, session update)
//! runs as a Lua script so the check and the write are one atomic step on the
//! server.
//!
//! Key layout, all under the configured prefix `p`:
//! - `p:map:{experiment_id}` hash: `meta`, `name`, `draft`, `status`,
//!   `revision`, `published`, `publishedAt`, `updatedAt`
//! - `p:map:{map_id}:rev:{n}` published graph snapshot
//! - `p:session:{id}` hash: `version`, `data`
//! - `p:lead:{run_id}:{lead_id}` session id for the pair
//! - `p:sessions:open` set of open session ids
//! - `p:run:{run_id}:events` list of audit events

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outreach_core::config::RedisConfig;
use outreach_core::{OutreachError, OutreachResult};
use outreach_flow::store::ConversationStore;
use outreach_flow::types::{
    ConversationEvent, ConversationMap, ConversationSession, FlowGraph, MapStatus,
};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::{debug, info};
use uuid::Uuid;

const UPSERT_DRAFT: &str = r#"
if redis.call('HSETNX', KEYS[1], 'meta', ARGV[1]) == 1 then
  redis.call('HSET', KEYS[1], 'revision', '0', 'status', ARGV[5])
end
redis.call('HSET', KEYS[1], 'draft', ARGV[2], 'name', ARGV[3], 'updatedAt', ARGV[4])
return redis.call('HGETALL', KEYS[1])
"#;

const PUBLISH: &str = r#"
local current = redis.call('HGET', KEYS[1], 'revision')
if not current then return -1 end
if redis.call('HGET', KEYS[1], 'status') == ARGV[6] then return -2 end
if tonumber(current) + 1 ~= tonumber(ARGV[1]) then return 0 end
redis.call('HSET', KEYS[1], 'revision', ARGV[1], 'published', ARGV[2],
  'publishedAt', ARGV[3], 'status', ARGV[4], 'updatedAt', ARGV[5])
redis.call('SET', KEYS[2], ARGV[2])
return 1
"#;

const ARCHIVE_MAP: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
redis.call('HSET', KEYS[1], 'status', ARGV[1], 'updatedAt', ARGV[2])
return 1
"#;

const CREATE_SESSION: &str = r#"
if redis.call('SETNX', KEYS[1], ARGV[1]) == 0 then return 0 end
redis.call('HSET', KEYS[2], 'version', ARGV[2], 'data', ARGV[3])
if ARGV[4] == '0' then redis.call('SADD', KEYS[3], ARGV[1]) end
return 1
"#;

const UPDATE_SESSION: &str = r#"
local version = redis.call('HGET', KEYS[1], 'version')
if not version then return -1 end
if tonumber(version) ~= tonumber(ARGV[1]) then return 0 end
redis.call('HSET', KEYS[1], 'version', ARGV[2], 'data', ARGV[3])
if ARGV[4] == '1' then
  redis.call('SREM', KEYS[2], ARGV[5])
else
  redis.call('SADD', KEYS[2], ARGV[5])
end
return 1
"#;

fn storage(e: redis::RedisError) -> OutreachError {
    OutreachError::Storage(e.to_string())
}

pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
    upsert_draft: Script,
    publish: Script,
    archive_map: Script,
    create_session: Script,
    update_session: Script,
}

impl RedisStore {
    /// Connects and verifies the server answers `PING`.
    pub async fn connect(config: &RedisConfig) -> OutreachResult<Self> {
        info!(url = %config.url, prefix = %config.key_prefix, "Connecting to Redis");

        let client = redis::Client::open(config.url.as_str()).map_err(storage)?;
        let mut conn = ConnectionManager::new(client).await.map_err(storage)?;
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(storage)?;
        info!(response = %pong, "Redis connection established");

        Ok(Self {
            conn,
            prefix: config.key_prefix.clone(),
            upsert_draft: Script::new(UPSERT_DRAFT),
            publish: Script::new(PUBLISH),
            archive_map: Script::new(ARCHIVE_MAP),
            create_session: Script::new(CREATE_SESSION),
            update_session: Script::new(UPDATE_SESSION),
        })
    }

    fn map_key(&self, experiment_id: &str) -> String {
        format!("{}:map:{experiment_id}", self.prefix)
    }

    fn revision_key(&self, map_id: Uuid, revision: u32) -> String {
        format!("{}:map:{map_id}:rev:{revision}", self.prefix)
    }

    fn session_key(&self, session_id: Uuid) -> String {
        format!("{}:session:{session_id}", self.prefix)
    }

    fn lead_key(&self, run_id: &str, lead_id: &str) -> String {
        format!("{}:lead:{run_id}:{lead_id}", self.prefix)
    }

    fn open_key(&self) -> String {
        format!("{}:sessions:open", self.prefix)
    }

    fn events_key(&self, run_id: &str) -> String {
        format!("{}:run:{run_id}:events", self.prefix)
    }

    /// Rebuilds a map from its hash fields. `meta` holds the identity fields
    /// written at creation; the rest override it.
    fn assemble_map(fields: HashMap<String, String>) -> OutreachResult<Option<ConversationMap>> {
        let Some(meta) = fields.get("meta") else {
            return Ok(None);
        };
        let mut map: ConversationMap = serde_json::from_str(meta)?;

        if let Some(name) = fields.get("name") {
            map.name = serde_json::from_str(name)?;
        }
        if let Some(draft) = fields.get("draft") {
            map.draft_graph = serde_json::from_str(draft)?;
        }
        if let Some(status) = fields.get("status") {
            map.status = serde_json::from_str(status)?;
        }
        if let Some(updated_at) = fields.get("updatedAt") {
            map.updated_at = serde_json::from_str(updated_at)?;
        }
        map.published_revision = fields
            .get("revision")
            .and_then(|r| r.parse().ok())
            .unwrap_or(0);
        map.published_graph = fields
            .get("published")
            .map(|g| serde_json::from_str::<FlowGraph>(g))
            .transpose()?;
        map.published_at = fields
            .get("publishedAt")
            .map(|t| serde_json::from_str::<DateTime<Utc>>(t))
            .transpose()?;
        Ok(Some(map))
    }

    async fn load_session(
        &self,
        conn: &mut ConnectionManager,
        session_id: Uuid,
    ) -> OutreachResult<Option<ConversationSession>> {
        let data: Option<String> = conn
            .hget(self.session_key(session_id), "data")
            .await
            .map_err(storage)?;
        data.map(|d| serde_json::from_str(&d).map_err(OutreachError::from))
            .transpose()
    }
}

#[async_trait]
impl ConversationStore for RedisStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn get_map_by_experiment(
        &self,
        experiment_id: &str,
    ) -> OutreachResult<Option<ConversationMap>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn
            .hgetall(self.map_key(experiment_id))
            .await
            .map_err(storage)?;
        Self::assemble_map(fields)
    }

    async fn upsert_draft(&self, map: &ConversationMap) -> OutreachResult<ConversationMap> {
        let mut conn = self.conn.clone();
        let mut meta = map.clone();
        meta.published_graph = None;

        let fields: HashMap<String, String> = self
            .upsert_draft
            .key(self.map_key(&map.experiment_id))
            .arg(serde_json::to_string(&meta)?)
            .arg(serde_json::to_string(&map.draft_graph)?)
            .arg(serde_json::to_string(&map.name)?)
            .arg(serde_json::to_string(&map.updated_at)?)
            .arg(serde_json::to_string(&MapStatus::Draft)?)
            .invoke_async(&mut conn)
            .await
            .map_err(storage)?;

        Self::assemble_map(fields)?
            .ok_or_else(|| OutreachError::Storage("map vanished during upsert".into()))
    }

    async fn publish(&self, map: &ConversationMap) -> OutreachResult<()> {
        let graph = map
            .published_graph
            .as_ref()
            .ok_or_else(|| OutreachError::Storage("publish without a published graph".into()))?;

        let mut conn = self.conn.clone();
        let outcome: i64 = self
            .publish
            .key(self.map_key(&map.experiment_id))
            .key(self.revision_key(map.id, map.published_revision))
            .arg(map.published_revision)
            .arg(serde_json::to_string(graph)?)
            .arg(serde_json::to_string(&map.published_at)?)
            .arg(serde_json::to_string(&map.status)?)
            .arg(serde_json::to_string(&map.updated_at)?)
            .arg(serde_json::to_string(&MapStatus::Archived)?)
            .invoke_async(&mut conn)
            .await
            .map_err(storage)?;

        match outcome {
            1 => Ok(()),
            0 => Err(OutreachError::Conflict {
                entity: "conversation_map",
                id: map.id.to_string(),
            }),
            -2 => Err(OutreachError::MapArchived { map_id: map.id }),
            _ => Err(OutreachError::MapNotFound {
                experiment_id: map.experiment_id.clone(),
            }),
        }
    }

    async fn archive_map(&self, map: &ConversationMap) -> OutreachResult<()> {
        let mut conn = self.conn.clone();
        let archived: i64 = self
            .archive_map
            .key(self.map_key(&map.experiment_id))
            .arg(serde_json::to_string(&MapStatus::Archived)?)
            .arg(serde_json::to_string(&map.updated_at)?)
            .invoke_async(&mut conn)
            .await
            .map_err(storage)?;

        if archived == 0 {
            return Err(OutreachError::MapNotFound {
                experiment_id: map.experiment_id.clone(),
            });
        }
        Ok(())
    }

    async fn get_published_graph(
        &self,
        map_id: Uuid,
        revision: u32,
    ) -> OutreachResult<Option<FlowGraph>> {
        let mut conn = self.conn.clone();
        let data: Option<String> = conn
            .get(self.revision_key(map_id, revision))
            .await
            .map_err(storage)?;
        data.map(|d| serde_json::from_str(&d).map_err(OutreachError::from))
            .transpose()
    }

    async fn create_session(&self, session: &ConversationSession) -> OutreachResult<()> {
        let mut conn = self.conn.clone();
        let created: i64 = self
            .create_session
            .key(self.lead_key(&session.run_id, &session.lead_id))
            .key(self.session_key(session.id))
            .key(self.open_key())
            .arg(session.id.to_string())
            .arg(session.version)
            .arg(serde_json::to_string(session)?)
            .arg(if session.state.is_closed() { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await
            .map_err(storage)?;

        if created == 0 {
            return Err(OutreachError::SessionExists {
                run_id: session.run_id.clone(),
                lead_id: session.lead_id.clone(),
            });
        }
        Ok(())
    }

    async fn get_session(&self, session_id: Uuid) -> OutreachResult<Option<ConversationSession>> {
        let mut conn = self.conn.clone();
        self.load_session(&mut conn, session_id).await
    }

    async fn update_session(
        &self,
        session: &ConversationSession,
        expected_version: u64,
    ) -> OutreachResult<()> {
        let mut conn = self.conn.clone();
        let outcome: i64 = self
            .update_session
            .key(self.session_key(session.id))
            .key(self.open_key())
            .arg(expected_version)
            .arg(session.version)
            .arg(serde_json::to_string(session)?)
            .arg(if session.state.is_closed() { "1" } else { "0" })
            .arg(session.id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(storage)?;

        match outcome {
            1 => Ok(()),
            0 => {
                debug!(session_id = %session.id, expected_version, "Stale session write");
                Err(OutreachError::Conflict {
                    entity: "conversation_session",
                    id: session.id.to_string(),
                })
            }
            _ => Err(OutreachError::SessionNotFound {
                session_id: session.id,
            }),
        }
    }

    async fn list_open_sessions(&self) -> OutreachResult<Vec<ConversationSession>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(self.open_key()).await.map_err(storage)?;

        let mut sessions = Vec::with_capacity(ids.len());
        for id in ids {
            let Ok(session_id) = Uuid::parse_str(&id) else {
                continue;
            };
            if let Some(session) = self.load_session(&mut conn, session_id).await? {
                if !session.state.is_closed() {
                    sessions.push(session);
                }
            }
        }
        Ok(sessions)
    }

    async fn append_event(&self, event: &ConversationEvent) -> OutreachResult<()> {
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(self.events_key(&event.run_id), serde_json::to_string(event)?)
            .await
            .map_err(storage)?;
        metrics::counter!("store.redis.events_appended").increment(1);
        Ok(())
    }

    async fn list_events_by_run(&self, run_id: &str) -> OutreachResult<Vec<ConversationEvent>> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn
            .lrange(self.events_key(run_id), 0, -1)
            .await
            .map_err(storage)?;
        raw.iter()
            .map(|e| serde_json::from_str(e).map_err(OutreachError::from))
            .collect()
    }
}
