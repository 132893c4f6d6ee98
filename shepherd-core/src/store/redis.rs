use super::{LeaseStore, at_or_after, ttl_millis};
use crate::{Consumer, NodeId, NodeInfo, Result, ShepherdError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const COMPARE_AND_PEXPIRE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

const COMPARE_AND_DELETE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

const HASH_COMPARE_AND_SET: &str = r#"
if redis.call('HGET', KEYS[1], ARGV[1]) == ARGV[2] then
    redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
    return 1
end
return 0
"#;

const SCAN_BATCH: usize = 256;

#[derive(Debug, Clone)]
struct Keyspace {
    root: String,
}

impl Keyspace {
    fn new(namespace: &str) -> Self {
        Self {
            root: format!("shepherd:{}", namespace),
        }
    }

    fn node_pattern(&self) -> String {
        format!("{}:node:*", self.root)
    }

    fn node_key(&self, node_id: &NodeId) -> String {
        format!("{}:node:{}", self.root, node_id)
    }

    fn lock_key(&self, key: &str) -> String {
        format!("{}:lock:{}", self.root, key)
    }

    fn consumers_key(&self) -> String {
        format!("{}:consumers", self.root)
    }
}

/// Redis-backed store. TTL'd records use `SET NX PX`; every ownership
/// check runs server-side in a Lua script so compare and write are atomic.
/// Consumers live in one hash keyed by consumer id. Redis has no cheap
/// prefix watch, so this backend is poll-only.
pub struct RedisStore {
    conn: ConnectionManager,
    keys: Keyspace,
    /// Exact membership payloads written by this process, for
    /// compare-and-expire.
    memberships: Mutex<HashMap<NodeId, String>>,
    compare_and_pexpire: Script,
    compare_and_delete: Script,
    hash_compare_and_set: Script,
}

impl RedisStore {
    pub async fn new(url: &str, namespace: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|error| {
            ShepherdError::Config(format!("invalid redis url '{}': {}", url, error))
        })?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!("Connected to redis at {} (namespace {})", url, namespace);

        Ok(Self {
            conn,
            keys: Keyspace::new(namespace),
            memberships: Mutex::new(HashMap::new()),
            compare_and_pexpire: Script::new(COMPARE_AND_PEXPIRE),
            compare_and_delete: Script::new(COMPARE_AND_DELETE),
            hash_compare_and_set: Script::new(HASH_COMPARE_AND_SET),
        })
    }

    fn memberships(&self) -> MutexGuard<'_, HashMap<NodeId, String>> {
        self.memberships
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn expire_if_owned(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let extended: i64 = self
            .compare_and_pexpire
            .key(key)
            .arg(value)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    async fn delete_if_owned(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .compare_and_delete
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(keys)
    }
}

#[async_trait]
impl LeaseStore for RedisStore {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn join(&self, node: &NodeInfo, ttl: Duration) -> Result<bool> {
        let payload = serde_json::to_string(node)?;
        let joined = self
            .set_if_absent(&self.keys.node_key(&node.node_id), &payload, ttl)
            .await?;
        if joined {
            self.memberships().insert(node.node_id.clone(), payload);
        }
        Ok(joined)
    }

    async fn keep_alive(&self, node_id: &NodeId, ttl: Duration) -> Result<bool> {
        let Some(payload) = self.memberships().get(node_id).cloned() else {
            return Ok(false);
        };
        self.expire_if_owned(&self.keys.node_key(node_id), &payload, ttl)
            .await
    }

    async fn leave(&self, node_id: &NodeId) -> Result<()> {
        let Some(payload) = self.memberships().remove(node_id) else {
            return Ok(());
        };
        self.delete_if_owned(&self.keys.node_key(node_id), &payload)
            .await
    }

    async fn list_nodes(&self, since: Option<DateTime<Utc>>) -> Result<Vec<NodeInfo>> {
        let keys = self.scan_keys(&self.keys.node_pattern()).await?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;

        // Keys that expired between SCAN and MGET come back as nil.
        let mut nodes = Vec::with_capacity(values.len());
        for raw in values.into_iter().flatten() {
            match serde_json::from_str::<NodeInfo>(&raw) {
                Ok(node) if at_or_after(node.joined_at, since) => nodes.push(node),
                Ok(_) => {}
                Err(error) => tracing::warn!("Skipping undecodable member record: {}", error),
            }
        }

        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(nodes)
    }

    async fn lock(&self, key: &str, holder: &NodeId, ttl: Duration) -> Result<bool> {
        self.set_if_absent(&self.keys.lock_key(key), holder.as_str(), ttl)
            .await
    }

    async fn refresh(&self, key: &str, holder: &NodeId, ttl: Duration) -> Result<bool> {
        self.expire_if_owned(&self.keys.lock_key(key), holder.as_str(), ttl)
            .await
    }

    async fn release(&self, key: &str, holder: &NodeId) -> Result<()> {
        self.delete_if_owned(&self.keys.lock_key(key), holder.as_str())
            .await
    }

    async fn fetch_consumers(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Consumer>> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.hvals(self.keys.consumers_key()).await?;

        let mut consumers = Vec::with_capacity(raw.len());
        for value in raw {
            match serde_json::from_str::<Consumer>(&value) {
                Ok(consumer) if at_or_after(consumer.updated_at, since) => {
                    consumers.push(consumer)
                }
                Ok(_) => {}
                Err(error) => tracing::warn!("Skipping undecodable consumer record: {}", error),
            }
        }

        consumers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(consumers)
    }

    async fn assign(
        &self,
        consumer_id: &str,
        node_id: &NodeId,
        expected: Option<&NodeId>,
    ) -> Result<bool> {
        let consumers_key = self.keys.consumers_key();
        let mut conn = self.conn.clone();

        let current_raw: Option<String> = conn.hget(&consumers_key, consumer_id).await?;
        let Some(current_raw) = current_raw else {
            return Ok(false);
        };
        let current: Consumer = serde_json::from_str(&current_raw)?;
        if current.assigned_node.as_ref() != expected {
            return Ok(false);
        }

        let updated = serde_json::to_string(&current.reassigned(node_id))?;
        let applied: i64 = self
            .hash_compare_and_set
            .key(&consumers_key)
            .arg(consumer_id)
            .arg(&current_raw)
            .arg(&updated)
            .invoke_async(&mut conn)
            .await?;
        Ok(applied == 1)
    }

    async fn find_by_node_id(&self, node_id: &NodeId) -> Result<Vec<Consumer>> {
        Ok(self
            .fetch_consumers(None)
            .await?
            .into_iter()
            .filter(|consumer| consumer.is_assigned_to(node_id))
            .collect())
    }

    async fn create_consumer(&self, consumer: &Consumer) -> Result<bool> {
        let payload = serde_json::to_string(consumer)?;
        let mut conn = self.conn.clone();
        let created: bool = conn
            .hset_nx(self.keys.consumers_key(), &consumer.id, payload)
            .await?;
        Ok(created)
    }

    async fn delete_consumer(&self, consumer_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.hdel(self.keys.consumers_key(), consumer_id).await?;
        Ok(removed > 0)
    }
}
