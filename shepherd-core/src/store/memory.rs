use super::{LeaseStore, at_or_after};
use crate::{ChangeTopic, Consumer, LockRecord, NodeId, NodeInfo, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

struct Leased<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Leased<T> {
    fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

#[derive(Default)]
struct MemoryState {
    members: HashMap<NodeId, Leased<NodeInfo>>,
    locks: HashMap<String, Leased<LockRecord>>,
    consumers: BTreeMap<String, Consumer>,
}

/// Single-process store with the same CAS+TTL semantics as the networked
/// backends. Expiry runs on the tokio clock, so paused-time tests can
/// drive lease loss deterministically.
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    members_tx: watch::Sender<u64>,
    consumers_tx: watch::Sender<u64>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (members_tx, _) = watch::channel(0);
        let (consumers_tx, _) = watch::channel(0);
        Self {
            state: Mutex::new(MemoryState::default()),
            members_tx,
            consumers_tx,
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, topic: ChangeTopic) {
        let sender = match topic {
            ChangeTopic::Members => &self.members_tx,
            ChangeTopic::Consumers => &self.consumers_tx,
        };
        sender.send_modify(|version| *version += 1);
    }

    /// Current holder of `key`, if the lock is live.
    pub fn lock_holder(&self, key: &str) -> Option<NodeId> {
        self.state()
            .locks
            .get(key)
            .filter(|entry| entry.is_live())
            .map(|entry| entry.value.holder.clone())
    }
}

#[async_trait]
impl LeaseStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn join(&self, node: &NodeInfo, ttl: Duration) -> Result<bool> {
        {
            let mut state = self.state();
            if state
                .members
                .get(&node.node_id)
                .is_some_and(|entry| entry.is_live())
            {
                return Ok(false);
            }
            state
                .members
                .insert(node.node_id.clone(), Leased::new(node.clone(), ttl));
        }

        self.notify(ChangeTopic::Members);
        Ok(true)
    }

    async fn keep_alive(&self, node_id: &NodeId, ttl: Duration) -> Result<bool> {
        let mut state = self.state();
        match state.members.get_mut(node_id) {
            Some(entry) if entry.is_live() => {
                entry.expires_at = Instant::now() + ttl;
                Ok(true)
            }
            Some(_) => {
                state.members.remove(node_id);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn leave(&self, node_id: &NodeId) -> Result<()> {
        let removed = self.state().members.remove(node_id).is_some();
        if removed {
            self.notify(ChangeTopic::Members);
        }
        Ok(())
    }

    async fn list_nodes(&self, since: Option<DateTime<Utc>>) -> Result<Vec<NodeInfo>> {
        let (mut nodes, expired) = {
            let mut state = self.state();
            let before = state.members.len();
            state.members.retain(|_, entry| entry.is_live());
            let expired = before != state.members.len();

            let nodes: Vec<NodeInfo> = state
                .members
                .values()
                .map(|entry| entry.value.clone())
                .filter(|node| at_or_after(node.joined_at, since))
                .collect();
            (nodes, expired)
        };

        if expired {
            self.notify(ChangeTopic::Members);
        }

        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(nodes)
    }

    async fn lock(&self, key: &str, holder: &NodeId, ttl: Duration) -> Result<bool> {
        let mut state = self.state();
        if state.locks.get(key).is_some_and(|entry| entry.is_live()) {
            return Ok(false);
        }

        let record = LockRecord {
            key: key.to_string(),
            holder: holder.clone(),
            acquired_at: Utc::now(),
        };
        state.locks.insert(key.to_string(), Leased::new(record, ttl));
        Ok(true)
    }

    async fn refresh(&self, key: &str, holder: &NodeId, ttl: Duration) -> Result<bool> {
        let mut state = self.state();
        match state.locks.get_mut(key) {
            Some(entry) if entry.is_live() && entry.value.holder == *holder => {
                entry.expires_at = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, holder: &NodeId) -> Result<()> {
        let mut state = self.state();
        if state
            .locks
            .get(key)
            .is_some_and(|entry| entry.value.holder == *holder)
        {
            state.locks.remove(key);
        }
        Ok(())
    }

    async fn fetch_consumers(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Consumer>> {
        Ok(self
            .state()
            .consumers
            .values()
            .filter(|consumer| at_or_after(consumer.updated_at, since))
            .cloned()
            .collect())
    }

    async fn assign(
        &self,
        consumer_id: &str,
        node_id: &NodeId,
        expected: Option<&NodeId>,
    ) -> Result<bool> {
        {
            let mut state = self.state();
            let Some(consumer) = state.consumers.get_mut(consumer_id) else {
                return Ok(false);
            };
            if consumer.assigned_node.as_ref() != expected {
                return Ok(false);
            }
            *consumer = consumer.reassigned(node_id);
        }

        self.notify(ChangeTopic::Consumers);
        Ok(true)
    }

    async fn find_by_node_id(&self, node_id: &NodeId) -> Result<Vec<Consumer>> {
        Ok(self
            .state()
            .consumers
            .values()
            .filter(|consumer| consumer.is_assigned_to(node_id))
            .cloned()
            .collect())
    }

    async fn create_consumer(&self, consumer: &Consumer) -> Result<bool> {
        {
            let mut state = self.state();
            if state.consumers.contains_key(&consumer.id) {
                return Ok(false);
            }
            state
                .consumers
                .insert(consumer.id.clone(), consumer.clone());
        }

        self.notify(ChangeTopic::Consumers);
        Ok(true)
    }

    async fn delete_consumer(&self, consumer_id: &str) -> Result<bool> {
        let removed = self.state().consumers.remove(consumer_id).is_some();
        if removed {
            self.notify(ChangeTopic::Consumers);
        }
        Ok(removed)
    }

    async fn subscribe(&self, topic: ChangeTopic) -> Result<Option<watch::Receiver<u64>>> {
        let receiver = match topic {
            ChangeTopic::Members => self.members_tx.subscribe(),
            ChangeTopic::Consumers => self.consumers_tx.subscribe(),
        };
        Ok(Some(receiver))
    }
}
