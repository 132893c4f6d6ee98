//! Lease store backends
//!
//! Every piece of shared state goes through [`LeaseStore`]: membership and
//! lock records are TTL'd keys written with compare-and-set, consumer
//! records are durable and updated conditionally.

pub mod etcd;
pub mod factory;
pub mod memory;
pub mod redis;

pub use etcd::EtcdStore;
pub use factory::StoreBuilder;
pub use memory::MemoryStore;
pub use redis::RedisStore;

use crate::error::with_timeout;
use crate::{ChangeTopic, Consumer, NodeId, NodeInfo, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::watch;

#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Short backend label for logs.
    fn backend_name(&self) -> &'static str;

    // === Membership ===

    /// Insert the membership record if absent. Returns false when a record
    /// for this node already exists.
    async fn join(&self, node: &NodeInfo, ttl: Duration) -> Result<bool>;

    /// Extend the membership lease. Returns false when the record is gone.
    async fn keep_alive(&self, node_id: &NodeId, ttl: Duration) -> Result<bool>;

    /// Delete the membership record if this process still owns it.
    async fn leave(&self, node_id: &NodeId) -> Result<()>;

    /// Live members. `since` is a filter hint on `joined_at`; a backend may
    /// ignore it and return the full set.
    async fn list_nodes(&self, since: Option<DateTime<Utc>>) -> Result<Vec<NodeInfo>>;

    // === Locking ===

    /// Conditional insert of the lock record.
    async fn lock(&self, key: &str, holder: &NodeId, ttl: Duration) -> Result<bool>;

    /// Extend the lock, only if `holder` still holds it.
    async fn refresh(&self, key: &str, holder: &NodeId, ttl: Duration) -> Result<bool>;

    /// Delete the lock, only if `holder` still holds it.
    async fn release(&self, key: &str, holder: &NodeId) -> Result<()>;

    // === Consumers ===

    /// Consumers, optionally only those updated at or after `since`.
    async fn fetch_consumers(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Consumer>>;

    /// Point `consumer_id` at `node_id`, provided its current assignment is
    /// still `expected`. Returns false if the consumer vanished or moved.
    async fn assign(
        &self,
        consumer_id: &str,
        node_id: &NodeId,
        expected: Option<&NodeId>,
    ) -> Result<bool>;

    async fn find_by_node_id(&self, node_id: &NodeId) -> Result<Vec<Consumer>>;

    /// Returns false if a consumer with the same id exists.
    async fn create_consumer(&self, consumer: &Consumer) -> Result<bool>;

    async fn delete_consumer(&self, consumer_id: &str) -> Result<bool>;

    /// Change notifications for `topic`, if the backend can push them.
    /// The value is a counter; only the fact that it moved matters.
    async fn subscribe(&self, _topic: ChangeTopic) -> Result<Option<watch::Receiver<u64>>> {
        Ok(None)
    }
}

/// Subscribes to `topic`, falling back to polling only when the backend
/// cannot push or the subscription fails.
pub(crate) async fn subscribe_or_poll(
    store: &dyn LeaseStore,
    topic: ChangeTopic,
    call_timeout: Duration,
) -> Option<watch::Receiver<u64>> {
    match with_timeout(call_timeout, store.subscribe(topic)).await {
        Ok(changes) => changes,
        Err(error) => {
            tracing::warn!("Subscribing to {:?} failed, polling only: {}", topic, error);
            None
        }
    }
}

/// Resolves when `changes` moves. Never resolves without a subscription;
/// a closed channel drops the subscription and returns false.
pub(crate) async fn next_change(changes: &mut Option<watch::Receiver<u64>>) -> bool {
    let Some(receiver) = changes.as_mut() else {
        return std::future::pending().await;
    };
    if receiver.changed().await.is_ok() {
        return true;
    }
    *changes = None;
    false
}

/// `since` filter shared by the backends that scan.
pub(crate) fn at_or_after(at: DateTime<Utc>, since: Option<DateTime<Utc>>) -> bool {
    since.is_none_or(|since| at >= since)
}

/// Milliseconds for TTL arguments, never zero.
pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// Whole seconds for backends with second-granularity leases, never zero.
pub(crate) fn ttl_seconds(ttl: Duration) -> i64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1) as i64
}
