use crate::error::with_timeout;
use crate::lease::{Renewal, RenewalTiming};
use crate::store::LeaseStore;
use crate::task::Guard;
use crate::{CoordinationConfig, NodeId, NodeInfo, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Registers this process as a live cluster member and keeps the
/// membership lease renewed.
pub struct NodeRegistry {
    store: Arc<dyn LeaseStore>,
    node_id: NodeId,
    address: Option<String>,
    ttl: Duration,
    renew_interval: Duration,
    call_timeout: Duration,
    leave_timeout: Duration,
    parent: CancellationToken,
    membership: Mutex<Option<Renewal>>,
}

impl NodeRegistry {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        node_id: NodeId,
        address: Option<String>,
        config: &CoordinationConfig,
        parent: CancellationToken,
    ) -> Self {
        Self {
            store,
            node_id,
            address,
            ttl: config.node_ttl,
            renew_interval: config.renew_interval(),
            call_timeout: config.call_timeout,
            leave_timeout: config.leave_timeout,
            parent,
            membership: Mutex::new(None),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Inserts the membership record and starts renewing it. The returned
    /// token stays live while this node is a member; it is a child of
    /// `parent`. `None` means a record for this node id already exists.
    pub async fn join(&self, parent: &CancellationToken) -> Result<Option<CancellationToken>> {
        let mut membership = self.membership.lock().await;
        if let Some(stale) = membership.take() {
            stale.stop().await;
        }

        let node = NodeInfo::new(self.node_id.clone(), self.address.clone());
        let joined = with_timeout(self.call_timeout, self.store.join(&node, self.ttl)).await?;
        if !joined {
            tracing::debug!("Membership record for {} already exists", self.node_id);
            return Ok(None);
        }

        let store = self.store.clone();
        let node_id = self.node_id.clone();
        let ttl = self.ttl;
        let renewal = Renewal::spawn(
            format!("Membership of {}", self.node_id),
            parent.child_token(),
            RenewalTiming {
                interval: self.renew_interval,
                ttl,
                call_timeout: self.call_timeout,
            },
            move || {
                let store = store.clone();
                let node_id = node_id.clone();
                Box::pin(async move { store.keep_alive(&node_id, ttl).await })
            },
        );

        let alive = renewal.alive.clone();
        *membership = Some(renewal);
        tracing::info!(
            "Node {} joined the cluster via {} (ttl {:?})",
            self.node_id,
            self.store.backend_name(),
            self.ttl
        );
        Ok(Some(alive))
    }

    /// Stops renewal and deletes the membership record on a best-effort
    /// basis. If the delete fails the record expires with its TTL.
    pub async fn leave(&self) {
        let Some(renewal) = self.membership.lock().await.take() else {
            return;
        };
        renewal.stop().await;

        match with_timeout(self.leave_timeout, self.store.leave(&self.node_id)).await {
            Ok(()) => tracing::info!("Node {} left the cluster", self.node_id),
            Err(error) => tracing::warn!(
                "Node {} could not delete its membership, leaving it to expire: {}",
                self.node_id,
                error
            ),
        }
    }

    /// Live members, optionally only those that joined at or after `since`.
    pub async fn nodes(&self, since: Option<DateTime<Utc>>) -> Result<Vec<NodeInfo>> {
        with_timeout(self.call_timeout, self.store.list_nodes(since)).await
    }

    pub async fn is_joined(&self) -> bool {
        self.membership
            .lock()
            .await
            .as_ref()
            .is_some_and(|renewal| !renewal.alive.is_cancelled())
    }
}

#[async_trait]
impl Guard for NodeRegistry {
    fn describe(&self) -> String {
        format!("membership of {}", self.node_id)
    }

    async fn acquire(&self) -> Result<Option<CancellationToken>> {
        self.join(&self.parent).await
    }

    async fn release(&self) {
        self.leave().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn config() -> CoordinationConfig {
        CoordinationConfig {
            node_ttl: Duration::from_secs(4),
            ..Default::default()
        }
    }

    fn registry(store: &Arc<MemoryStore>, id: &str) -> NodeRegistry {
        NodeRegistry::new(
            store.clone(),
            NodeId::from(id),
            Some(format!("{}:7000", id)),
            &config(),
            CancellationToken::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_renews_and_leave_deletes() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(&store, "n1");

        let alive = registry.acquire().await.unwrap().expect("joined");
        assert!(registry.is_joined().await);

        // Well past one TTL; renewal keeps the record around.
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(!alive.is_cancelled());
        let nodes = registry.nodes(None).await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].address.as_deref(), Some("n1:7000"));

        registry.release().await;
        assert!(alive.is_cancelled());
        assert!(!registry.is_joined().await);
        assert!(store.list_nodes(None).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_join_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let first = registry(&store, "n1");
        let second = registry(&store, "n1");

        assert!(first.acquire().await.unwrap().is_some());
        assert!(second.acquire().await.unwrap().is_none());
        first.release().await;
        assert!(second.acquire().await.unwrap().is_some());
        second.release().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_record_cancels_liveness() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(&store, "n1");
        let alive = registry.acquire().await.unwrap().expect("joined");

        store.leave(registry.node_id()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(alive.is_cancelled());

        // Rejoining after the loss starts over cleanly.
        registry.release().await;
        assert!(registry.acquire().await.unwrap().is_some());
        registry.release().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_cancellation_ends_membership() {
        let store = Arc::new(MemoryStore::new());
        let parent = CancellationToken::new();
        let registry = NodeRegistry::new(store.clone(), NodeId::from("n1"), None, &config(), parent.clone());

        let alive = registry.join(&parent).await.unwrap().expect("joined");
        parent.cancel();
        assert!(alive.is_cancelled());
        registry.leave().await;
    }
}
