use super::{LeaseStore, at_or_after, ttl_seconds};
use crate::{ChangeTopic, Consumer, LockRecord, NodeId, NodeInfo, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use etcd_client::{
    Client, Compare, CompareOp, GetOptions, PutOptions, Txn, TxnOp, WatchOptions,
};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

/// Key layout under `/shepherd/{namespace}/`.
#[derive(Debug, Clone)]
struct Keyspace {
    root: String,
}

impl Keyspace {
    fn new(namespace: &str) -> Self {
        Self {
            root: format!("/shepherd/{}", namespace),
        }
    }

    fn nodes_prefix(&self) -> String {
        format!("{}/nodes/", self.root)
    }

    fn node_key(&self, node_id: &NodeId) -> String {
        format!("{}{}", self.nodes_prefix(), node_id)
    }

    fn lock_key(&self, key: &str) -> String {
        format!("{}/locks/{}", self.root, key)
    }

    fn consumers_prefix(&self) -> String {
        format!("{}/consumers/", self.root)
    }

    fn consumer_key(&self, consumer_id: &str) -> String {
        format!("{}{}", self.consumers_prefix(), consumer_id)
    }
}

/// etcd-backed store. Membership and lock records hang off etcd leases,
/// so they vanish with the lease; ownership checks compare the key's
/// lease id inside a transaction.
pub struct EtcdStore {
    client: Client,
    keys: Keyspace,
    /// Leases this process granted, by record key and owner.
    leases: Mutex<HashMap<(String, NodeId), i64>>,
}

impl EtcdStore {
    pub async fn new(endpoints: &[String], namespace: &str) -> Result<Self> {
        let client = Client::connect(endpoints, None).await?;
        tracing::info!("Connected to etcd at {:?} (namespace {})", endpoints, namespace);
        Ok(Self {
            client,
            keys: Keyspace::new(namespace),
            leases: Mutex::new(HashMap::new()),
        })
    }

    fn leases(&self) -> MutexGuard<'_, HashMap<(String, NodeId), i64>> {
        self.leases.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create `key` under a fresh lease unless it already exists.
    async fn create_leased(
        &self,
        key: &str,
        owner: &NodeId,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool> {
        let mut client = self.client.clone();
        let lease_id = client.lease_grant(ttl_seconds(ttl), None).await?.id();

        let txn = Txn::new()
            .when(vec![Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(
                key,
                value,
                Some(PutOptions::new().with_lease(lease_id)),
            )]);

        let created = client.txn(txn).await?.succeeded();
        if created {
            self.leases()
                .insert((key.to_string(), owner.clone()), lease_id);
        } else if let Err(error) = client.lease_revoke(lease_id).await {
            tracing::debug!("Failed to revoke unused lease {}: {}", lease_id, error);
        }

        Ok(created)
    }

    /// Keep the lease behind `key` alive, provided the key is still bound
    /// to the lease this process granted.
    async fn renew_leased(&self, key: &str, owner: &NodeId) -> Result<bool> {
        let slot = (key.to_string(), owner.clone());
        let Some(lease_id) = self.leases().get(&slot).copied() else {
            return Ok(false);
        };

        let mut client = self.client.clone();
        let owned = client
            .txn(Txn::new().when(vec![Compare::lease(key, CompareOp::Equal, lease_id)]))
            .await?
            .succeeded();
        if !owned {
            self.leases().remove(&slot);
            return Ok(false);
        }

        let (mut keeper, mut stream) = client.lease_keep_alive(lease_id).await?;
        keeper.keep_alive().await?;
        match stream.message().await? {
            Some(response) if response.ttl() > 0 => Ok(true),
            _ => {
                self.leases().remove(&slot);
                Ok(false)
            }
        }
    }

    /// Delete `key` if it is still bound to our lease, then drop the lease.
    async fn delete_leased(&self, key: &str, owner: &NodeId) -> Result<()> {
        let Some(lease_id) = self.leases().remove(&(key.to_string(), owner.clone())) else {
            return Ok(());
        };

        let mut client = self.client.clone();
        let txn = Txn::new()
            .when(vec![Compare::lease(key, CompareOp::Equal, lease_id)])
            .and_then(vec![TxnOp::delete(key, None)]);
        client.txn(txn).await?;

        if let Err(error) = client.lease_revoke(lease_id).await {
            tracing::debug!("Lease {} already gone: {}", lease_id, error);
        }
        Ok(())
    }

    async fn scan<T: serde::de::DeserializeOwned>(&self, prefix: String) -> Result<Vec<T>> {
        let mut client = self.client.clone();
        let response = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;

        let mut values = Vec::with_capacity(response.kvs().len());
        for kv in response.kvs() {
            match serde_json::from_slice::<T>(kv.value()) {
                Ok(value) => values.push(value),
                Err(error) => {
                    tracing::warn!(
                        "Skipping undecodable record {}: {}",
                        String::from_utf8_lossy(kv.key()),
                        error
                    );
                }
            }
        }
        Ok(values)
    }
}

#[async_trait]
impl LeaseStore for EtcdStore {
    fn backend_name(&self) -> &'static str {
        "etcd"
    }

    async fn join(&self, node: &NodeInfo, ttl: Duration) -> Result<bool> {
        let payload = serde_json::to_vec(node)?;
        self.create_leased(&self.keys.node_key(&node.node_id), &node.node_id, payload, ttl)
            .await
    }

    // etcd restores the TTL the lease was granted with; `ttl` is unused.
    async fn keep_alive(&self, node_id: &NodeId, _ttl: Duration) -> Result<bool> {
        self.renew_leased(&self.keys.node_key(node_id), node_id).await
    }

    async fn leave(&self, node_id: &NodeId) -> Result<()> {
        self.delete_leased(&self.keys.node_key(node_id), node_id).await
    }

    async fn list_nodes(&self, since: Option<DateTime<Utc>>) -> Result<Vec<NodeInfo>> {
        let mut nodes: Vec<NodeInfo> = self
            .scan(self.keys.nodes_prefix())
            .await?
            .into_iter()
            .filter(|node: &NodeInfo| at_or_after(node.joined_at, since))
            .collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(nodes)
    }

    async fn lock(&self, key: &str, holder: &NodeId, ttl: Duration) -> Result<bool> {
        let record = LockRecord {
            key: key.to_string(),
            holder: holder.clone(),
            acquired_at: Utc::now(),
        };
        let payload = serde_json::to_vec(&record)?;
        self.create_leased(&self.keys.lock_key(key), holder, payload, ttl)
            .await
    }

    async fn refresh(&self, key: &str, holder: &NodeId, _ttl: Duration) -> Result<bool> {
        self.renew_leased(&self.keys.lock_key(key), holder).await
    }

    async fn release(&self, key: &str, holder: &NodeId) -> Result<()> {
        self.delete_leased(&self.keys.lock_key(key), holder).await
    }

    async fn fetch_consumers(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Consumer>> {
        Ok(self
            .scan(self.keys.consumers_prefix())
            .await?
            .into_iter()
            .filter(|consumer: &Consumer| at_or_after(consumer.updated_at, since))
            .collect())
    }

    async fn assign(
        &self,
        consumer_id: &str,
        node_id: &NodeId,
        expected: Option<&NodeId>,
    ) -> Result<bool> {
        let key = self.keys.consumer_key(consumer_id);
        let mut client = self.client.clone();

        let response = client.get(key.as_str(), None).await?;
        let Some(kv) = response.kvs().first() else {
            return Ok(false);
        };
        let current: Consumer = serde_json::from_slice(kv.value())?;
        if current.assigned_node.as_ref() != expected {
            return Ok(false);
        }

        let payload = serde_json::to_vec(&current.reassigned(node_id))?;
        let txn = Txn::new()
            .when(vec![Compare::mod_revision(
                key.as_str(),
                CompareOp::Equal,
                kv.mod_revision(),
            )])
            .and_then(vec![TxnOp::put(key.as_str(), payload, None)]);

        Ok(client.txn(txn).await?.succeeded())
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
        let key = self.keys.consumer_key(&consumer.id);
        let payload = serde_json::to_vec(consumer)?;
        let txn = Txn::new()
            .when(vec![Compare::create_revision(
                key.as_str(),
                CompareOp::Equal,
                0,
            )])
            .and_then(vec![TxnOp::put(key.as_str(), payload, None)]);

        let mut client = self.client.clone();
        Ok(client.txn(txn).await?.succeeded())
    }

    async fn delete_consumer(&self, consumer_id: &str) -> Result<bool> {
        let mut client = self.client.clone();
        let response = client.delete(self.keys.consumer_key(consumer_id), None).await?;
        Ok(response.deleted() > 0)
    }

    async fn subscribe(&self, topic: ChangeTopic) -> Result<Option<watch::Receiver<u64>>> {
        let prefix = match topic {
            ChangeTopic::Members => self.keys.nodes_prefix(),
            ChangeTopic::Consumers => self.keys.consumers_prefix(),
        };

        let mut client = self.client.clone();
        let (mut watcher, mut stream) = client
            .watch(prefix.as_str(), Some(WatchOptions::new().with_prefix()))
            .await?;
        let (tx, rx) = watch::channel(0u64);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = stream.message() => match message {
                        Ok(Some(response)) if !response.events().is_empty() => {
                            tx.send_modify(|version| *version += 1);
                        }
                        Ok(Some(_)) => {}
                        Ok(None) => {
                            tracing::warn!("etcd watch on {} ended", prefix);
                            break;
                        }
                        Err(error) => {
                            tracing::warn!("etcd watch on {} failed: {}", prefix, error);
                            break;
                        }
                    },
                    _ = tx.closed() => break,
                }
            }

            if let Err(error) = watcher.cancel().await {
                tracing::debug!("Failed to cancel etcd watch on {}: {}", prefix, error);
            }
        });

        Ok(Some(rx))
    }
}
