use crate::error::with_timeout;
use crate::lease::{Renewal, RenewalTiming};
use crate::store::LeaseStore;
use crate::task::Guard;
use crate::{CoordinationConfig, NodeId, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Candidate,
    Holder,
}

/// Leader election over a single named lock. A candidate tries the lock
/// once per [`Guard::acquire`]; the holder refreshes it every keepalive
/// interval until the refresh fails or the lock is released.
pub struct Election {
    store: Arc<dyn LeaseStore>,
    key: String,
    holder: NodeId,
    ttl: Duration,
    keepalive: Duration,
    call_timeout: Duration,
    tenure: Mutex<Option<Renewal>>,
}

impl Election {
    pub fn new(store: Arc<dyn LeaseStore>, holder: NodeId, config: &CoordinationConfig) -> Self {
        Self {
            store,
            key: config.lock_key.clone(),
            holder,
            ttl: config.lock_ttl,
            keepalive: config.lock_keepalive,
            call_timeout: config.call_timeout,
            tenure: Mutex::new(None),
        }
    }

    fn tenure(&self) -> MutexGuard<'_, Option<Renewal>> {
        self.tenure.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Holder only while the lock is held and its refresh loop is healthy.
    pub fn role(&self) -> Role {
        match self.tenure().as_ref() {
            Some(renewal) if !renewal.alive.is_cancelled() => Role::Holder,
            _ => Role::Candidate,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.role() == Role::Holder
    }
}

#[async_trait]
impl Guard for Election {
    fn describe(&self) -> String {
        format!("lock '{}'", self.key)
    }

    async fn acquire(&self) -> Result<Option<CancellationToken>> {
        let stale = self.tenure().take();
        if let Some(stale) = stale {
            stale.stop().await;
        }

        let won = with_timeout(
            self.call_timeout,
            self.store.lock(&self.key, &self.holder, self.ttl),
        )
        .await?;
        if !won {
            return Ok(None);
        }

        let store = self.store.clone();
        let key = self.key.clone();
        let holder = self.holder.clone();
        let ttl = self.ttl;
        let renewal = Renewal::spawn(
            format!("Lock '{}' held by {}", self.key, self.holder),
            CancellationToken::new(),
            RenewalTiming {
                interval: self.keepalive,
                ttl,
                call_timeout: self.call_timeout,
            },
            move || {
                let store = store.clone();
                let key = key.clone();
                let holder = holder.clone();
                Box::pin(async move { store.refresh(&key, &holder, ttl).await })
            },
        );

        let lost = renewal.alive.clone();
        *self.tenure() = Some(renewal);
        tracing::info!("Node {} is now leader (lock '{}')", self.holder, self.key);
        Ok(Some(lost))
    }

    async fn release(&self) {
        let tenure = self.tenure().take();
        let Some(renewal) = tenure else {
            return;
        };
        renewal.stop().await;

        match with_timeout(self.call_timeout, self.store.release(&self.key, &self.holder)).await {
            Ok(()) => tracing::info!("Node {} released lock '{}'", self.holder, self.key),
            Err(error) => tracing::warn!(
                "Node {} failed to release lock '{}', leaving it to expire: {}",
                self.holder,
                self.key,
                error
            ),
        }
    }
}
