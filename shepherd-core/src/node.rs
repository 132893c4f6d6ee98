use crate::dispatcher::Dispatcher;
use crate::election::Election;
use crate::executor::{ConsumerWorker, Executor};
use crate::registry::NodeRegistry;
use crate::store::LeaseStore;
use crate::task::{GuardedTask, Task, TaskSet};
use crate::{CoordinationConfig, NodeId, NodeInfo, Result, ShepherdError};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// One cluster member with the full coordination stack:
///
/// ```text
/// Guarded(membership) -> { Guarded(election lock) -> Dispatcher, Executor }
/// ```
///
/// The executor runs whenever this node is a member; the dispatcher runs
/// only while it also holds the election lock.
pub struct ClusterNode {
    node_id: NodeId,
    registry: Arc<NodeRegistry>,
    election: Arc<Election>,
    executor: Arc<Executor>,
    root: GuardedTask,
    shutdown: CancellationToken,
}

impl ClusterNode {
    pub fn new(
        node_id: NodeId,
        address: Option<String>,
        store: Arc<dyn LeaseStore>,
        config: CoordinationConfig,
        worker: Arc<dyn ConsumerWorker>,
    ) -> Result<Self> {
        config.validate()?;

        let shutdown = CancellationToken::new();
        let registry = Arc::new(NodeRegistry::new(
            store.clone(),
            node_id.clone(),
            address,
            &config,
            shutdown.clone(),
        ));
        let election = Arc::new(Election::new(store.clone(), node_id.clone(), &config));
        let executor = Arc::new(Executor::new(
            store.clone(),
            node_id.clone(),
            worker,
            &config,
        ));
        let dispatcher = Arc::new(Dispatcher::new(store, &config));

        let leadership = Arc::new(GuardedTask::new(
            format!("dispatcher on {}", node_id),
            election.clone(),
            dispatcher,
            config.election_poll,
        ));
        // Stopped in reverse, so workers go down before leadership winds down.
        let member_tasks = Arc::new(TaskSet::new(vec![
            leadership as Arc<dyn Task>,
            executor.clone(),
        ]));
        let root = GuardedTask::new(
            format!("member tasks on {}", node_id),
            registry.clone(),
            member_tasks,
            config.guard_retry,
        );

        Ok(Self {
            node_id,
            registry,
            election,
            executor,
            root,
            shutdown,
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub async fn start(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(ShepherdError::Internal(format!(
                "node {} was stopped and cannot be restarted",
                self.node_id
            )));
        }
        tracing::info!("Starting node {}", self.node_id);
        self.root.start().await
    }

    /// Stops every layer and leaves the cluster. Safe to call repeatedly.
    pub async fn stop(&self) {
        self.root.stop().await;
        self.shutdown.cancel();
    }

    pub fn is_leader(&self) -> bool {
        self.election.is_leader()
    }

    pub async fn is_member(&self) -> bool {
        self.registry.is_joined().await
    }

    /// Ids of consumers this node is currently running.
    pub async fn running_consumers(&self) -> Vec<String> {
        self.executor.running().await
    }

    pub async fn members(&self) -> Result<Vec<NodeInfo>> {
        self.registry.nodes(None).await
    }
}
