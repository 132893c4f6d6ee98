use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shepherd_core::{
    ChangeTopic, ClusterNode, Consumer, ConsumerWorker, CoordinationConfig, LeaseStore,
    MemoryStore, NodeId, NodeInfo, Result, ShepherdError, SourceDescriptor,
};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct IdleWorker;

#[async_trait]
impl ConsumerWorker for IdleWorker {
    async fn run(&self, _consumer: Consumer, shutdown: CancellationToken) -> Result<()> {
        shutdown.cancelled().await;
        Ok(())
    }
}

fn fast_config() -> CoordinationConfig {
    CoordinationConfig {
        node_ttl: Duration::from_secs(2),
        lock_ttl: Duration::from_secs(3),
        lock_keepalive: Duration::from_secs(1),
        election_poll: Duration::from_millis(200),
        guard_retry: Duration::from_millis(200),
        dispatch_interval: Duration::from_secs(1),
        executor_poll: Duration::from_millis(500),
        ..Default::default()
    }
}

/// The shared store as one node sees it. A cut view fails every call, as
/// if the node were partitioned away from the store.
struct NodeView {
    inner: Arc<MemoryStore>,
    cut: AtomicBool,
    release_delay: Duration,
}

impl NodeView {
    fn new(inner: &Arc<MemoryStore>, release_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: inner.clone(),
            cut: AtomicBool::new(false),
            release_delay,
        })
    }

    fn cut(&self) {
        self.cut.store(true, Ordering::SeqCst);
    }

    fn reachable(&self) -> Result<()> {
        if self.cut.load(Ordering::SeqCst) {
            return Err(ShepherdError::Backend("store unreachable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for NodeView {
    fn backend_name(&self) -> &'static str {
        "view"
    }

    async fn join(&self, node: &NodeInfo, ttl: Duration) -> Result<bool> {
        self.reachable()?;
        self.inner.join(node, ttl).await
    }

    async fn keep_alive(&self, node_id: &NodeId, ttl: Duration) -> Result<bool> {
        self.reachable()?;
        self.inner.keep_alive(node_id, ttl).await
    }

    async fn leave(&self, node_id: &NodeId) -> Result<()> {
        self.reachable()?;
        self.inner.leave(node_id).await
    }

    async fn list_nodes(&self, since: Option<DateTime<Utc>>) -> Result<Vec<NodeInfo>> {
        self.reachable()?;
        self.inner.list_nodes(since).await
    }

    async fn lock(&self, key: &str, holder: &NodeId, ttl: Duration) -> Result<bool> {
        self.reachable()?;
        self.inner.lock(key, holder, ttl).await
    }

    async fn refresh(&self, key: &str, holder: &NodeId, ttl: Duration) -> Result<bool> {
        self.reachable()?;
        self.inner.refresh(key, holder, ttl).await
    }

    async fn release(&self, key: &str, holder: &NodeId) -> Result<()> {
        tokio::time::sleep(self.release_delay).await;
        self.reachable()?;
        self.inner.release(key, holder).await
    }

    async fn fetch_consumers(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Consumer>> {
        self.reachable()?;
        self.inner.fetch_consumers(since).await
    }

    async fn assign(
        &self,
        consumer_id: &str,
        node_id: &NodeId,
        expected: Option<&NodeId>,
    ) -> Result<bool> {
        self.reachable()?;
        self.inner.assign(consumer_id, node_id, expected).await
    }

    async fn find_by_node_id(&self, node_id: &NodeId) -> Result<Vec<Consumer>> {
        self.reachable()?;
        self.inner.find_by_node_id(node_id).await
    }

    async fn create_consumer(&self, consumer: &Consumer) -> Result<bool> {
        self.reachable()?;
        self.inner.create_consumer(consumer).await
    }

    async fn delete_consumer(&self, consumer_id: &str) -> Result<bool> {
        self.reachable()?;
        self.inner.delete_consumer(consumer_id).await
    }

    async fn subscribe(&self, topic: ChangeTopic) -> Result<Option<watch::Receiver<u64>>> {
        self.reachable()?;
        self.inner.subscribe(topic).await
    }
}

fn member(id: usize, store: Arc<dyn LeaseStore>) -> ClusterNode {
    ClusterNode::new(
        NodeId::new(format!("node-{}", id)),
        None,
        store,
        fast_config(),
        Arc::new(IdleWorker),
    )
    .unwrap()
}

fn cluster(store: &Arc<MemoryStore>, size: usize) -> Vec<ClusterNode> {
    (0..size).map(|i| member(i, store.clone())).collect()
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..600 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn leaders(nodes: &[ClusterNode]) -> Vec<NodeId> {
    nodes
        .iter()
        .filter(|node| node.is_leader())
        .map(|node| node.node_id().clone())
        .collect()
}

fn queue(id: &str) -> Consumer {
    Consumer::new(
        id,
        SourceDescriptor::Sqs {
            queue_arn: format!("arn:aws:sqs:eu-west-1:000000000000:{}", id),
            concurrency: 2,
        },
    )
}

/// Every consumer sits on a live node and runs on exactly the node it is
/// assigned to. With `balanced`, loads also differ by at most one.
async fn settled(
    store: &MemoryStore,
    nodes: &[&ClusterNode],
    expected: usize,
    balanced: bool,
) -> bool {
    let Ok(live) = store.list_nodes(None).await else {
        return false;
    };
    let live: HashSet<NodeId> = live.into_iter().map(|node| node.node_id).collect();
    let Ok(consumers) = store.fetch_consumers(None).await else {
        return false;
    };
    if consumers.len() != expected {
        return false;
    }

    let mut load: BTreeMap<NodeId, usize> = nodes
        .iter()
        .map(|node| (node.node_id().clone(), 0))
        .collect();
    for consumer in &consumers {
        match &consumer.assigned_node {
            Some(node_id) if live.contains(node_id) => {
                *load.entry(node_id.clone()).or_default() += 1
            }
            _ => return false,
        }
    }
    let max = load.values().max().copied().unwrap_or_default();
    let min = load.values().min().copied().unwrap_or_default();
    if balanced && max - min > 1 {
        return false;
    }

    let mut running = Vec::new();
    for node in nodes {
        let ids = node.running_consumers().await;
        let mut mine: Vec<String> = consumers
            .iter()
            .filter(|consumer| consumer.is_assigned_to(node.node_id()))
            .map(|consumer| consumer.id.clone())
            .collect();
        mine.sort();
        if ids != mine {
            return false;
        }
        running.extend(ids);
    }
    let unique: HashSet<&String> = running.iter().collect();
    unique.len() == running.len()
}

#[tokio::test(start_paused = true)]
async fn test_at_most_one_leader_at_any_time() {
    let store = Arc::new(MemoryStore::new());
    let nodes = cluster(&store, 5);
    for node in &nodes {
        node.start().await.unwrap();
    }

    // Sample across many election rounds.
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(leaders(&nodes).len() <= 1);
    }
    assert_eq!(leaders(&nodes).len(), 1);

    for node in &nodes {
        node.stop().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_consumers_balance_across_three_nodes() {
    let store = Arc::new(MemoryStore::new());
    let nodes = cluster(&store, 3);
    for node in &nodes {
        node.start().await.unwrap();
    }

    eventually("all nodes to join", || async {
        store.list_nodes(None).await.map(|n| n.len()).unwrap_or_default() == 3
    })
    .await;
    eventually("a leader", || async { leaders(&nodes).len() == 1 }).await;

    for i in 0..5 {
        assert!(store.create_consumer(&queue(&format!("q{}", i))).await.unwrap());
    }

    let all: Vec<&ClusterNode> = nodes.iter().collect();
    eventually("balanced assignment", || settled(&store, &all, 5, true)).await;

    for node in &nodes {
        node.stop().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_partitioned_leader_hands_over() {
    let store = Arc::new(MemoryStore::new());
    let views: Vec<Arc<NodeView>> = (0..3)
        .map(|_| NodeView::new(&store, Duration::ZERO))
        .collect();
    let nodes: Vec<ClusterNode> = views
        .iter()
        .enumerate()
        .map(|(i, view)| member(i, view.clone()))
        .collect();
    for node in &nodes {
        node.start().await.unwrap();
    }

    eventually("all nodes to join", || async {
        store.list_nodes(None).await.map(|n| n.len()).unwrap_or_default() == 3
    })
    .await;
    eventually("a leader", || async { leaders(&nodes).len() == 1 }).await;
    for i in 0..5 {
        store.create_consumer(&queue(&format!("q{}", i))).await.unwrap();
    }
    let all: Vec<&ClusterNode> = nodes.iter().collect();
    eventually("initial assignment", || settled(&store, &all, 5, true)).await;

    // Cut the leader off from the store; it can neither renew nor rejoin.
    let old_leader = leaders(&nodes)[0].clone();
    let index = nodes
        .iter()
        .position(|node| *node.node_id() == old_leader)
        .unwrap();
    views[index].cut();
    let cut_at = Instant::now();

    // The lock expires within one lock TTL of the last refresh; a survivor
    // picks it up on its next poll.
    let config = fast_config();
    let deadline = config.lock_ttl + config.election_poll + Duration::from_millis(500);
    loop {
        let current = leaders(&nodes);
        assert!(current.len() <= 1, "two leaders: {:?}", current);
        if current.len() == 1 && current[0] != old_leader {
            break;
        }
        assert!(
            cut_at.elapsed() <= deadline,
            "no new leader {:?} after the cut",
            cut_at.elapsed()
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!nodes[index].is_leader());

    let survivors: Vec<&ClusterNode> = nodes
        .iter()
        .filter(|node| *node.node_id() != old_leader)
        .collect();
    eventually("reassignment to survivors", || {
        settled(&store, &survivors, 5, true)
    })
    .await;
    assert!(nodes[index].running_consumers().await.is_empty());

    for node in &nodes {
        node.stop().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_lost_membership_stops_workers_first() {
    let store = Arc::new(MemoryStore::new());
    // Leadership winds down slowly; workers must not wait for it.
    let view = NodeView::new(&store, Duration::from_secs(2));
    let node = member(0, view);
    node.start().await.unwrap();
    eventually("leadership", || async { node.is_leader() }).await;

    store.create_consumer(&queue("q0")).await.unwrap();
    eventually("the worker to run", || async {
        node.running_consumers().await == vec!["q0".to_string()]
    })
    .await;

    store.leave(node.node_id()).await.unwrap();
    let dropped_at = Instant::now();

    // Noticed on the next renewal, then the executor goes down first.
    let bound = fast_config().renew_interval() + Duration::from_millis(300);
    while !node.running_consumers().await.is_empty() {
        assert!(
            dropped_at.elapsed() <= bound,
            "workers still running {:?} after membership loss",
            dropped_at.elapsed()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    node.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stopped_node_consumers_are_reassigned() {
    let store = Arc::new(MemoryStore::new());
    let nodes = cluster(&store, 3);
    for node in &nodes {
        node.start().await.unwrap();
    }

    eventually("all nodes to join", || async {
        store.list_nodes(None).await.map(|n| n.len()).unwrap_or_default() == 3
    })
    .await;
    eventually("a leader", || async { leaders(&nodes).len() == 1 }).await;
    for i in 0..5 {
        store.create_consumer(&queue(&format!("q{}", i))).await.unwrap();
    }
    let all: Vec<&ClusterNode> = nodes.iter().collect();
    eventually("initial assignment", || settled(&store, &all, 5, true)).await;

    let old_leader = leaders(&nodes)[0].clone();
    let (gone, survivors): (Vec<&ClusterNode>, Vec<&ClusterNode>) =
        nodes.iter().partition(|node| *node.node_id() == old_leader);
    gone[0].stop().await;

    eventually("a surviving leader", || async {
        survivors.iter().filter(|node| node.is_leader()).count() == 1
    })
    .await;
    eventually("reassignment to survivors", || {
        settled(&store, &survivors, 5, true)
    })
    .await;

    let consumers = store.fetch_consumers(None).await.unwrap();
    assert!(consumers.iter().all(|c| !c.is_assigned_to(&old_leader)));

    for node in survivors {
        node.stop().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_new_consumer_lands_on_idle_node() {
    let store = Arc::new(MemoryStore::new());
    let nodes = cluster(&store, 2);
    for node in &nodes {
        node.start().await.unwrap();
    }
    eventually("both nodes to join", || async {
        store.list_nodes(None).await.map(|n| n.len()).unwrap_or_default() == 2
    })
    .await;

    // Pre-load node-0 by hand; the dispatcher must not move it.
    store.create_consumer(&queue("pinned")).await.unwrap();
    store.assign("pinned", &NodeId::from("node-0"), None).await.unwrap();
    store.create_consumer(&queue("fresh")).await.unwrap();

    let all: Vec<&ClusterNode> = nodes.iter().collect();
    eventually("fresh consumer placed", || settled(&store, &all, 2, true)).await;
    let on_one = store.find_by_node_id(&NodeId::from("node-1")).await.unwrap();
    assert_eq!(on_one.len(), 1);
    assert_eq!(on_one[0].id, "fresh");

    for node in &nodes {
        node.stop().await;
    }
}
