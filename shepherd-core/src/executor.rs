use crate::error::with_timeout;
use crate::store::{LeaseStore, next_change, subscribe_or_poll};
use crate::task::{LoopSlot, Task};
use crate::{ChangeTopic, Consumer, CoordinationConfig, NodeId, Result};
use async_trait::async_trait;
use futures_util::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Runs one consumer. Implementations return when `shutdown` is cancelled;
/// returning earlier, with or without an error, gets the worker restarted
/// on the next reconcile.
#[async_trait]
pub trait ConsumerWorker: Send + Sync {
    async fn run(&self, consumer: Consumer, shutdown: CancellationToken) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started: usize,
    pub stopped: usize,
    pub reaped: usize,
    pub unchanged: usize,
}

struct RunningWorker {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

struct ExecutorInner {
    store: Arc<dyn LeaseStore>,
    node_id: NodeId,
    worker: Arc<dyn ConsumerWorker>,
    call_timeout: Duration,
    stop_timeout: Duration,
    workers: Mutex<HashMap<String, RunningWorker>>,
}

/// Keeps one worker running per consumer assigned to this node.
pub struct Executor {
    inner: Arc<ExecutorInner>,
    poll_interval: Duration,
    slot: LoopSlot,
}

impl Executor {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        node_id: NodeId,
        worker: Arc<dyn ConsumerWorker>,
        config: &CoordinationConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                store,
                node_id,
                worker,
                call_timeout: config.call_timeout,
                stop_timeout: config.worker_stop_timeout,
                workers: Mutex::new(HashMap::new()),
            }),
            poll_interval: config.executor_poll,
            slot: LoopSlot::default(),
        }
    }

    /// Consumers currently assigned to this node.
    pub async fn load(&self) -> Result<Vec<Consumer>> {
        self.inner.load().await
    }

    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        self.inner.reconcile().await
    }

    /// Ids of consumers with a live worker, sorted.
    pub async fn running(&self) -> Vec<String> {
        let workers = self.inner.workers.lock().await;
        let mut ids: Vec<String> = workers
            .iter()
            .filter(|(_, worker)| !worker.handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

impl ExecutorInner {
    async fn load(&self) -> Result<Vec<Consumer>> {
        with_timeout(self.call_timeout, self.store.find_by_node_id(&self.node_id)).await
    }

    async fn reconcile(&self) -> Result<ReconcileReport> {
        // A failed load leaves the running set alone.
        let desired = self.load().await?;
        let mut report = ReconcileReport::default();
        let mut workers = self.workers.lock().await;

        let finished: Vec<String> = workers
            .iter()
            .filter(|(_, worker)| worker.handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        for id in finished {
            if let Some(worker) = workers.remove(&id) {
                if let Err(error) = worker.handle.await {
                    tracing::error!("Worker for consumer {} panicked: {}", id, error);
                }
                report.reaped += 1;
            }
        }

        let wanted: HashSet<&str> = desired.iter().map(|consumer| consumer.id.as_str()).collect();
        let removed: Vec<String> = workers
            .keys()
            .filter(|id| !wanted.contains(id.as_str()))
            .cloned()
            .collect();
        let stopping: Vec<(String, RunningWorker)> = removed
            .into_iter()
            .filter_map(|id| workers.remove(&id).map(|worker| (id, worker)))
            .collect();
        report.stopped = stopping.len();
        self.stop_workers(stopping).await;

        for consumer in desired {
            if workers.contains_key(&consumer.id) {
                report.unchanged += 1;
                continue;
            }
            let id = consumer.id.clone();
            let worker = self.spawn_worker(consumer);
            workers.insert(id, worker);
            report.started += 1;
        }

        Ok(report)
    }

    fn spawn_worker(&self, consumer: Consumer) -> RunningWorker {
        tracing::info!(
            "Starting worker for consumer {} ({}) on {}",
            consumer.id,
            consumer.source,
            self.node_id
        );

        let shutdown = CancellationToken::new();
        let worker = self.worker.clone();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            let id = consumer.id.clone();
            match worker.run(consumer, token).await {
                Ok(()) => tracing::debug!("Worker for consumer {} exited", id),
                Err(error) => tracing::warn!("Worker for consumer {} failed: {}", id, error),
            }
        });

        RunningWorker { shutdown, handle }
    }

    async fn stop_workers(&self, workers: Vec<(String, RunningWorker)>) {
        let stop_timeout = self.stop_timeout;
        join_all(workers.into_iter().map(|(id, worker)| async move {
            let RunningWorker {
                shutdown,
                mut handle,
            } = worker;
            shutdown.cancel();
            match tokio::time::timeout(stop_timeout, &mut handle).await {
                Ok(Ok(())) => tracing::info!("Stopped worker for consumer {}", id),
                Ok(Err(error)) => {
                    tracing::error!("Worker for consumer {} panicked: {}", id, error)
                }
                Err(_) => {
                    tracing::warn!(
                        "Worker for consumer {} ignored shutdown for {:?}, aborting",
                        id,
                        stop_timeout
                    );
                    handle.abort();
                }
            }
        }))
        .await;
    }

    async fn stop_all(&self) {
        let drained: Vec<(String, RunningWorker)> = self.workers.lock().await.drain().collect();
        if drained.is_empty() {
            return;
        }
        tracing::info!("Stopping {} workers on {}", drained.len(), self.node_id);
        self.stop_workers(drained).await;
    }
}

#[async_trait]
impl Task for Executor {
    async fn start(&self) -> Result<()> {
        let inner = self.inner.clone();
        let poll_interval = self.poll_interval;
        if self
            .slot
            .start(move |shutdown| execute_loop(inner, poll_interval, shutdown))
            .await
        {
            tracing::info!("Executor started on {}", self.inner.node_id);
        }
        Ok(())
    }

    async fn stop(&self) {
        let was_running = self.slot.stop().await;
        self.inner.stop_all().await;
        if was_running {
            tracing::info!("Executor stopped on {}", self.inner.node_id);
        }
    }
}

async fn execute_loop(inner: Arc<ExecutorInner>, poll_interval: Duration, shutdown: CancellationToken) {
    let mut changes =
        subscribe_or_poll(inner.store.as_ref(), ChangeTopic::Consumers, inner.call_timeout).await;

    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
            changed = next_change(&mut changes) => if !changed { continue },
        }

        match inner.reconcile().await {
            Ok(report) if report.started + report.stopped + report.reaped > 0 => {
                tracing::info!(
                    "Reconciled {}: {} started, {} stopped, {} reaped, {} unchanged",
                    inner.node_id,
                    report.started,
                    report.stopped,
                    report.reaped,
                    report.unchanged
                );
            }
            Ok(_) => {}
            Err(error) => tracing::warn!("Reconcile on {} failed: {}", inner.node_id, error),
        }
    }
}
