//! Task lifecycle primitives
//!
//! Every coordination layer is a [`Task`]. A [`GuardedTask`] runs an inner
//! task only while a [`Guard`] (membership, the election lock) is held and
//! keeps trying to re-acquire the guard after it is lost.

use crate::{Result, ShepherdError};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait Task: Send + Sync {
    /// Start the work. Calling it on a running task is a no-op.
    async fn start(&self) -> Result<()>;

    /// Stop the work and wait for it to wind down. Calling it on a stopped
    /// task is a no-op.
    async fn stop(&self);
}

#[async_trait]
pub trait Guard: Send + Sync {
    fn describe(&self) -> String;

    /// One acquisition attempt. `Some(token)` means the guard is held until
    /// `token` is cancelled; `None` means someone else holds it.
    async fn acquire(&self) -> Result<Option<CancellationToken>>;

    /// Give the guard up. Called after the dependent task has stopped,
    /// whether or not the guard was lost first.
    async fn release(&self);
}

struct RunningLoop {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

/// One background loop plus its cancellation token. Start and stop are
/// serialized by the slot's mutex and are both idempotent.
#[derive(Default)]
pub(crate) struct LoopSlot {
    running: Mutex<Option<RunningLoop>>,
}

impl LoopSlot {
    /// Spawns the loop unless one is already running. Returns whether a
    /// new loop was spawned.
    pub(crate) async fn start<F, Fut>(&self, spawn: F) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut running = self.running.lock().await;
        if running
            .as_ref()
            .is_some_and(|current| !current.handle.is_finished())
        {
            return false;
        }

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(spawn(shutdown.clone()));
        *running = Some(RunningLoop { shutdown, handle });
        true
    }

    /// Cancels the loop and waits for it. Returns whether there was one.
    pub(crate) async fn stop(&self) -> bool {
        let mut running = self.running.lock().await;
        let Some(RunningLoop { shutdown, handle }) = running.take() else {
            return false;
        };

        shutdown.cancel();
        if let Err(error) = handle.await {
            if error.is_panic() {
                tracing::error!("Background loop panicked before shutdown: {}", error);
            }
        }
        true
    }

    pub(crate) async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|current| !current.handle.is_finished())
    }
}

/// Spawns a lease keeper. If the keeper panics, `lost` is cancelled so
/// dependent work stops instead of running on an unrenewed lease.
pub(crate) fn spawn_keeper<Fut>(name: String, lost: CancellationToken, keeper: Fut) -> JoinHandle<()>
where
    Fut: Future<Output = ()> + Send + 'static,
{
    let inner = tokio::spawn(keeper);
    tokio::spawn(async move {
        if let Err(error) = inner.await {
            tracing::error!("{} keeper died: {}", name, error);
            lost.cancel();
        }
    })
}

enum Round {
    NotAcquired,
    GuardLost,
    Shutdown,
}

pub struct GuardedTask {
    name: String,
    guard: Arc<dyn Guard>,
    task: Arc<dyn Task>,
    retry_interval: Duration,
    supervisor: LoopSlot,
}

impl GuardedTask {
    pub fn new(
        name: impl Into<String>,
        guard: Arc<dyn Guard>,
        task: Arc<dyn Task>,
        retry_interval: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            guard,
            task,
            retry_interval,
            supervisor: LoopSlot::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn is_running(&self) -> bool {
        self.supervisor.is_running().await
    }
}

#[async_trait]
impl Task for GuardedTask {
    async fn start(&self) -> Result<()> {
        let name = self.name.clone();
        let guard = self.guard.clone();
        let task = self.task.clone();
        let retry_interval = self.retry_interval;

        let spawned = self
            .supervisor
            .start(move |shutdown| supervise(name, guard, task, retry_interval, shutdown))
            .await;
        if spawned {
            tracing::info!("Started {} (guard: {})", self.name, self.guard.describe());
        }
        Ok(())
    }

    async fn stop(&self) {
        if self.supervisor.stop().await {
            tracing::info!("Stopped {}", self.name);
        }
    }
}

/// Re-enters [`run_round`] until shutdown. Each round runs in its own tokio
/// task so a panic surfaces as a `JoinError` here instead of unwinding the
/// supervisor.
async fn supervise(
    name: String,
    guard: Arc<dyn Guard>,
    task: Arc<dyn Task>,
    retry_interval: Duration,
    shutdown: CancellationToken,
) {
    loop {
        let round = tokio::spawn(run_round(guard.clone(), task.clone(), shutdown.clone()));

        match round.await {
            Ok(Ok(Round::Shutdown)) => return,
            Ok(Ok(Round::GuardLost)) => {
                tracing::warn!("{}: lost {}; task stopped", name, guard.describe());
            }
            Ok(Ok(Round::NotAcquired)) => {
                tracing::debug!("{}: {} is held elsewhere", name, guard.describe());
            }
            Ok(Err(error)) if error.is_transient() => {
                tracing::warn!("{}: round failed, retrying: {}", name, error);
            }
            Ok(Err(error)) => {
                tracing::error!("{}: round failed, retrying: {}", name, error);
            }
            Err(error) => {
                let error = ShepherdError::TaskPanicked(error.to_string());
                tracing::error!("{}: {}; force-stopping task", name, error);
                task.stop().await;
                guard.release().await;
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(retry_interval) => {}
        }
    }
}

async fn run_round(
    guard: Arc<dyn Guard>,
    task: Arc<dyn Task>,
    shutdown: CancellationToken,
) -> Result<Round> {
    let acquired = tokio::select! {
        biased;
        acquired = guard.acquire() => acquired?,
        _ = shutdown.cancelled() => return Ok(Round::Shutdown),
    };
    let Some(lost) = acquired else {
        return Ok(Round::NotAcquired);
    };

    if let Err(error) = task.start().await {
        task.stop().await;
        guard.release().await;
        return Err(error);
    }

    let round = tokio::select! {
        _ = lost.cancelled() => Round::GuardLost,
        _ = shutdown.cancelled() => Round::Shutdown,
    };

    task.stop().await;
    guard.release().await;
    Ok(round)
}

/// Tasks started in order and stopped in reverse.
pub struct TaskSet {
    tasks: Vec<Arc<dyn Task>>,
}

impl TaskSet {
    pub fn new(tasks: Vec<Arc<dyn Task>>) -> Self {
        Self { tasks }
    }
}

#[async_trait]
impl Task for TaskSet {
    async fn start(&self) -> Result<()> {
        for (index, task) in self.tasks.iter().enumerate() {
            if let Err(error) = task.start().await {
                for started in self.tasks[..index].iter().rev() {
                    started.stop().await;
                }
                return Err(error);
            }
        }
        Ok(())
    }

    async fn stop(&self) {
        for task in self.tasks.iter().rev() {
            task.stop().await;
        }
    }
}
