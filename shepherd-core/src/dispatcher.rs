//! Consumer dispatcher
//!
//! Runs on the elected leader only. Each pass snapshots the live members
//! and all consumers, keeps every consumer that already sits on a live
//! node, and hands the rest to the least-loaded live nodes.

use crate::error::with_timeout;
use crate::store::{LeaseStore, next_change, subscribe_or_poll};
use crate::task::{LoopSlot, Task};
use crate::{ChangeTopic, Consumer, CoordinationConfig, NodeId, NodeInfo, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// One planned move. `previous` is the assignment the write is
/// conditional on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub consumer_id: String,
    pub node_id: NodeId,
    pub previous: Option<NodeId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebalanceReport {
    pub live_nodes: usize,
    pub consumers: usize,
    pub planned: usize,
    pub assigned: usize,
    pub failed: usize,
    /// Set when shutdown cut the pass short; the remaining moves were not
    /// attempted.
    pub interrupted: bool,
}

/// Computes the moves for one pass. Consumers that are unassigned or sit
/// on a node missing from `nodes` are placed, oldest first, on the node
/// with the fewest consumers; ties go to the lowest node id.
pub fn plan_assignments(nodes: &[NodeInfo], consumers: &[Consumer]) -> Vec<Assignment> {
    if nodes.is_empty() || consumers.is_empty() {
        return Vec::new();
    }

    let mut load: BTreeMap<&NodeId, usize> = nodes.iter().map(|node| (&node.node_id, 0)).collect();
    let mut candidates = Vec::new();
    for consumer in consumers {
        match consumer
            .assigned_node
            .as_ref()
            .and_then(|node_id| load.get_mut(node_id))
        {
            Some(count) => *count += 1,
            None => candidates.push(consumer),
        }
    }
    candidates.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));

    let mut plan = Vec::with_capacity(candidates.len());
    for consumer in candidates {
        // BTreeMap iterates by node id and min_by_key keeps the first minimum.
        let Some(target) = load
            .iter()
            .min_by_key(|(_, count)| **count)
            .map(|(node_id, _)| *node_id)
        else {
            break;
        };
        if let Some(count) = load.get_mut(target) {
            *count += 1;
        }

        plan.push(Assignment {
            consumer_id: consumer.id.clone(),
            node_id: target.clone(),
            previous: consumer.assigned_node.clone(),
        });
    }
    plan
}

pub struct Dispatcher {
    store: Arc<dyn LeaseStore>,
    interval: Duration,
    call_timeout: Duration,
    slot: LoopSlot,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn LeaseStore>, config: &CoordinationConfig) -> Self {
        Self {
            store,
            interval: config.dispatch_interval,
            call_timeout: config.call_timeout,
            slot: LoopSlot::default(),
        }
    }

    /// Runs a single pass.
    pub async fn rebalance(&self) -> Result<RebalanceReport> {
        rebalance(self.store.as_ref(), self.call_timeout, &CancellationToken::new()).await
    }
}

#[async_trait]
impl Task for Dispatcher {
    async fn start(&self) -> Result<()> {
        let store = self.store.clone();
        let interval = self.interval;
        let call_timeout = self.call_timeout;
        if self
            .slot
            .start(move |shutdown| dispatch_loop(store, interval, call_timeout, shutdown))
            .await
        {
            tracing::info!("Dispatcher started (interval {:?})", self.interval);
        }
        Ok(())
    }

    async fn stop(&self) {
        if self.slot.stop().await {
            tracing::info!("Dispatcher stopped");
        }
    }
}

async fn dispatch_loop(
    store: Arc<dyn LeaseStore>,
    interval: Duration,
    call_timeout: Duration,
    shutdown: CancellationToken,
) {
    let mut members = subscribe_or_poll(store.as_ref(), ChangeTopic::Members, call_timeout).await;
    let mut consumers =
        subscribe_or_poll(store.as_ref(), ChangeTopic::Consumers, call_timeout).await;

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
            changed = next_change(&mut members) => if !changed { continue },
            changed = next_change(&mut consumers) => if !changed { continue },
        }

        match rebalance(store.as_ref(), call_timeout, &shutdown).await {
            Ok(report) if report.interrupted => {
                tracing::info!(
                    "Rebalance pass interrupted: {} of {} assigned",
                    report.assigned,
                    report.planned
                );
                return;
            }
            Ok(report) if report.planned > 0 => tracing::info!(
                "Rebalance pass: {} nodes, {} consumers, {} assigned, {} failed",
                report.live_nodes,
                report.consumers,
                report.assigned,
                report.failed
            ),
            Ok(_) => tracing::debug!("Rebalance pass: nothing to move"),
            Err(error) => tracing::warn!("Rebalance pass failed, retrying next tick: {}", error),
        }
    }
}

/// Runs `call` unless `shutdown` fires first, in which case the call is
/// dropped and `None` comes back.
async fn unless_stopped<T, F>(shutdown: &CancellationToken, call: F) -> Option<T>
where
    F: std::future::Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => None,
        outcome = call => Some(outcome),
    }
}

async fn rebalance(
    store: &dyn LeaseStore,
    call_timeout: Duration,
    shutdown: &CancellationToken,
) -> Result<RebalanceReport> {
    let interrupted = RebalanceReport {
        interrupted: true,
        ..Default::default()
    };

    // Always a full scan; a missed incremental update would otherwise
    // leave a consumer stranded on a dead node.
    let Some(nodes) =
        unless_stopped(shutdown, with_timeout(call_timeout, store.list_nodes(None))).await
    else {
        return Ok(interrupted);
    };
    let nodes = nodes?;
    let Some(consumers) =
        unless_stopped(shutdown, with_timeout(call_timeout, store.fetch_consumers(None))).await
    else {
        return Ok(interrupted);
    };
    let consumers = consumers?;

    let mut report = RebalanceReport {
        live_nodes: nodes.len(),
        consumers: consumers.len(),
        ..Default::default()
    };

    let plan = plan_assignments(&nodes, &consumers);
    report.planned = plan.len();

    for assignment in plan {
        let call = with_timeout(
            call_timeout,
            store.assign(
                &assignment.consumer_id,
                &assignment.node_id,
                assignment.previous.as_ref(),
            ),
        );
        let Some(outcome) = unless_stopped(shutdown, call).await else {
            report.interrupted = true;
            break;
        };

        match outcome {
            Ok(true) => {
                report.assigned += 1;
                match &assignment.previous {
                    Some(previous) => tracing::info!(
                        "Moved consumer {} from dead node {} to {}",
                        assignment.consumer_id,
                        previous,
                        assignment.node_id
                    ),
                    None => tracing::info!(
                        "Assigned consumer {} to {}",
                        assignment.consumer_id,
                        assignment.node_id
                    ),
                }
            }
            Ok(false) => {
                report.failed += 1;
                tracing::warn!(
                    "Consumer {} changed during the pass, skipping",
                    assignment.consumer_id
                );
            }
            Err(error) => {
                report.failed += 1;
                tracing::warn!(
                    "Failed to assign consumer {} to {}: {}",
                    assignment.consumer_id,
                    assignment.node_id,
                    error
                );
            }
        }
    }

    Ok(report)
}
