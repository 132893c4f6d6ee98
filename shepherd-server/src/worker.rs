use async_trait::async_trait;
use shepherd_core::{Consumer, ConsumerWorker, Result};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Placeholder worker that claims a consumer and logs a heartbeat until it
/// is told to stop. Queue and stream clients plug in behind the same trait.
pub struct LogWorker {
    heartbeat: Duration,
}

impl LogWorker {
    pub fn new(heartbeat: Duration) -> Self {
        Self { heartbeat }
    }
}

#[async_trait]
impl ConsumerWorker for LogWorker {
    async fn run(&self, consumer: Consumer, shutdown: CancellationToken) -> Result<()> {
        tracing::info!("Consuming {} from {}", consumer.id, consumer.source);

        let mut ticker = tokio::time::interval(self.heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    tracing::debug!("Consumer {} still attached to {}", consumer.id, consumer.source);
                }
            }
        }

        tracing::info!("Released consumer {}", consumer.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shepherd_core::SourceDescriptor;

    #[tokio::test(start_paused = true)]
    async fn test_runs_until_cancelled() {
        let worker = LogWorker::new(Duration::from_secs(1));
        let shutdown = CancellationToken::new();
        let consumer = Consumer::new(
            "orders",
            SourceDescriptor::Kinesis {
                stream_name: "orders".to_string(),
            },
        );

        let handle = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { worker.run(consumer, shutdown).await }
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!handle.is_finished());

        shutdown.cancel();
        assert!(handle.await.unwrap().is_ok());
    }
}
