use crate::Result;
use crate::error::with_timeout;
use crate::task::spawn_keeper;
use futures_util::future::BoxFuture;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// How a held lease is kept alive.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RenewalTiming {
    pub interval: Duration,
    pub ttl: Duration,
    pub call_timeout: Duration,
}

/// A running renewal loop for one held lease. `alive` is cancelled when the
/// lease is gone or the loop itself dies. Transient errors are retried
/// until a full TTL passes without a success; any other error gives the
/// lease up at once.
pub(crate) struct Renewal {
    pub alive: CancellationToken,
    keeper: JoinHandle<()>,
}

impl Renewal {
    pub(crate) fn spawn<F>(
        name: String,
        alive: CancellationToken,
        timing: RenewalTiming,
        renew: F,
    ) -> Self
    where
        F: FnMut() -> BoxFuture<'static, Result<bool>> + Send + 'static,
    {
        let keeper = spawn_keeper(
            name.clone(),
            alive.clone(),
            renew_until_lost(name, alive.clone(), timing, renew),
        );
        Self { alive, keeper }
    }

    /// Stops renewing. The lease itself is left to the caller.
    pub(crate) async fn stop(self) {
        self.alive.cancel();
        if let Err(error) = self.keeper.await {
            tracing::debug!("Renewal monitor ended abnormally: {}", error);
        }
    }
}

async fn renew_until_lost<F>(
    name: String,
    alive: CancellationToken,
    timing: RenewalTiming,
    mut renew: F,
) where
    F: FnMut() -> BoxFuture<'static, Result<bool>>,
{
    let mut interval = tokio::time::interval(timing.interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await; // Skip first immediate tick
    let mut last_renewed = Instant::now();

    loop {
        tokio::select! {
            _ = alive.cancelled() => return,
            _ = interval.tick() => {}
        }

        match with_timeout(timing.call_timeout, renew()).await {
            Ok(true) => last_renewed = Instant::now(),
            Ok(false) => {
                tracing::warn!("{} lease is gone", name);
                alive.cancel();
                return;
            }
            Err(error) if !error.is_transient() => {
                tracing::error!("{} renewal cannot succeed, giving it up: {}", name, error);
                alive.cancel();
                return;
            }
            Err(error) => {
                if last_renewed.elapsed() >= timing.ttl {
                    tracing::warn!(
                        "{} not renewed for {:?}, giving it up: {}",
                        name,
                        timing.ttl,
                        error
                    );
                    alive.cancel();
                    return;
                }
                tracing::warn!("{} renewal failed, will retry: {}", name, error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ShepherdError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn timing() -> RenewalTiming {
        RenewalTiming {
            interval: Duration::from_secs(1),
            ttl: Duration::from_secs(3),
            call_timeout: Duration::from_millis(500),
        }
    }

    fn answer(outcome: Result<bool>) -> BoxFuture<'static, Result<bool>> {
        Box::pin(async move { outcome })
    }

    fn hang() -> BoxFuture<'static, Result<bool>> {
        Box::pin(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(true)
        })
    }

    fn spawn<F>(alive: CancellationToken, renew: F) -> Renewal
    where
        F: FnMut() -> BoxFuture<'static, Result<bool>> + Send + 'static,
    {
        Renewal::spawn("test".to_string(), alive, timing(), renew)
    }

    #[tokio::test(start_paused = true)]
    async fn test_renews_until_store_says_gone() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let renewal = spawn(CancellationToken::new(), move || {
            answer(Ok(counter.fetch_add(1, Ordering::SeqCst) < 3))
        });

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(!renewal.alive.is_cancelled());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(renewal.alive.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        renewal.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_errors_give_up_after_ttl() {
        let renewal = spawn(CancellationToken::new(), || {
            answer(Err(ShepherdError::Backend("unreachable".to_string())))
        });

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(!renewal.alive.is_cancelled());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(renewal.alive.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_transient_error_gives_up_at_once() {
        let renewal = spawn(CancellationToken::new(), || {
            answer(Err(ShepherdError::Internal("corrupt record".to_string())))
        });

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(renewal.alive.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_store_counts_as_failure() {
        let renewal = spawn(CancellationToken::new(), hang);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(renewal.alive.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_cancellation_propagates() {
        let parent = CancellationToken::new();
        let renewal = spawn(parent.child_token(), || answer(Ok(true)));

        parent.cancel();
        assert!(renewal.alive.is_cancelled());
        renewal.stop().await;
    }
}
