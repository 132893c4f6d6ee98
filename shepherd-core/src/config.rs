use crate::{Result, ShepherdError};
use std::time::Duration;

/// Timing knobs shared by every coordination component.
#[derive(Debug, Clone)]
pub struct CoordinationConfig {
    /// Membership lease TTL. Renewal runs every `node_ttl / 2`.
    pub node_ttl: Duration,
    /// Name of the election lock.
    pub lock_key: String,
    pub lock_ttl: Duration,
    /// Refresh interval while holding the lock; must be below `lock_ttl`.
    pub lock_keepalive: Duration,
    /// How often a candidate retries the lock.
    pub election_poll: Duration,
    /// Back-off between membership join attempts and after task failures.
    pub guard_retry: Duration,
    pub dispatch_interval: Duration,
    pub executor_poll: Duration,
    /// Upper bound for any single backend call.
    pub call_timeout: Duration,
    pub leave_timeout: Duration,
    pub worker_stop_timeout: Duration,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            node_ttl: Duration::from_secs(10),
            lock_key: "master".to_string(),
            lock_ttl: Duration::from_secs(15),
            lock_keepalive: Duration::from_secs(5),
            election_poll: Duration::from_secs(2),
            guard_retry: Duration::from_secs(2),
            dispatch_interval: Duration::from_secs(10),
            executor_poll: Duration::from_secs(5),
            call_timeout: Duration::from_secs(3),
            leave_timeout: Duration::from_secs(2),
            worker_stop_timeout: Duration::from_secs(5),
        }
    }
}

impl CoordinationConfig {
    pub fn renew_interval(&self) -> Duration {
        self.node_ttl / 2
    }

    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("node_ttl", self.node_ttl),
            ("lock_ttl", self.lock_ttl),
            ("lock_keepalive", self.lock_keepalive),
            ("election_poll", self.election_poll),
            ("guard_retry", self.guard_retry),
            ("dispatch_interval", self.dispatch_interval),
            ("executor_poll", self.executor_poll),
            ("call_timeout", self.call_timeout),
            ("leave_timeout", self.leave_timeout),
            ("worker_stop_timeout", self.worker_stop_timeout),
        ];

        for (name, value) in durations {
            if value.is_zero() {
                return Err(ShepherdError::Config(format!("{} must be positive", name)));
            }
        }

        if self.renew_interval().is_zero() {
            return Err(ShepherdError::Config(
                "node_ttl is too small to derive a renewal interval".to_string(),
            ));
        }

        if self.lock_keepalive >= self.lock_ttl {
            return Err(ShepherdError::Config(format!(
                "lock_keepalive ({:?}) must be shorter than lock_ttl ({:?})",
                self.lock_keepalive, self.lock_ttl
            )));
        }

        if self.lock_key.trim().is_empty() {
            return Err(ShepherdError::Config("lock_key cannot be empty".to_string()));
        }

        Ok(())
    }
}
