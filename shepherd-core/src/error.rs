use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShepherdError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Backend call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Consumer not found: {0}")]
    ConsumerNotFound(String),

    #[error("Task panicked: {0}")]
    TaskPanicked(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ShepherdError {
    /// Errors worth retrying on the caller's normal interval.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ShepherdError::Backend(_)
                | ShepherdError::Etcd(_)
                | ShepherdError::Redis(_)
                | ShepherdError::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ShepherdError>;

/// Bounds a backend call so a stuck store cannot pin a loop forever.
pub(crate) async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ShepherdError::Timeout(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ShepherdError::Backend("down".to_string()).is_transient());
        assert!(ShepherdError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!ShepherdError::Config("bad".to_string()).is_transient());
        assert!(!ShepherdError::ConsumerNotFound("c1".to_string()).is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_expires() {
        let result: Result<()> = with_timeout(Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(ShepherdError::Timeout(_))));
    }
}
