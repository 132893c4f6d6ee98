use super::{EtcdStore, LeaseStore, MemoryStore, RedisStore};
use crate::{Result, ShepherdError};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct StoreBuilder {
    backend: Option<String>,
    namespace: Option<String>,
    etcd_endpoints: Option<Vec<String>>,
    redis_url: Option<String>,
}

impl StoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn etcd_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.etcd_endpoints = Some(endpoints);
        self
    }

    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    fn resolve_namespace(&self) -> Result<String> {
        let namespace = self
            .namespace
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_string();
        if namespace.is_empty() {
            return Err(ShepherdError::Config(
                "store namespace cannot be empty".to_string(),
            ));
        }
        if namespace.contains(['/', ':']) {
            return Err(ShepherdError::Config(format!(
                "store namespace '{}' cannot contain '/' or ':'",
                namespace
            )));
        }

        Ok(namespace)
    }

    fn resolve_backend(&self) -> Result<String> {
        let backend = self
            .backend
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        if backend.is_empty() {
            return Err(ShepherdError::Config(
                "store backend cannot be empty".to_string(),
            ));
        }

        Ok(backend)
    }

    pub async fn build(&self) -> Result<Arc<dyn LeaseStore>> {
        let namespace = self.resolve_namespace()?;
        let backend = self.resolve_backend()?;

        match backend.as_str() {
            "etcd" => {
                let endpoints: Vec<String> = self
                    .etcd_endpoints
                    .clone()
                    .ok_or_else(|| {
                        ShepherdError::Config(
                            "etcd endpoints are required for etcd backend".to_string(),
                        )
                    })?
                    .into_iter()
                    .map(|endpoint| endpoint.trim().to_string())
                    .filter(|endpoint| !endpoint.is_empty())
                    .collect();

                if endpoints.is_empty() {
                    return Err(ShepherdError::Config(
                        "etcd endpoints cannot be empty for etcd backend".to_string(),
                    ));
                }

                let store = EtcdStore::new(&endpoints, &namespace).await?;
                Ok(Arc::new(store))
            }
            "redis" => {
                let url = self.redis_url.as_deref().unwrap_or_default().trim();
                if url.is_empty() {
                    return Err(ShepherdError::Config(
                        "redis url is required for redis backend".to_string(),
                    ));
                }

                let store = RedisStore::new(url, &namespace).await?;
                Ok(Arc::new(store))
            }
            "memory" => {
                tracing::warn!(
                    "Using in-process memory store; membership is not shared across processes"
                );
                Ok(Arc::new(MemoryStore::new()))
            }
            other => Err(ShepherdError::Config(format!(
                "unsupported store backend: {}",
                other
            ))),
        }
    }
}
