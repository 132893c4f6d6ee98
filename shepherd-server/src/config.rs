use serde::{Deserialize, Serialize};
use shepherd_core::{CoordinationConfig, Result, ShepherdError, StoreBuilder};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub coordination: CoordinationSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Fixed node id. A fresh ULID is generated per process when unset.
    #[serde(default)]
    pub node_id: Option<String>,
    /// Address advertised in the membership record.
    #[serde(default)]
    pub address: Option<String>,
}

/// Store backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    #[serde(default)]
    pub namespace: Option<String>,
    pub etcd: Option<EtcdConfig>,
    pub redis: Option<RedisConfig>,
}

impl StoreConfig {
    pub fn namespace_or_default(&self) -> &str {
        self.namespace
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or("default")
    }

    pub fn builder(&self) -> Result<StoreBuilder> {
        let builder = StoreBuilder::new()
            .backend(self.backend.as_str())
            .namespace(self.namespace_or_default());

        match self.backend {
            StoreBackend::Etcd => {
                let etcd = self.etcd.as_ref().ok_or_else(|| {
                    ShepherdError::Config(
                        "etcd configuration is required for etcd backend".to_string(),
                    )
                })?;
                Ok(builder.etcd_endpoints(etcd.endpoints.clone()))
            }
            StoreBackend::Redis => {
                let redis = self.redis.as_ref().ok_or_else(|| {
                    ShepherdError::Config(
                        "redis configuration is required for redis backend".to_string(),
                    )
                })?;
                Ok(builder.redis_url(redis.url.clone()))
            }
            StoreBackend::Memory => Ok(builder),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Etcd,
    Redis,
    Memory,
}

impl StoreBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreBackend::Etcd => "etcd",
            StoreBackend::Redis => "redis",
            StoreBackend::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

/// Coordination timings in milliseconds. Missing fields take the library
/// defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationSettings {
    pub node_ttl_ms: u64,
    pub lock_key: String,
    pub lock_ttl_ms: u64,
    pub lock_keepalive_ms: u64,
    pub election_poll_ms: u64,
    pub guard_retry_ms: u64,
    pub dispatch_interval_ms: u64,
    pub executor_poll_ms: u64,
    pub call_timeout_ms: u64,
    pub leave_timeout_ms: u64,
    pub worker_stop_timeout_ms: u64,
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

impl Default for CoordinationSettings {
    fn default() -> Self {
        let defaults = CoordinationConfig::default();
        Self {
            node_ttl_ms: millis(defaults.node_ttl),
            lock_key: defaults.lock_key,
            lock_ttl_ms: millis(defaults.lock_ttl),
            lock_keepalive_ms: millis(defaults.lock_keepalive),
            election_poll_ms: millis(defaults.election_poll),
            guard_retry_ms: millis(defaults.guard_retry),
            dispatch_interval_ms: millis(defaults.dispatch_interval),
            executor_poll_ms: millis(defaults.executor_poll),
            call_timeout_ms: millis(defaults.call_timeout),
            leave_timeout_ms: millis(defaults.leave_timeout),
            worker_stop_timeout_ms: millis(defaults.worker_stop_timeout),
        }
    }
}

impl CoordinationSettings {
    pub fn to_config(&self) -> Result<CoordinationConfig> {
        let config = CoordinationConfig {
            node_ttl: Duration::from_millis(self.node_ttl_ms),
            lock_key: self.lock_key.clone(),
            lock_ttl: Duration::from_millis(self.lock_ttl_ms),
            lock_keepalive: Duration::from_millis(self.lock_keepalive_ms),
            election_poll: Duration::from_millis(self.election_poll_ms),
            guard_retry: Duration::from_millis(self.guard_retry_ms),
            dispatch_interval: Duration::from_millis(self.dispatch_interval_ms),
            executor_poll: Duration::from_millis(self.executor_poll_ms),
            call_timeout: Duration::from_millis(self.call_timeout_ms),
            leave_timeout: Duration::from_millis(self.leave_timeout_ms),
            worker_stop_timeout: Duration::from_millis(self.worker_stop_timeout_ms),
        };
        config.validate()?;
        Ok(config)
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        Self::load(::config::File::with_name(path))
    }

    fn load<S>(source: S) -> Result<Self>
    where
        S: ::config::Source + Send + Sync + 'static,
    {
        let settings = ::config::Config::builder()
            .add_source(source)
            .add_source(::config::Environment::with_prefix("SHEPHERD").separator("__"))
            .build()
            .map_err(|e| ShepherdError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| ShepherdError::Config(e.to_string()))?;

        Ok(config)
    }
}
