use crate::connection::config::PoolConfig;
use crate::core::{ProxyError, Result};
use serde::Deserialize;
use std::time::Duration;

/// Engine-wide settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub pool: PoolConfig,

    /// Minimum time between two maintenance ticks (cluster refresh and
    /// pool cleanup)
    pub maintenance_interval: Duration,

    /// Number of compiled plans kept
    pub plan_cache_capacity: usize,

    /// Clusters loaded by the one-time initialization
    pub preload_clusters: Vec<String>,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self {
            pool: PoolConfig::default(),
            maintenance_interval: Duration::from_secs(120),
            plan_cache_capacity: 256,
            preload_clusters: Vec::new(),
        }
    }

    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    pub fn plan_cache_capacity(mut self, capacity: usize) -> Self {
        self.plan_cache_capacity = capacity;
        self
    }

    pub fn preload_cluster(mut self, name: impl Into<String>) -> Self {
        self.preload_clusters.push(name.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.pool.validate().map_err(ProxyError::Config)?;
        if self.plan_cache_capacity == 0 {
            return Err(ProxyError::Config(
                "plan_cache_capacity must be > 0".to_string(),
            ));
        }
        if self.preload_clusters.iter().any(|name| name.trim().is_empty()) {
            return Err(ProxyError::Config(
                "preload_clusters must not contain empty names".to_string(),
            ));
        }
        Ok(())
    }

    /// Parses a JSON settings document. Missing keys keep their defaults.
    ///
    /// ```json
    /// {
    ///   "connect_timeout_ms": 2000,
    ///   "query_timeout_ms": 5000,
    ///   "idle_timeout_secs": 300,
    ///   "maintenance_interval_secs": 120,
    ///   "preload_clusters": ["userdb"]
    /// }
    /// ```
    pub fn from_json(input: &str) -> Result<Self> {
        let file: EngineConfigFile = serde_json::from_str(input)
            .map_err(|e| ProxyError::Config(format!("invalid engine config: {}", e)))?;
        let config = file.into_config();
        config.validate()?;
        Ok(config)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct EngineConfigFile {
    connect_timeout_ms: Option<u64>,
    acquire_timeout_ms: Option<u64>,
    query_timeout_ms: Option<u64>,
    /// 0 disables the idle timeout
    idle_timeout_secs: Option<u64>,
    max_lifetime_secs: Option<u64>,
    maintenance_interval_secs: Option<u64>,
    plan_cache_capacity: Option<usize>,
    preload_clusters: Vec<String>,
}

impl EngineConfigFile {
    fn into_config(self) -> EngineConfig {
        let mut pool = PoolConfig::default();
        if let Some(ms) = self.connect_timeout_ms {
            pool = pool.connect_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.acquire_timeout_ms {
            pool = pool.acquire_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.query_timeout_ms {
            pool = pool.query_timeout(Duration::from_millis(ms));
        }
        match self.idle_timeout_secs {
            Some(0) => pool = pool.no_idle_timeout(),
            Some(secs) => pool = pool.idle_timeout(Duration::from_secs(secs)),
            None => {}
        }
        if let Some(secs) = self.max_lifetime_secs {
            pool = pool.max_lifetime(Duration::from_secs(secs));
        }

        let mut config = EngineConfig::new().pool(pool);
        if let Some(secs) = self.maintenance_interval_secs {
            config = config.maintenance_interval(Duration::from_secs(secs));
        }
        if let Some(capacity) = self.plan_cache_capacity {
            config = config.plan_cache_capacity(capacity);
        }
        config.preload_clusters = self.preload_clusters;
        config
    }
}
