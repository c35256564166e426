use super::{Credentials, PartitionConfig};
use crate::core::{ProxyError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

/// Where cluster membership comes from.
#[async_trait]
pub trait ClusterConfigSource: Send + Sync {
    /// Current ordered partition list of `cluster`.
    ///
    /// An empty list means the cluster is not configured.
    async fn partitions(&self, cluster: &str) -> Result<Vec<PartitionConfig>>;

    /// Configuration version of `cluster`, if the source tracks one.
    ///
    /// When the version is unchanged since the last load, refresh skips
    /// re-reading the partition list.
    async fn version(&self, _cluster: &str) -> Result<Option<u64>> {
        Ok(None)
    }
}

#[derive(Debug, Clone, Default)]
struct StaticCluster {
    version: u64,
    partitions: Vec<PartitionConfig>,
}

/// In-memory cluster configuration that can be changed at runtime.
///
/// Every `set_cluster` bumps that cluster's version.
#[derive(Debug, Default)]
pub struct StaticClusterSource {
    clusters: RwLock<HashMap<String, StaticCluster>>,
}

impl StaticClusterSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor: `cluster` with one partition per address.
    pub fn with_cluster(cluster: &str, addresses: &[&str]) -> Self {
        let source = Self::new();
        source.set_addresses(cluster, addresses);
        source
    }

    pub fn set_cluster(&self, cluster: &str, partitions: Vec<PartitionConfig>) {
        if let Ok(mut clusters) = self.clusters.write() {
            let entry = clusters.entry(cluster.to_string()).or_default();
            entry.version = entry.version.saturating_add(1);
            entry.partitions = partitions;
        }
    }

    pub fn set_addresses(&self, cluster: &str, addresses: &[&str]) {
        self.set_cluster(
            cluster,
            addresses.iter().map(|a| PartitionConfig::new(*a)).collect(),
        );
    }

    pub fn remove_cluster(&self, cluster: &str) -> bool {
        self.clusters
            .write()
            .map(|mut clusters| clusters.remove(cluster).is_some())
            .unwrap_or(false)
    }
}

#[async_trait]
impl ClusterConfigSource for StaticClusterSource {
    async fn partitions(&self, cluster: &str) -> Result<Vec<PartitionConfig>> {
        let clusters = self.clusters.read()?;
        Ok(clusters
            .get(cluster)
            .map(|c| c.partitions.clone())
            .unwrap_or_default())
    }

    async fn version(&self, cluster: &str) -> Result<Option<u64>> {
        let clusters = self.clusters.read()?;
        Ok(clusters.get(cluster).map(|c| c.version))
    }
}

#[derive(Debug, Deserialize)]
struct ClusterFile {
    #[serde(default)]
    clusters: HashMap<String, ClusterFileEntry>,
}

#[derive(Debug, Deserialize)]
struct ClusterFileEntry {
    #[serde(default)]
    version: Option<u64>,
    partitions: Vec<ClusterFilePartition>,
}

#[derive(Debug, Deserialize)]
struct ClusterFilePartition {
    address: String,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

impl From<ClusterFilePartition> for PartitionConfig {
    fn from(p: ClusterFilePartition) -> Self {
        let credentials = p.user.map(|user| Credentials::new(user, p.password));
        Self {
            address: p.address,
            credentials,
        }
    }
}

/// Cluster configuration read from a JSON file on every load.
///
/// ```text
/// {"clusters": {"userdb": {"version": 3, "partitions": [
///     {"address": "host=10.0.0.1 dbname=userdb_p0", "user": "proxy", "password": "..."},
///     {"address": "host=10.0.0.2 dbname=userdb_p1"}
/// ]}}}
/// ```
#[derive(Debug, Clone)]
pub struct JsonFileClusterSource {
    path: PathBuf,
}

impl JsonFileClusterSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> Result<ClusterFile> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            ProxyError::Config(format!("cannot read {}: {}", self.path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            ProxyError::Config(format!("invalid cluster file {}: {}", self.path.display(), e))
        })
    }
}

#[async_trait]
impl ClusterConfigSource for JsonFileClusterSource {
    async fn partitions(&self, cluster: &str) -> Result<Vec<PartitionConfig>> {
        let mut file = self.load().await?;
        Ok(file
            .clusters
            .remove(cluster)
            .map(|entry| entry.partitions.into_iter().map(Into::into).collect())
            .unwrap_or_default())
    }

    async fn version(&self, cluster: &str) -> Result<Option<u64>> {
        let file = self.load().await?;
        Ok(file.clusters.get(cluster).and_then(|entry| entry.version))
    }
}
