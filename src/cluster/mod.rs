pub mod registry;
pub mod source;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

pub use registry::{ClusterRegistry, RefreshReport};
pub use source::{ClusterConfigSource, JsonFileClusterSource, StaticClusterSource};

/// Login used for one partition.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: Option<String>) -> Self {
        Self {
            user: user.into(),
            password,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Partition entry as delivered by a configuration source, in index order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionConfig {
    /// Connection string understood by the connector.
    pub address: String,
    pub credentials: Option<Credentials>,
}

impl PartitionConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }
}

/// Connection descriptor of one partition within one cluster generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTarget {
    pub index: usize,
    pub address: String,
    pub credentials: Option<Credentials>,
}

impl fmt::Display for PartitionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.index, self.address)
    }
}

/// Immutable snapshot of a cluster's partition list.
///
/// Partition indices are dense (`0..N`) by construction.
#[derive(Debug, Clone)]
pub struct ClusterSpec {
    name: String,
    generation: u64,
    source_version: Option<u64>,
    partitions: Vec<PartitionTarget>,
    loaded_at: Instant,
}

impl ClusterSpec {
    pub fn new(
        name: impl Into<String>,
        generation: u64,
        source_version: Option<u64>,
        partitions: Vec<PartitionConfig>,
    ) -> Self {
        let partitions = partitions
            .into_iter()
            .enumerate()
            .map(|(index, p)| PartitionTarget {
                index,
                address: p.address,
                credentials: p.credentials,
            })
            .collect();
        Self {
            name: name.into(),
            generation,
            source_version,
            partitions,
            loaded_at: Instant::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn source_version(&self) -> Option<u64> {
        self.source_version
    }

    pub fn partitions(&self) -> &[PartitionTarget] {
        &self.partitions
    }

    pub fn partition(&self, index: usize) -> Option<&PartitionTarget> {
        self.partitions.get(index)
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn loaded_at(&self) -> Instant {
        self.loaded_at
    }
}
