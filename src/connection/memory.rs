use super::{Connector, PartitionConnection};
use crate::cluster::PartitionTarget;
use crate::core::RemoteError;
use crate::executor::BoundQuery;
use crate::result::QueryResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Handler = Arc<dyn Fn(&BoundQuery) -> Result<QueryResult, RemoteError> + Send + Sync>;

/// A scripted partition reachable at one address.
#[derive(Clone)]
struct MemoryPartition {
    handler: Handler,
    reachable: bool,
    latency: Option<Duration>,
    connects: usize,
    queries: usize,
}

/// An in-process `Connector` for tests and demos.
///
/// Each address answers queries through a handler closure. Marking an
/// address unreachable makes new connects fail and breaks open connections
/// on their next query.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    partitions: Arc<Mutex<HashMap<String, MemoryPartition>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the partition answering at `address`.
    pub fn add_partition<F>(&self, address: impl Into<String>, handler: F)
    where
        F: Fn(&BoundQuery) -> Result<QueryResult, RemoteError> + Send + Sync + 'static,
    {
        if let Ok(mut partitions) = self.partitions.lock() {
            partitions.insert(
                address.into(),
                MemoryPartition {
                    handler: Arc::new(handler),
                    reachable: true,
                    latency: None,
                    connects: 0,
                    queries: 0,
                },
            );
        }
    }

    pub fn set_reachable(&self, address: &str, reachable: bool) {
        self.update(address, |partition| partition.reachable = reachable);
    }

    /// Delay applied to every query on `address`.
    pub fn set_latency(&self, address: &str, latency: Duration) {
        self.update(address, |partition| partition.latency = Some(latency));
    }

    pub fn connect_count(&self, address: &str) -> usize {
        self.read(address, |partition| partition.connects)
    }

    pub fn query_count(&self, address: &str) -> usize {
        self.read(address, |partition| partition.queries)
    }

    fn update(&self, address: &str, apply: impl FnOnce(&mut MemoryPartition)) {
        if let Ok(mut partitions) = self.partitions.lock() {
            if let Some(partition) = partitions.get_mut(address) {
                apply(partition);
            }
        }
    }

    fn read(&self, address: &str, read: impl FnOnce(&MemoryPartition) -> usize) -> usize {
        self.partitions
            .lock()
            .ok()
            .and_then(|partitions| partitions.get(address).map(read))
            .unwrap_or(0)
    }

    fn unreachable(address: &str) -> RemoteError {
        RemoteError::Connection(format!("could not connect to server at '{}'", address))
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        target: &PartitionTarget,
    ) -> Result<Box<dyn PartitionConnection>, RemoteError> {
        let mut partitions = self
            .partitions
            .lock()
            .map_err(|e| RemoteError::Connection(e.to_string()))?;
        let partition = partitions
            .get_mut(&target.address)
            .filter(|partition| partition.reachable)
            .ok_or_else(|| Self::unreachable(&target.address))?;
        partition.connects += 1;

        Ok(Box::new(MemoryConnection {
            address: target.address.clone(),
            partitions: Arc::clone(&self.partitions),
            closed: false,
        }))
    }
}

struct MemoryConnection {
    address: String,
    partitions: Arc<Mutex<HashMap<String, MemoryPartition>>>,
    closed: bool,
}

#[async_trait]
impl PartitionConnection for MemoryConnection {
    async fn query(&mut self, query: &BoundQuery) -> Result<QueryResult, RemoteError> {
        let (handler, latency) = {
            let mut partitions = self
                .partitions
                .lock()
                .map_err(|e| RemoteError::Connection(e.to_string()))?;
            match partitions.get_mut(&self.address) {
                Some(partition) if partition.reachable => {
                    partition.queries += 1;
                    (Arc::clone(&partition.handler), partition.latency)
                }
                _ => {
                    self.closed = true;
                    return Err(RemoteError::Connection(
                        "server closed the connection unexpectedly".to_string(),
                    ));
                }
            }
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        handler(query)
    }

    fn is_healthy(&self) -> bool {
        !self.closed
    }
}
