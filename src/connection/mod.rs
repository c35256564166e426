pub mod config;
pub mod memory;
pub mod pool;
pub mod postgres;

use crate::cluster::PartitionTarget;
use crate::core::RemoteError;
use crate::executor::BoundQuery;
use crate::result::QueryResult;
use async_trait::async_trait;

/// Lifecycle of the pooled connection of one (cluster, partition).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Ready,
    /// Failed during use; discarded and re-established on the next call.
    Broken,
}

/// An established session with one partition database.
#[async_trait]
pub trait PartitionConnection: Send {
    /// Runs `query` with positional parameters and returns all rows.
    async fn query(&mut self, query: &BoundQuery) -> Result<QueryResult, RemoteError>;

    /// False once the transport is known to be dead.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// Opens partition connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        target: &PartitionTarget,
    ) -> Result<Box<dyn PartitionConnection>, RemoteError>;
}
