// ============================================================================
// shardproxy Library
// ============================================================================

pub mod cluster;
pub mod connection;
pub mod core;
pub mod directive;
pub mod executor;
pub mod facade;
pub mod result;
pub mod routing;

// Re-export main types for convenience
pub use core::{CallError, DataType, ProxyError, Result, Row, Value};
pub use directive::{FunctionDef, PlanCache, RoutingDirective, TargetMode};
pub use facade::{CallOutput, EngineConfig, ProxyEngine};
pub use result::{QueryResult, ResultSet};

// Re-export cluster and connection API
pub use cluster::{
    ClusterConfigSource, ClusterRegistry, ClusterSpec, Credentials, JsonFileClusterSource,
    PartitionConfig, PartitionTarget, StaticClusterSource,
};
pub use connection::{
    ConnectionState, Connector, PartitionConnection,
    config::PoolConfig,
    memory::MemoryConnector,
    pool::{ConnectionPool, PoolGuard, PoolStats},
    postgres::PgConnector,
};
