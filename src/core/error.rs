use std::fmt;
use thiserror::Error;

/// How a single partition failed during fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The partition could not be reached, or the connection died mid-query.
    Connection,
    /// The partition answered with an error for the query itself.
    Query,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => write!(f, "connection"),
            Self::Query => write!(f, "query"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionFailure {
    pub partition: usize,
    pub kind: FailureKind,
    pub message: String,
}

impl PartitionFailure {
    pub fn new(partition: usize, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            partition,
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for PartitionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "partition {} ({}): {}", self.partition, self.kind, self.message)
    }
}

#[derive(Error, Debug, Clone)]
pub enum ProxyError {
    #[error("Directive syntax error: {0}")]
    DirectiveSyntax(String),

    #[error("Unknown cluster '{name}': {reason}")]
    UnknownCluster { name: String, reason: String },

    #[error("Argument index {index} is out of range for {count} argument(s)")]
    ArgumentOutOfRange { index: usize, count: usize },

    #[error("Argument binding error: {0}")]
    ArgumentBinding(String),

    #[error("Partition {partition} connection error: {message}")]
    PartitionConnection { partition: usize, message: String },

    #[error("Remote execution failed on {}", join_failures(.0))]
    PartitionExecution(Vec<PartitionFailure>),

    #[error("Refresh of cluster '{cluster}' failed: {reason}")]
    RegistryRefresh { cluster: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

fn join_failures(failures: &[PartitionFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl ProxyError {
    /// Partition indices named by a partition-level failure, empty otherwise.
    pub fn failed_partitions(&self) -> Vec<usize> {
        match self {
            Self::PartitionConnection { partition, .. } => vec![*partition],
            Self::PartitionExecution(failures) => failures.iter().map(|f| f.partition).collect(),
            _ => Vec::new(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

impl<T> From<std::sync::PoisonError<T>> for ProxyError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

/// Error returned by a downstream partition connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("{0}")]
    Query(String),
}

impl RemoteError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Connection(_) => FailureKind::Connection,
            Self::Query(_) => FailureKind::Query,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Connection(msg) | Self::Query(msg) => msg,
        }
    }

    pub fn into_failure(self, partition: usize) -> PartitionFailure {
        PartitionFailure::new(partition, self.kind(), self.message().to_string())
    }
}

/// A failure as surfaced to the host: always names the proxied function.
#[derive(Error, Debug, Clone)]
#[error("proxy function {function}({arity}): {source}")]
pub struct CallError {
    pub function: String,
    pub arity: usize,
    pub source: ProxyError,
}

impl CallError {
    pub fn new(function: impl Into<String>, arity: usize, source: ProxyError) -> Self {
        Self {
            function: function.into(),
            arity,
            source,
        }
    }

    pub fn kind(&self) -> &ProxyError {
        &self.source
    }
}
