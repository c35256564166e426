pub mod error;
pub mod types;
pub mod value;

pub use error::{CallError, FailureKind, PartitionFailure, ProxyError, RemoteError, Result};
pub use types::Row;
pub use value::{DataType, Value};
