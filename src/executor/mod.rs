pub mod bind;
pub mod fanout;

pub use bind::{BoundParam, BoundQuery, bind_arguments, bind_query};
pub use fanout::{ExecutedCall, FanoutExecutor, PartitionResult};
