pub mod hash;
pub mod resolver;

pub use hash::{fnv1a, partition_for, stable_hash};
pub use resolver::PartitionResolver;
