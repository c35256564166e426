use super::hash::partition_for;
use crate::cluster::{ClusterSpec, PartitionTarget};
use crate::core::{ProxyError, Result, Value};
use crate::directive::{RoutingDirective, TargetMode};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Picks the partitions one call must reach.
///
/// Selection works on a single `ClusterSpec` snapshot, so a concurrent
/// refresh never changes the partition count halfway through a call.
#[derive(Debug, Default)]
pub struct PartitionResolver {
    any_counter: AtomicUsize,
}

impl PartitionResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the selected partitions in the order their rows are merged.
    pub fn select(
        &self,
        directive: &RoutingDirective,
        args: &[Value],
        spec: &ClusterSpec,
    ) -> Result<Vec<PartitionTarget>> {
        let count = spec.partition_count();
        if count == 0 {
            return Err(ProxyError::UnknownCluster {
                name: spec.name().to_string(),
                reason: "cluster has no partitions".to_string(),
            });
        }

        let index = match directive.target {
            TargetMode::All => return Ok(spec.partitions().to_vec()),
            TargetMode::Any => self.any_counter.fetch_add(1, Ordering::Relaxed) % count,
            TargetMode::Hash(arg) => {
                let value = args.get(arg).ok_or(ProxyError::ArgumentOutOfRange {
                    index: arg,
                    count: args.len(),
                })?;
                if value.is_null() {
                    return Err(ProxyError::ArgumentBinding(format!(
                        "routing argument ${} is NULL",
                        arg + 1
                    )));
                }
                partition_for(value, count)
            }
        };

        spec.partition(index)
            .cloned()
            .map(|target| vec![target])
            .ok_or(ProxyError::ArgumentOutOfRange { index, count })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::PartitionConfig;
    use crate::core::DataType;
    use crate::directive::{FunctionDef, compile};
    use std::collections::HashSet;

    fn spec(n: usize) -> ClusterSpec {
        let partitions = (0..n).map(|i| PartitionConfig::new(format!("p{}", i))).collect();
        ClusterSpec::new("demo", 1, None, partitions)
    }

    fn plan(run_on: &str) -> RoutingDirective {
        let def = FunctionDef::new("f", format!("CLUSTER 'demo'; RUN ON {};", run_on))
            .arg("x", DataType::Integer);
        compile(&def).unwrap()
    }

    fn indices(targets: &[PartitionTarget]) -> Vec<usize> {
        targets.iter().map(|t| t.index).collect()
    }

    #[test]
    fn test_all_in_index_order() {
        let resolver = PartitionResolver::new();
        let targets = resolver.select(&plan("ALL"), &[Value::Integer(1)], &spec(3)).unwrap();
        assert_eq!(indices(&targets), vec![0, 1, 2]);
    }

    #[test]
    fn test_any_rotates() {
        let resolver = PartitionResolver::new();
        let plan = plan("ANY");
        let spec = spec(3);
        let seen: HashSet<usize> = (0..3)
            .map(|_| {
                let targets = resolver.select(&plan, &[Value::Integer(1)], &spec).unwrap();
                assert_eq!(targets.len(), 1);
                targets[0].index
            })
            .collect();
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_hash_is_stable() {
        let resolver = PartitionResolver::new();
        let plan = plan("hash(x)");
        let spec = spec(4);
        let first = resolver.select(&plan, &[Value::Integer(5)], &spec).unwrap();
        for _ in 0..10 {
            let again = resolver.select(&plan, &[Value::Integer(5)], &spec).unwrap();
            assert_eq!(indices(&first), indices(&again));
        }
        assert_eq!(first[0].index, partition_for(&Value::Integer(5), 4));
    }

    #[test]
    fn test_hash_argument_errors() {
        let resolver = PartitionResolver::new();
        let plan = plan("hash(x)");
        assert!(matches!(
            resolver.select(&plan, &[], &spec(2)),
            Err(ProxyError::ArgumentOutOfRange { index: 0, count: 0 })
        ));
        assert!(matches!(
            resolver.select(&plan, &[Value::Null], &spec(2)),
            Err(ProxyError::ArgumentBinding(_))
        ));
    }

    #[test]
    fn test_empty_cluster() {
        let resolver = PartitionResolver::new();
        let err = resolver.select(&plan("ALL"), &[Value::Integer(1)], &spec(0)).unwrap_err();
        assert!(matches!(err, ProxyError::UnknownCluster { .. }));
    }
}
