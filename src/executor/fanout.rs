use super::BoundQuery;
use crate::cluster::PartitionTarget;
use crate::connection::pool::{ConnectionPool, PoolGuard};
use crate::core::{FailureKind, PartitionFailure, ProxyError, RemoteError, Result};
use crate::directive::RoutingDirective;
use crate::result::QueryResult;
use futures::future::join_all;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{Level, event};

/// Outcome of one partition's query.
#[derive(Debug)]
pub struct PartitionResult {
    pub partition: usize,
    pub outcome: std::result::Result<QueryResult, PartitionFailure>,
}

impl PartitionResult {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// A fully successful fan-out: per-partition rows in selection order plus
/// the pooled connections the call still owns.
pub struct ExecutedCall {
    pub results: Vec<(usize, QueryResult)>,
    pub guards: Vec<PoolGuard>,
}

/// Dispatches one bound query to every selected partition at once.
pub struct FanoutExecutor {
    pool: Arc<ConnectionPool>,
}

impl FanoutExecutor {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Runs `query` on `targets` and waits for every partition.
    ///
    /// Any failure fails the whole call and no rows are returned.
    pub async fn execute(
        &self,
        cluster: &str,
        directive: &RoutingDirective,
        targets: &[PartitionTarget],
        query: &BoundQuery,
    ) -> Result<ExecutedCall> {
        let mut guards = self.acquire_all(cluster, targets).await?;

        let outcomes = join_all(guards.iter_mut().map(|guard| guard.execute(query))).await;
        let results: Vec<PartitionResult> = targets
            .iter()
            .zip(outcomes)
            .map(|(target, outcome)| PartitionResult {
                partition: target.index,
                outcome: outcome
                    .map_err(|err| err.into_failure(target.index))
                    .and_then(|result| check_shape(directive, target.index, result)),
            })
            .collect();

        let failed = results.iter().filter(|r| !r.is_ok()).count();
        event!(
            Level::DEBUG,
            cluster = %cluster,
            partitions = targets.len(),
            failed,
            "fan-out finished"
        );

        if failed > 0 {
            let failures: Vec<PartitionFailure> = results
                .into_iter()
                .filter_map(|r| r.outcome.err())
                .collect();
            return Err(Self::call_failure(targets.len(), failures));
        }

        let results = results
            .into_iter()
            .filter_map(|r| r.outcome.ok().map(|rows| (r.partition, rows)))
            .collect();
        Ok(ExecutedCall { results, guards })
    }

    /// Locks every target slot and returns the guards in `targets` order.
    ///
    /// Slots are try-locked lowest partition index first. On contention
    /// everything taken so far is handed back and the call waits on the busy
    /// slot alone, so a waiting call never pins partitions it is not yet
    /// able to use.
    async fn acquire_all(&self, cluster: &str, targets: &[PartitionTarget]) -> Result<Vec<PoolGuard>> {
        let deadline = Instant::now() + self.pool.config().acquire_timeout;
        let mut order: Vec<usize> = (0..targets.len()).collect();
        order.sort_by_key(|&pos| targets[pos].index);

        let mut contended: Option<usize> = None;
        loop {
            let mut acquired: Vec<Option<PoolGuard>> = (0..targets.len()).map(|_| None).collect();
            if let Some(pos) = contended {
                let wait = deadline.saturating_duration_since(Instant::now());
                let guard = self
                    .pool
                    .acquire_within(cluster, &targets[pos], wait)
                    .await
                    .map_err(|err| Self::acquire_failure(targets.len(), err))?;
                acquired[pos] = Some(guard);
            }

            contended = None;
            for &pos in &order {
                if acquired[pos].is_some() {
                    continue;
                }
                match self.pool.try_acquire(cluster, &targets[pos])? {
                    Some(guard) => acquired[pos] = Some(guard),
                    None => {
                        contended = Some(pos);
                        break;
                    }
                }
            }

            if contended.is_none() {
                return Ok(acquired.into_iter().flatten().collect());
            }
        }
    }

    fn acquire_failure(selected: usize, err: ProxyError) -> ProxyError {
        match err {
            ProxyError::PartitionConnection { partition, message } if selected > 1 => {
                ProxyError::PartitionExecution(vec![PartitionFailure::new(
                    partition,
                    FailureKind::Connection,
                    message,
                )])
            }
            other => other,
        }
    }

    fn call_failure(selected: usize, mut failures: Vec<PartitionFailure>) -> ProxyError {
        if selected == 1 && failures.len() == 1 && failures[0].kind == FailureKind::Connection {
            let failure = failures.remove(0);
            return ProxyError::PartitionConnection {
                partition: failure.partition,
                message: failure.message,
            };
        }
        ProxyError::PartitionExecution(failures)
    }
}

fn check_shape(
    directive: &RoutingDirective,
    partition: usize,
    result: QueryResult,
) -> std::result::Result<QueryResult, PartitionFailure> {
    let Some(expected) = directive.result_columns else {
        return Ok(result);
    };

    let header_mismatch = !result.columns.is_empty() && result.columns.len() != expected;
    let row_mismatch = result.rows.iter().find(|row| row.len() != expected);
    if header_mismatch || row_mismatch.is_some() {
        let got = row_mismatch.map(|row| row.len()).unwrap_or(result.columns.len());
        return Err(RemoteError::Query(format!(
            "query returned {} column(s), {} expected",
            got, expected
        ))
        .into_failure(partition));
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterSpec, PartitionConfig};
    use crate::connection::config::PoolConfig;
    use crate::connection::memory::MemoryConnector;
    use crate::core::{DataType, Value};
    use crate::directive::{FunctionDef, compile};
    use crate::executor::bind_query;
    use std::time::Duration;

    fn setup(n: usize) -> (Arc<MemoryConnector>, FanoutExecutor, ClusterSpec) {
        let connector = Arc::new(MemoryConnector::new());
        for i in 0..n {
            connector.add_partition(format!("p{}", i), move |_query| {
                Ok(QueryResult::single("n", Value::Integer(i as i64)))
            });
        }
        let pool = ConnectionPool::new(connector.clone(), PoolConfig::default()).unwrap();
        let partitions = (0..n).map(|i| PartitionConfig::new(format!("p{}", i))).collect();
        (
            connector,
            FanoutExecutor::new(Arc::new(pool)),
            ClusterSpec::new("demo", 1, None, partitions),
        )
    }

    fn plan(body: &str) -> RoutingDirective {
        compile(&FunctionDef::new("g", body).arg("x", DataType::Integer)).unwrap()
    }

    #[tokio::test]
    async fn test_all_partitions_in_order() {
        let (_connector, executor, spec) = setup(3);
        let plan = plan("CLUSTER 'demo'; RUN ON ALL; SELECT $1;");
        let query = bind_query(&plan, &[Value::Integer(1)]).unwrap();

        let executed = executor
            .execute("demo", &plan, spec.partitions(), &query)
            .await
            .unwrap();
        let partitions: Vec<usize> = executed.results.iter().map(|(p, _)| *p).collect();
        assert_eq!(partitions, vec![0, 1, 2]);
        assert_eq!(executed.guards.len(), 3);
        assert_eq!(executor.pool().stats().in_use, 3);
        drop(executed);
        assert_eq!(executor.pool().stats().in_use, 0);
    }

    #[tokio::test]
    async fn test_one_failure_fails_all() {
        let (connector, executor, spec) = setup(3);
        connector.set_reachable("p1", false);
        let plan = plan("CLUSTER 'demo'; RUN ON ALL; SELECT $1;");
        let query = bind_query(&plan, &[Value::Integer(1)]).unwrap();

        let err = executor
            .execute("demo", &plan, spec.partitions(), &query)
            .await
            .err()
            .unwrap();
        assert_eq!(err.failed_partitions(), vec![1]);
        assert_eq!(executor.pool().stats().in_use, 0);
        // the healthy partitions were still queried
        assert_eq!(connector.query_count("p0"), 1);
        assert_eq!(connector.query_count("p2"), 1);
    }

    #[tokio::test]
    async fn test_single_partition_connection_failure() {
        let (connector, executor, spec) = setup(2);
        connector.set_reachable("p0", false);
        let plan = plan("CLUSTER 'demo'; RUN ON ANY; SELECT $1;");
        let query = bind_query(&plan, &[Value::Integer(1)]).unwrap();

        let err = executor
            .execute("demo", &plan, &spec.partitions()[..1], &query)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ProxyError::PartitionConnection { partition: 0, .. }));
    }

    #[tokio::test]
    async fn test_waiting_call_does_not_pin_free_partitions() {
        let connector = Arc::new(MemoryConnector::new());
        for i in 0..2 {
            connector.add_partition(format!("p{}", i), move |_query| {
                Ok(QueryResult::single("n", Value::Integer(i as i64)))
            });
        }
        let config = PoolConfig::new().acquire_timeout(Duration::from_secs(5));
        let pool = Arc::new(ConnectionPool::new(connector, config).unwrap());
        let executor = Arc::new(FanoutExecutor::new(Arc::clone(&pool)));
        let partitions: Vec<PartitionConfig> =
            (0..2).map(|i| PartitionConfig::new(format!("p{}", i))).collect();
        let spec = ClusterSpec::new("demo", 1, None, partitions);
        let targets = spec.partitions().to_vec();

        let busy = pool.acquire("demo", &targets[1]).await.unwrap();

        let all = {
            let executor = Arc::clone(&executor);
            let targets = targets.clone();
            tokio::spawn(async move {
                let plan = plan("CLUSTER 'demo'; RUN ON ALL; SELECT $1;");
                let query = bind_query(&plan, &[Value::Integer(1)]).unwrap();
                executor
                    .execute("demo", &plan, &targets, &query)
                    .await
                    .map(|executed| executed.results.len())
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // partition 0 stays available while the ALL call waits on partition 1
        let free = pool
            .acquire_within("demo", &targets[0], Duration::from_millis(50))
            .await
            .unwrap();
        drop(free);
        drop(busy);

        assert_eq!(all.await.unwrap().unwrap(), 2);
        assert_eq!(pool.stats().in_use, 0);
    }

    #[tokio::test]
    async fn test_try_acquire_reports_contention() {
        let (_connector, executor, spec) = setup(1);
        let target = &spec.partitions()[0];
        let held = executor.pool().try_acquire("demo", target).unwrap();
        assert!(held.is_some());
        assert!(executor.pool().try_acquire("demo", target).unwrap().is_none());
        drop(held);
        assert!(executor.pool().try_acquire("demo", target).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_result_column_check() {
        let (_connector, executor, spec) = setup(2);
        let def = FunctionDef::new("g", "CLUSTER 'demo'; RUN ON ALL; SELECT 1;").result_columns(2);
        let plan = compile(&def).unwrap();
        let query = bind_query(&plan, &[]).unwrap();

        let err = executor
            .execute("demo", &plan, spec.partitions(), &query)
            .await
            .err()
            .unwrap();
        match err {
            ProxyError::PartitionExecution(failures) => {
                assert_eq!(failures.len(), 2);
                assert!(failures.iter().all(|f| f.kind == FailureKind::Query));
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
