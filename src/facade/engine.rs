use super::config::EngineConfig;
use crate::cluster::{ClusterConfigSource, ClusterRegistry, RefreshReport};
use crate::connection::Connector;
use crate::connection::pool::{ConnectionPool, PoolStats};
use crate::core::{CallError, Result, Row, Value};
use crate::directive::{FunctionDef, PlanCache};
use crate::executor::{FanoutExecutor, bind_arguments, bind_query};
use crate::result::ResultSet;
use crate::routing::PartitionResolver;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::OnceCell;
use tracing::{Instrument, info_span};
use uuid::Uuid;

/// What one invocation hands back to the host.
#[derive(Debug)]
pub enum CallOutput {
    /// Single-valued call: the first merged row, if any.
    Value(Option<Row>),
    /// Set-returning call: the merge cursor.
    Set(ResultSet),
}

/// What one maintenance tick did.
#[derive(Debug, Default)]
pub struct MaintenanceReport {
    pub refresh: RefreshReport,
    pub closed_connections: usize,
}

/// Entry point for proxied calls.
///
/// Owns the plan cache, the cluster registry and the connection pool for
/// its whole lifetime; nothing is process-global.
///
/// ```
/// use shardproxy::{
///     EngineConfig, FunctionDef, MemoryConnector, ProxyEngine, QueryResult,
///     StaticClusterSource, Value,
/// };
/// use std::sync::Arc;
///
/// # tokio_test::block_on(async {
/// let source = Arc::new(StaticClusterSource::with_cluster("demo", &["p0", "p1"]));
/// let connector = Arc::new(MemoryConnector::new());
/// for address in ["p0", "p1"] {
///     connector.add_partition(address, move |_query| {
///         Ok(QueryResult::single("node", Value::Text(address.to_string())))
///     });
/// }
///
/// let engine = ProxyEngine::new(EngineConfig::default(), source, connector).unwrap();
/// let func = FunctionDef::new("nodes", "CLUSTER 'demo'; RUN ON ALL; SELECT node();")
///     .returns_set(true);
///
/// let rows: Vec<_> = engine.call_set(&func, vec![]).await.unwrap().collect();
/// assert_eq!(rows.len(), 2);
/// # });
/// ```
pub struct ProxyEngine {
    config: EngineConfig,
    plans: PlanCache,
    registry: ClusterRegistry,
    resolver: PartitionResolver,
    executor: FanoutExecutor,
    initialized: OnceCell<()>,
}

impl ProxyEngine {
    pub fn new(
        config: EngineConfig,
        source: Arc<dyn ClusterConfigSource>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        config.validate()?;
        let pool = ConnectionPool::new(connector, config.pool.clone())?;
        Ok(Self {
            plans: PlanCache::new(config.plan_cache_capacity),
            registry: ClusterRegistry::new(source, config.maintenance_interval),
            resolver: PartitionResolver::new(),
            executor: FanoutExecutor::new(Arc::new(pool)),
            initialized: OnceCell::new(),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &ClusterRegistry {
        &self.registry
    }

    pub fn plans(&self) -> &PlanCache {
        &self.plans
    }

    pub fn pool(&self) -> &ConnectionPool {
        self.executor.pool()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool().stats()
    }

    /// One-time startup work. Safe to call on every entry.
    pub async fn initialize(&self) {
        self.initialized
            .get_or_init(|| async {
                for name in &self.config.preload_clusters {
                    if let Err(err) = self.registry.resolve(name).await {
                        warn!("Preloading cluster '{}' failed: {}", name, err);
                    }
                }
                info!(
                    "Proxy engine ready ({} cluster(s) preloaded)",
                    self.registry.known_clusters().len()
                );
            })
            .await;
    }

    /// Maintenance hook: refreshes cluster membership and cleans the pool,
    /// at most once per maintenance interval.
    pub async fn maintain(&self, now: Instant) -> MaintenanceReport {
        let refresh = self.registry.refresh(now).await;
        if refresh.skipped {
            return MaintenanceReport {
                refresh,
                closed_connections: 0,
            };
        }

        let closed_connections = self.pool().maintain(now, &self.registry.snapshots());
        debug!(
            "Maintenance: {} refreshed, {} failed, {} connection(s) closed",
            refresh.refreshed.len(),
            refresh.failed.len(),
            closed_connections
        );
        MaintenanceReport {
            refresh,
            closed_connections,
        }
    }

    /// Invokes `func`, returning a value or a row cursor depending on
    /// whether it is set-returning.
    pub async fn invoke(
        &self,
        func: &FunctionDef,
        args: Vec<Value>,
    ) -> std::result::Result<CallOutput, CallError> {
        if func.returns_set {
            self.call_set(func, args).await.map(CallOutput::Set)
        } else {
            self.call(func, args).await.map(CallOutput::Value)
        }
    }

    /// Single-valued call: runs everywhere the directive says and returns
    /// the first merged row. Connections are released before returning.
    pub async fn call(
        &self,
        func: &FunctionDef,
        args: Vec<Value>,
    ) -> std::result::Result<Option<Row>, CallError> {
        let mut set = self.call_set(func, args).await?;
        let row = set.next_row();
        drop(set);
        Ok(row)
    }

    /// Set-returning call. The returned cursor owns the call's pooled
    /// connections until it is exhausted or dropped.
    pub async fn call_set(
        &self,
        func: &FunctionDef,
        args: Vec<Value>,
    ) -> std::result::Result<ResultSet, CallError> {
        let call_id = Uuid::new_v4();
        let span = info_span!(
            "proxy.call",
            function = %func.name,
            call_id = %call_id
        );

        self.execute(call_id, func, args)
            .instrument(span)
            .await
            .map_err(|err| CallError::new(func.name.clone(), func.arity(), err))
    }

    async fn execute(&self, call_id: Uuid, func: &FunctionDef, args: Vec<Value>) -> Result<ResultSet> {
        self.initialize().await;
        self.maintain(Instant::now()).await;

        let plan = self.plans.get_or_compile(func)?;
        let args = bind_arguments(&plan, args)?;
        let cluster = plan.cluster.resolve(&args)?;
        let spec = self.registry.resolve(&cluster).await?;
        let targets = self.resolver.select(&plan, &args, &spec)?;
        let query = bind_query(&plan, &args)?;

        debug!(
            "Call {} of {} on cluster '{}' generation {}: {} partition(s)",
            call_id,
            func.name,
            cluster,
            spec.generation(),
            targets.len()
        );
        let executed = self
            .executor
            .execute(&cluster, &plan, &targets, &query)
            .await?;
        Ok(ResultSet::new(call_id, func.name.clone(), executed))
    }
}
