use super::{ConnectionState, Connector, PartitionConnection, config::PoolConfig};
use crate::cluster::{ClusterSpec, PartitionTarget};
use crate::core::{ProxyError, RemoteError, Result};
use crate::executor::BoundQuery;
use crate::result::QueryResult;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as SlotMutex, OwnedMutexGuard};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SlotKey {
    cluster: String,
    partition: usize,
}

/// The single reusable connection of one (cluster, partition).
struct PartitionSlot {
    state: ConnectionState,
    connection: Option<Box<dyn PartitionConnection>>,
    /// Address the live connection was opened against
    address: Option<String>,
    created_at: Option<Instant>,
    last_used: Option<Instant>,
}

impl PartitionSlot {
    fn new() -> Self {
        Self {
            state: ConnectionState::Unconnected,
            connection: None,
            address: None,
            created_at: None,
            last_used: None,
        }
    }

    fn is_expired(&self, max_lifetime: Option<Duration>, now: Instant) -> bool {
        match (max_lifetime, self.created_at) {
            (Some(lifetime), Some(created)) => now.saturating_duration_since(created) > lifetime,
            _ => false,
        }
    }

    fn is_idle_too_long(&self, idle_timeout: Option<Duration>, now: Instant) -> bool {
        match (idle_timeout, self.last_used) {
            (Some(timeout), Some(used)) => now.saturating_duration_since(used) > timeout,
            _ => false,
        }
    }

    fn discard(&mut self, state: ConnectionState) {
        self.connection = None;
        self.address = None;
        self.created_at = None;
        self.last_used = None;
        self.state = state;
    }
}

#[derive(Default)]
struct PoolCounters {
    in_use: AtomicUsize,
    connects: AtomicU64,
    evictions: AtomicU64,
}

/// Connection pool
///
/// Holds one lazily-established connection per (cluster, partition). A call
/// owns a partition's connection exclusively for as long as it holds the
/// `PoolGuard`; other calls to the same partition wait, calls to other
/// partitions never do.
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    slots: Mutex<HashMap<SlotKey, Arc<SlotMutex<PartitionSlot>>>>,
    counters: Arc<PoolCounters>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig) -> Result<Self> {
        config.validate().map_err(ProxyError::Config)?;
        Ok(Self {
            connector,
            config,
            slots: Mutex::new(HashMap::new()),
            counters: Arc::new(PoolCounters::default()),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn slot(&self, cluster: &str, partition: usize) -> Result<Arc<SlotMutex<PartitionSlot>>> {
        let mut slots = self.slots.lock()?;
        let slot = slots
            .entry(SlotKey {
                cluster: cluster.to_string(),
                partition,
            })
            .or_insert_with(|| Arc::new(SlotMutex::new(PartitionSlot::new())));
        Ok(Arc::clone(slot))
    }

    /// Takes exclusive ownership of the partition's connection slot.
    ///
    /// No I/O happens here; the connection is established by the first
    /// `PoolGuard::execute`.
    pub async fn acquire(&self, cluster: &str, target: &PartitionTarget) -> Result<PoolGuard> {
        self.acquire_within(cluster, target, self.config.acquire_timeout)
            .await
    }

    /// Like [`ConnectionPool::acquire`], waiting at most `wait`.
    pub async fn acquire_within(
        &self,
        cluster: &str,
        target: &PartitionTarget,
        wait: Duration,
    ) -> Result<PoolGuard> {
        let slot = self.slot(cluster, target.index)?;
        let slot = tokio::time::timeout(wait, slot.lock_owned())
            .await
            .map_err(|_| ProxyError::PartitionConnection {
                partition: target.index,
                message: format!(
                    "timed out after {:?} waiting for the pooled connection",
                    self.config.acquire_timeout
                ),
            })?;
        Ok(self.guard(slot, cluster, target))
    }

    /// Takes the slot only if no other call holds it.
    pub fn try_acquire(&self, cluster: &str, target: &PartitionTarget) -> Result<Option<PoolGuard>> {
        let slot = self.slot(cluster, target.index)?;
        Ok(slot
            .try_lock_owned()
            .ok()
            .map(|slot| self.guard(slot, cluster, target)))
    }

    fn guard(
        &self,
        slot: OwnedMutexGuard<PartitionSlot>,
        cluster: &str,
        target: &PartitionTarget,
    ) -> PoolGuard {
        self.counters.in_use.fetch_add(1, Ordering::SeqCst);
        PoolGuard {
            slot,
            cluster: cluster.to_string(),
            target: target.clone(),
            connector: Arc::clone(&self.connector),
            connect_timeout: self.config.connect_timeout,
            query_timeout: self.config.query_timeout,
            max_lifetime: self.config.max_lifetime,
            broken_in_call: false,
            counters: Arc::clone(&self.counters),
        }
    }

    /// Closes idle, over-age and re-addressed connections and forgets slots
    /// whose partition no longer exists. Slots held by a call are skipped.
    ///
    /// Returns the number of connections closed.
    pub fn maintain(&self, now: Instant, clusters: &HashMap<String, Arc<ClusterSpec>>) -> usize {
        let mut slots = match self.slots.lock() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut closed = 0usize;
        slots.retain(|key, slot| {
            let Ok(mut slot) = slot.try_lock() else {
                return true;
            };
            let target = clusters
                .get(&key.cluster)
                .and_then(|spec| spec.partition(key.partition));

            let Some(target) = target else {
                if slot.connection.is_some() {
                    closed += 1;
                }
                slot.discard(ConnectionState::Unconnected);
                return false;
            };

            if slot.connection.is_some() {
                let readdressed = slot.address.as_deref() != Some(target.address.as_str());
                if readdressed
                    || slot.is_expired(self.config.max_lifetime, now)
                    || slot.is_idle_too_long(self.config.idle_timeout, now)
                {
                    debug!(
                        "Closing connection to partition {} of cluster '{}'",
                        key.partition, key.cluster
                    );
                    slot.discard(ConnectionState::Unconnected);
                    closed += 1;
                }
            }
            true
        });

        if closed > 0 {
            self.counters
                .evictions
                .fetch_add(closed as u64, Ordering::SeqCst);
        }
        closed
    }

    /// State of the slot for (cluster, partition), if one exists and is not in use.
    pub fn state(&self, cluster: &str, partition: usize) -> Option<ConnectionState> {
        let slots = self.slots.lock().ok()?;
        let slot = slots.get(&SlotKey {
            cluster: cluster.to_string(),
            partition,
        })?;
        slot.try_lock().ok().map(|slot| slot.state)
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let (slots, idle) = match self.slots.lock() {
            Ok(slots) => {
                let idle = slots
                    .values()
                    .filter(|slot| {
                        slot.try_lock()
                            .map(|slot| slot.connection.is_some())
                            .unwrap_or(false)
                    })
                    .count();
                (slots.len(), idle)
            }
            Err(_) => (0, 0),
        };

        PoolStats {
            slots,
            idle_connections: idle,
            in_use: self.counters.in_use.load(Ordering::SeqCst),
            connects: self.counters.connects.load(Ordering::SeqCst),
            evictions: self.counters.evictions.load(Ordering::SeqCst),
        }
    }
}

/// Connection pool statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Known (cluster, partition) slots
    pub slots: usize,
    /// Established connections not held by any call
    pub idle_connections: usize,
    /// Slots currently held by calls
    pub in_use: usize,
    /// Connections established since start
    pub connects: u64,
    /// Connections closed by maintenance or after breaking
    pub evictions: u64,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pool Stats: {} slots, {} in use, {} idle, {} connects, {} evictions",
            self.slots, self.in_use, self.idle_connections, self.connects, self.evictions
        )
    }
}

/// How a call leaves a connection when handing it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Healthy,
    Broken,
}

/// RAII guard for one partition's pooled connection
///
/// Returns the slot to the pool when dropped. The connection itself stays
/// open unless it broke.
pub struct PoolGuard {
    slot: OwnedMutexGuard<PartitionSlot>,
    cluster: String,
    target: PartitionTarget,
    connector: Arc<dyn Connector>,
    connect_timeout: Duration,
    query_timeout: Option<Duration>,
    max_lifetime: Option<Duration>,
    broken_in_call: bool,
    counters: Arc<PoolCounters>,
}

impl PoolGuard {
    pub fn partition(&self) -> usize {
        self.target.index
    }

    pub fn target(&self) -> &PartitionTarget {
        &self.target
    }

    pub fn state(&self) -> ConnectionState {
        self.slot.state
    }

    /// Runs `query` on this partition, connecting first if needed.
    ///
    /// A connection that breaks is discarded and not retried by this guard.
    pub async fn execute(&mut self, query: &BoundQuery) -> std::result::Result<QueryResult, RemoteError> {
        if self.broken_in_call {
            return Err(RemoteError::Connection(
                "connection broke earlier in this call".to_string(),
            ));
        }

        self.ensure_connected().await?;

        let query_timeout = self.query_timeout;
        let outcome = match self.slot.connection.as_mut() {
            Some(connection) => match query_timeout {
                Some(limit) => tokio::time::timeout(limit, connection.query(query))
                    .await
                    .unwrap_or_else(|_| {
                        Err(RemoteError::Connection(format!(
                            "query timed out after {:?}",
                            limit
                        )))
                    }),
                None => connection.query(query).await,
            },
            None => Err(RemoteError::Connection("no connection".to_string())),
        };

        let healthy = self
            .slot
            .connection
            .as_ref()
            .is_some_and(|connection| connection.is_healthy());
        match &outcome {
            Err(RemoteError::Connection(message)) => {
                warn!(
                    "Partition {} of cluster '{}' broke: {}",
                    self.target.index, self.cluster, message
                );
                self.mark_broken();
            }
            _ if !healthy => self.mark_broken(),
            _ => self.slot.last_used = Some(Instant::now()),
        }
        outcome
    }

    async fn ensure_connected(&mut self) -> std::result::Result<(), RemoteError> {
        let now = Instant::now();
        let stale = match (&self.slot.connection, &self.slot.address) {
            (Some(connection), Some(address)) => {
                address != &self.target.address
                    || !connection.is_healthy()
                    || self.slot.is_expired(self.max_lifetime, now)
            }
            (Some(_), None) => true,
            (None, _) => false,
        };
        if stale {
            debug!(
                "Replacing stale connection to partition {} of cluster '{}'",
                self.target.index, self.cluster
            );
            self.slot.discard(ConnectionState::Unconnected);
            self.counters.evictions.fetch_add(1, Ordering::SeqCst);
        }
        if self.slot.connection.is_some() {
            return Ok(());
        }

        self.slot.state = ConnectionState::Connecting;
        let connect_timeout = self.connect_timeout;
        let result = tokio::time::timeout(connect_timeout, self.connector.connect(&self.target))
            .await
            .unwrap_or_else(|_| {
                Err(RemoteError::Connection(format!(
                    "connect timed out after {:?}",
                    connect_timeout
                )))
            });

        match result {
            Ok(connection) => {
                let now = Instant::now();
                let slot = &mut *self.slot;
                slot.connection = Some(connection);
                slot.address = Some(self.target.address.clone());
                slot.created_at = Some(now);
                slot.last_used = Some(now);
                slot.state = ConnectionState::Ready;
                self.counters.connects.fetch_add(1, Ordering::SeqCst);
                debug!(
                    "Connected to partition {} of cluster '{}'",
                    self.target, self.cluster
                );
                Ok(())
            }
            Err(err) => {
                self.slot.discard(ConnectionState::Broken);
                self.broken_in_call = true;
                warn!(
                    "Cannot connect to partition {} of cluster '{}': {}",
                    self.target, self.cluster, err.message()
                );
                Err(RemoteError::Connection(err.message().to_string()))
            }
        }
    }

    /// Discards the connection; the next call to this partition reconnects.
    pub fn mark_broken(&mut self) {
        if self.slot.connection.is_some() {
            self.counters.evictions.fetch_add(1, Ordering::SeqCst);
        }
        self.slot.discard(ConnectionState::Broken);
        self.broken_in_call = true;
    }

    /// Hands the slot back to the pool.
    pub fn release(mut self, outcome: ReleaseOutcome) {
        if outcome == ReleaseOutcome::Broken {
            self.mark_broken();
        }
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        self.counters.in_use.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::PartitionConfig;
    use crate::connection::memory::MemoryConnector;
    use crate::core::Value;

    fn target(index: usize, address: &str) -> PartitionTarget {
        PartitionTarget {
            index,
            address: address.to_string(),
            credentials: None,
        }
    }

    fn select_one() -> BoundQuery {
        BoundQuery::new("SELECT 1", Vec::new())
    }

    fn pool(connector: &Arc<MemoryConnector>, config: PoolConfig) -> ConnectionPool {
        let connector: Arc<dyn Connector> = connector.clone();
        ConnectionPool::new(connector, config).unwrap()
    }

    #[tokio::test]
    async fn test_connection_is_lazy_and_reused() {
        let connector = Arc::new(MemoryConnector::new());
        connector.add_partition("p0", |_query| Ok(QueryResult::single("x", Value::Integer(1))));
        let pool = pool(&connector, PoolConfig::default());

        let mut guard = pool.acquire("demo", &target(0, "p0")).await.unwrap();
        assert_eq!(guard.state(), ConnectionState::Unconnected);
        assert_eq!(connector.connect_count("p0"), 0);
        guard.execute(&select_one()).await.unwrap();
        assert_eq!(guard.state(), ConnectionState::Ready);
        drop(guard);

        let mut guard = pool.acquire("demo", &target(0, "p0")).await.unwrap();
        guard.execute(&select_one()).await.unwrap();
        drop(guard);

        assert_eq!(connector.connect_count("p0"), 1);
        let stats = pool.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.idle_connections, 1);
        assert_eq!(stats.connects, 1);
    }

    #[tokio::test]
    async fn test_broken_connection_is_not_retried_in_same_call() {
        let connector = Arc::new(MemoryConnector::new());
        connector.add_partition("p0", |_query| Ok(QueryResult::empty()));
        connector.set_reachable("p0", false);
        let pool = pool(&connector, PoolConfig::default());

        let mut guard = pool.acquire("demo", &target(0, "p0")).await.unwrap();
        assert!(matches!(
            guard.execute(&select_one()).await,
            Err(RemoteError::Connection(_))
        ));
        assert_eq!(guard.state(), ConnectionState::Broken);

        connector.set_reachable("p0", true);
        assert!(guard.execute(&select_one()).await.is_err());
        drop(guard);
        assert_eq!(pool.state("demo", 0), Some(ConnectionState::Broken));

        // the next call reconnects
        let mut guard = pool.acquire("demo", &target(0, "p0")).await.unwrap();
        guard.execute(&select_one()).await.unwrap();
        assert_eq!(guard.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_busy_slot_times_out() {
        let connector = Arc::new(MemoryConnector::new());
        connector.add_partition("p0", |_query| Ok(QueryResult::empty()));
        let pool = pool(
            &connector,
            PoolConfig::new().acquire_timeout(Duration::from_millis(50)),
        );

        let _held = pool.acquire("demo", &target(0, "p0")).await.unwrap();
        let err = pool.acquire("demo", &target(0, "p0")).await.err().unwrap();
        assert!(matches!(err, ProxyError::PartitionConnection { partition: 0, .. }));

        // a different partition is not blocked
        let other = pool.acquire("demo", &target(1, "p0")).await;
        assert!(other.is_ok());
    }

    #[tokio::test]
    async fn test_release_broken_discards_connection() {
        let connector = Arc::new(MemoryConnector::new());
        connector.add_partition("p0", |_query| Ok(QueryResult::empty()));
        let pool = pool(&connector, PoolConfig::default());

        let mut guard = pool.acquire("demo", &target(0, "p0")).await.unwrap();
        guard.execute(&select_one()).await.unwrap();
        guard.release(ReleaseOutcome::Broken);
        assert_eq!(pool.state("demo", 0), Some(ConnectionState::Broken));
        assert_eq!(pool.stats().idle_connections, 0);
    }

    #[tokio::test]
    async fn test_maintain_closes_idle_and_removed() {
        let connector = Arc::new(MemoryConnector::new());
        connector.add_partition("p0", |_query| Ok(QueryResult::empty()));
        connector.add_partition("p1", |_query| Ok(QueryResult::empty()));
        let pool = pool(
            &connector,
            PoolConfig::new().idle_timeout(Duration::from_secs(60)),
        );

        for (index, address) in [(0, "p0"), (1, "p1")] {
            let mut guard = pool.acquire("demo", &target(index, address)).await.unwrap();
            guard.execute(&select_one()).await.unwrap();
        }

        let spec = Arc::new(ClusterSpec::new(
            "demo",
            2,
            None,
            vec![PartitionConfig::new("p0")],
        ));
        let clusters = HashMap::from([("demo".to_string(), spec)]);

        // partition 1 disappeared from the cluster
        assert_eq!(pool.maintain(Instant::now(), &clusters), 1);
        assert_eq!(pool.stats().slots, 1);

        // partition 0 idles out
        let later = Instant::now() + Duration::from_secs(61);
        assert_eq!(pool.maintain(later, &clusters), 1);
        assert_eq!(pool.stats().idle_connections, 0);
    }

    #[tokio::test]
    async fn test_readdressed_partition_reconnects() {
        let connector = Arc::new(MemoryConnector::new());
        connector.add_partition("old", |_query| Ok(QueryResult::empty()));
        connector.add_partition("new", |_query| Ok(QueryResult::empty()));
        let pool = pool(&connector, PoolConfig::default());

        let mut guard = pool.acquire("demo", &target(0, "old")).await.unwrap();
        guard.execute(&select_one()).await.unwrap();
        drop(guard);

        let mut guard = pool.acquire("demo", &target(0, "new")).await.unwrap();
        guard.execute(&select_one()).await.unwrap();
        assert_eq!(connector.connect_count("new"), 1);
    }
}
