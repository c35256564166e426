use super::{ClusterConfigSource, ClusterSpec};
use crate::core::{ProxyError, Result};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// Outcome of one maintenance refresh.
#[derive(Debug, Default)]
pub struct RefreshReport {
    /// The interval had not elapsed; nothing was attempted.
    pub skipped: bool,
    /// Clusters that got a new snapshot.
    pub refreshed: Vec<String>,
    /// Clusters whose source version was unchanged.
    pub unchanged: Vec<String>,
    /// Clusters that kept their previous snapshot because the source failed.
    pub failed: Vec<ProxyError>,
}

/// Last-known-good partition lists for every cluster seen so far.
///
/// Readers get an `Arc<ClusterSpec>` snapshot and never observe a partial
/// update: refresh builds a complete new spec and swaps the pointer.
pub struct ClusterRegistry {
    source: Arc<dyn ClusterConfigSource>,
    clusters: RwLock<HashMap<String, Arc<ClusterSpec>>>,
    /// Serializes first loads and refreshes against each other.
    load_lock: tokio::sync::Mutex<()>,
    refresh_interval: Duration,
    last_refresh: Mutex<Option<Instant>>,
}

impl ClusterRegistry {
    pub fn new(source: Arc<dyn ClusterConfigSource>, refresh_interval: Duration) -> Self {
        Self {
            source,
            clusters: RwLock::new(HashMap::new()),
            load_lock: tokio::sync::Mutex::new(()),
            refresh_interval,
            last_refresh: Mutex::new(None),
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    /// Current snapshot of `name` without touching the source.
    pub fn snapshot(&self, name: &str) -> Option<Arc<ClusterSpec>> {
        self.clusters
            .read()
            .ok()
            .and_then(|clusters| clusters.get(name).cloned())
    }

    pub fn snapshots(&self) -> HashMap<String, Arc<ClusterSpec>> {
        self.clusters
            .read()
            .map(|clusters| clusters.clone())
            .unwrap_or_default()
    }

    pub fn known_clusters(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .clusters
            .read()
            .map(|clusters| clusters.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Returns the last-known-good spec of `name`, loading it synchronously
    /// on first use.
    pub async fn resolve(&self, name: &str) -> Result<Arc<ClusterSpec>> {
        if let Some(spec) = self.snapshot(name) {
            return Ok(spec);
        }

        let _loading = self.load_lock.lock().await;
        if let Some(spec) = self.snapshot(name) {
            return Ok(spec);
        }

        let unknown = |reason: String| ProxyError::UnknownCluster {
            name: name.to_string(),
            reason,
        };
        let version = self
            .source
            .version(name)
            .await
            .map_err(|e| unknown(e.to_string()))?;
        let partitions = self
            .source
            .partitions(name)
            .await
            .map_err(|e| unknown(e.to_string()))?;
        if partitions.is_empty() {
            return Err(unknown("no partitions configured".to_string()));
        }

        let spec = Arc::new(ClusterSpec::new(name, 1, version, partitions));
        info!(
            "Loaded cluster '{}' with {} partition(s)",
            name,
            spec.partition_count()
        );
        self.clusters
            .write()?
            .insert(name.to_string(), Arc::clone(&spec));
        Ok(spec)
    }

    fn interval_elapsed(last: Option<Instant>, now: Instant, interval: Duration) -> bool {
        match last {
            Some(last) => now.saturating_duration_since(last) >= interval,
            None => true,
        }
    }

    /// Re-reads every known cluster if the refresh interval has elapsed.
    ///
    /// Failures are logged and reported, never returned: a cluster whose
    /// source fails keeps its previous spec and generation.
    pub async fn refresh(&self, now: Instant) -> RefreshReport {
        {
            let mut last = match self.last_refresh.lock() {
                Ok(last) => last,
                Err(poisoned) => poisoned.into_inner(),
            };
            if !Self::interval_elapsed(*last, now, self.refresh_interval) {
                return RefreshReport {
                    skipped: true,
                    ..RefreshReport::default()
                };
            }
            *last = Some(now);
        }
        self.refresh_all().await
    }

    /// Refresh ignoring the interval.
    pub async fn force_refresh(&self) -> RefreshReport {
        if let Ok(mut last) = self.last_refresh.lock() {
            *last = Some(Instant::now());
        }
        self.refresh_all().await
    }

    async fn refresh_all(&self) -> RefreshReport {
        let _loading = self.load_lock.lock().await;
        let mut report = RefreshReport::default();

        for (name, current) in self.snapshots() {
            match self.reload(&name, &current).await {
                Ok(Some(spec)) => {
                    info!(
                        "Cluster '{}' refreshed: generation {}, {} partition(s)",
                        name,
                        spec.generation(),
                        spec.partition_count()
                    );
                    match self.clusters.write() {
                        Ok(mut clusters) => {
                            clusters.insert(name.clone(), spec);
                            report.refreshed.push(name);
                        }
                        Err(e) => report.failed.push(ProxyError::RegistryRefresh {
                            cluster: name,
                            reason: e.to_string(),
                        }),
                    }
                }
                Ok(None) => {
                    debug!("Cluster '{}' unchanged", name);
                    report.unchanged.push(name);
                }
                Err(err) => {
                    warn!("{}; keeping generation {}", err, current.generation());
                    report.failed.push(err);
                }
            }
        }

        report
    }

    /// Builds the next spec for `name`, or `None` when the source version
    /// shows nothing changed.
    async fn reload(&self, name: &str, current: &ClusterSpec) -> Result<Option<Arc<ClusterSpec>>> {
        let failed = |reason: String| ProxyError::RegistryRefresh {
            cluster: name.to_string(),
            reason,
        };

        let version = self
            .source
            .version(name)
            .await
            .map_err(|e| failed(e.to_string()))?;
        if version.is_some() && version == current.source_version() {
            return Ok(None);
        }

        let partitions = self
            .source
            .partitions(name)
            .await
            .map_err(|e| failed(e.to_string()))?;
        if partitions.is_empty() {
            return Err(failed("source returned no partitions".to_string()));
        }

        Ok(Some(Arc::new(ClusterSpec::new(
            name,
            current.generation().saturating_add(1),
            version,
            partitions,
        ))))
    }
}
