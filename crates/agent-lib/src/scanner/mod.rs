//! Pod scanning and cluster-state reconciliation
//!
//! Three cooperating loops: a periodic scan that launches fire-and-forget
//! per-pod detections gated by a processed set, a lifecycle consumer that
//! evicts on delete events, and a reconciliation sweep that removes cache
//! and processed-set entries whose cluster objects are gone. The sweep is
//! the backstop; it never relies on event delivery.

mod coordinator;

#[cfg(test)]
mod tests;

pub use coordinator::{PodCoordinator, PodDetectionOutcome};

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::cache::DetectionCache;
use crate::cluster::{ClusterApi, LifecycleEvent};
use crate::namespaces::NamespacePolicy;
use crate::observability::AgentMetrics;

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Cadence of the running-pod scan.
    pub scan_interval: Duration,
    /// Cadence of the wholesale processed-set flush, which permits
    /// re-detection of long-lived pods whose processes were replaced.
    pub processed_flush_interval: Duration,
    /// Cadence of the cluster-state reconciliation sweep.
    pub reconcile_interval: Duration,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(30),
            processed_flush_interval: Duration::from_secs(6 * 60),
            reconcile_interval: Duration::from_secs(5 * 60),
        }
    }
}

pub struct PodScanner {
    cluster: Arc<dyn ClusterApi>,
    cache: Arc<DetectionCache>,
    coordinator: Arc<PodCoordinator>,
    policy: NamespacePolicy,
    config: ScannerConfig,
    processed: Arc<DashMap<String, ()>>,
    metrics: AgentMetrics,
}

impl PodScanner {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        cache: Arc<DetectionCache>,
        coordinator: Arc<PodCoordinator>,
        policy: NamespacePolicy,
        config: ScannerConfig,
        metrics: AgentMetrics,
    ) -> Self {
        Self {
            cluster,
            cache,
            coordinator,
            policy,
            config,
            processed: Arc::new(DashMap::new()),
            metrics,
        }
    }

    /// Await informer cache sync, then start the three loops. Sync failure
    /// is fatal and propagates to the supervisor.
    pub async fn start(
        self: Arc<Self>,
        shutdown: &broadcast::Sender<()>,
    ) -> Result<Vec<JoinHandle<()>>> {
        self.cluster
            .wait_for_cache_sync()
            .await
            .context("informer cache sync failed")?;
        info!("Cluster caches synced");

        let events = self
            .cluster
            .subscribe_lifecycle()
            .await
            .context("failed to subscribe to lifecycle events")?;

        let scan = {
            let scanner = Arc::clone(&self);
            let shutdown = shutdown.subscribe();
            tokio::spawn(async move { scanner.scan_loop(shutdown).await })
        };
        let lifecycle = {
            let scanner = Arc::clone(&self);
            let shutdown = shutdown.subscribe();
            tokio::spawn(async move { scanner.lifecycle_loop(events, shutdown).await })
        };
        let reconcile = {
            let scanner = Arc::clone(&self);
            let shutdown = shutdown.subscribe();
            tokio::spawn(async move { scanner.reconcile_loop(shutdown).await })
        };

        Ok(vec![scan, lifecycle, reconcile])
    }

    async fn scan_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.scan_interval.as_secs(),
            "Starting pod scan loop"
        );
        let mut scan_tick = interval(self.config.scan_interval);
        let mut flush_tick = interval(self.config.processed_flush_interval);
        // Consume the immediate first flush tick; the first scan tick is
        // wanted immediately.
        flush_tick.tick().await;

        loop {
            tokio::select! {
                _ = scan_tick.tick() => {
                    let _ = self.scan_running_pods().await;
                }
                _ = flush_tick.tick() => {
                    let flushed = self.processed.len();
                    self.processed.clear();
                    info!(flushed, "Flushed processed-pod set to permit re-detection");
                }
                _ = shutdown.recv() => {
                    info!("Pod scan loop shutting down");
                    return;
                }
            }
        }
    }

    /// One scan pass: launch a detached detection task per unprocessed
    /// running pod in a monitored namespace. Handles are returned so tests
    /// can await them; the loop drops them.
    pub(crate) async fn scan_running_pods(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let pods = match self.cluster.list_running_pods().await {
            Ok(pods) => pods,
            Err(e) => {
                warn!(error = %e, "Failed to list running pods");
                return Vec::new();
            }
        };
        debug!(count = pods.len(), "Scanning running pods");

        let mut handles = Vec::new();
        for pod in pods {
            if !self.policy.should_monitor(&pod.namespace) {
                continue;
            }
            let key = pod.key();
            if self.processed.contains_key(&key) {
                continue;
            }
            // Insert before the detection starts; removed again on an
            // incomplete outcome so the next scan retries.
            self.processed.insert(key.clone(), ());
            self.metrics.inc_pods_scanned();

            let scanner = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                let outcome = scanner.coordinator.detect_pod(&pod).await;
                if !outcome.complete {
                    scanner.processed.remove(&key);
                }
            }));
        }
        handles
    }

    async fn lifecycle_loop(
        self: Arc<Self>,
        mut events: tokio::sync::mpsc::Receiver<LifecycleEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!("Starting lifecycle event loop");
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_lifecycle_event(event),
                    None => {
                        warn!("Lifecycle event stream closed");
                        return;
                    }
                },
                _ = shutdown.recv() => {
                    info!("Lifecycle event loop shutting down");
                    return;
                }
            }
        }
    }

    pub(crate) fn handle_lifecycle_event(&self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::PodDeleted { namespace, name } => {
                self.processed.remove(&format!("{namespace}/{name}"));
                debug!(namespace, pod = name, "Pod deleted, removed from processed set");
            }
            LifecycleEvent::WorkloadDeleted { namespace, name, kind } => {
                self.cache.remove_workload(&namespace, &name);
                info!(
                    namespace,
                    workload = name,
                    kind = kind.as_str(),
                    "Workload deleted, removed from cache"
                );
            }
        }
    }

    async fn reconcile_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.reconcile_interval.as_secs(),
            "Starting reconciliation loop"
        );
        let mut tick = interval(self.config.reconcile_interval);
        tick.tick().await;

        loop {
            tokio::select! {
                _ = tick.tick() => self.reconcile().await,
                _ = shutdown.recv() => {
                    info!("Reconciliation loop shutting down");
                    return;
                }
            }
        }
    }

    /// Drop cached workloads and processed-pod entries whose cluster
    /// objects no longer exist. API errors are treated as "still exists";
    /// eviction on a transient failure would lose good state.
    pub(crate) async fn reconcile(&self) {
        let cached = self.cache.get_all_active_workloads();
        let mut removed_workloads = 0usize;

        for workload in &cached {
            match self
                .cluster
                .workload_exists(&workload.namespace, workload.workload_kind, &workload.workload_name)
                .await
            {
                Ok(false) => {
                    self.cache
                        .remove_workload(&workload.namespace, &workload.workload_name);
                    removed_workloads += 1;
                    info!(
                        namespace = %workload.namespace,
                        workload = %workload.workload_name,
                        kind = workload.workload_kind.as_str(),
                        "Workload no longer exists, removed from cache"
                    );
                }
                Ok(true) => {}
                Err(e) => {
                    debug!(
                        namespace = %workload.namespace,
                        workload = %workload.workload_name,
                        error = %e,
                        "Workload lookup failed, keeping cache entry"
                    );
                }
            }
        }

        let keys: Vec<String> = self.processed.iter().map(|e| e.key().clone()).collect();
        let mut removed_pods = 0usize;
        for key in keys {
            let Some((namespace, name)) = key.split_once('/') else {
                continue;
            };
            match self.cluster.get_pod(namespace, name).await {
                Ok(None) => {
                    self.processed.remove(&key);
                    removed_pods += 1;
                }
                Ok(Some(_)) => {}
                Err(e) => {
                    debug!(pod = %key, error = %e, "Pod lookup failed, keeping processed entry");
                }
            }
        }

        self.metrics.set_workloads_tracked(self.cache.workload_count() as i64);
        info!(
            cached_workloads = cached.len(),
            removed_workloads, removed_pods, "Cache reconciliation completed"
        );
    }

    #[cfg(test)]
    pub(crate) fn processed_set(&self) -> &DashMap<String, ()> {
        &self.processed
    }
}
