//! Upstream batching client
//!
//! Single worker task owning the pending batch: accumulates queued results,
//! flushes on size or interval, periodically re-emits the cache so a
//! restarted updater recovers state, and drains on shutdown. Connection
//! loss triggers one reconnect plus one retry per batch; a batch that still
//! fails is dropped with an error event while the queue keeps accepting
//! work.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tracing::{info, warn};

use super::wire::{Connection, PUSH_METHOD};
use crate::cache::DetectionCache;
use crate::models::ContainerInfo;
use crate::observability::{AgentMetrics, DomainLogger};

pub const FLUSH_QUEUE_SIZE: &str = "queue_size_threshold_reached";
pub const FLUSH_PERIODIC: &str = "periodic_flush_interval";
pub const FLUSH_CACHE_SYNC: &str = "cached_workloads_sync";
pub const FLUSH_SHUTDOWN: &str = "application_shutdown";

#[derive(Debug, Clone)]
pub struct UpdaterClientConfig {
    /// TCP host:port of the config updater.
    pub server_addr: String,
    /// Capacity of the inbound result queue; senders block past this.
    pub queue_capacity: usize,
    /// Batch size that triggers an immediate flush.
    pub batch_size: usize,
    /// Cadence of partial-batch flushes.
    pub flush_interval: Duration,
    /// Cadence of full cache re-emission.
    pub cache_sync_interval: Duration,
    /// Sub-batch size for cache re-emission.
    pub cache_sync_chunk: usize,
    /// Sleep between failed dial attempts.
    pub reconnect_interval: Duration,
    /// Grace before the very first dial, letting the updater come up.
    pub startup_delay: Duration,
}

impl UpdaterClientConfig {
    pub fn new(server_addr: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            queue_capacity: 100,
            batch_size: 5,
            flush_interval: Duration::from_secs(10),
            cache_sync_interval: Duration::from_secs(15),
            cache_sync_chunk: 10,
            reconnect_interval: Duration::from_secs(10),
            startup_delay: Duration::from_secs(10),
        }
    }
}

pub struct UpdaterClient {
    config: UpdaterClientConfig,
    rx: mpsc::Receiver<ContainerInfo>,
    conn: Option<Connection>,
    batch: Vec<ContainerInfo>,
    dialed_once: bool,
    cache: Arc<DetectionCache>,
    logger: DomainLogger,
    metrics: AgentMetrics,
}

impl UpdaterClient {
    /// Returns the client and the queue handle that detection tasks push
    /// results into.
    pub fn new(
        config: UpdaterClientConfig,
        cache: Arc<DetectionCache>,
        logger: DomainLogger,
        metrics: AgentMetrics,
    ) -> (Self, mpsc::Sender<ContainerInfo>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        (
            Self {
                config,
                rx,
                conn: None,
                batch: Vec::new(),
                dialed_once: false,
                cache,
                logger,
                metrics,
            },
            tx,
        )
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            server = %self.config.server_addr,
            batch_size = self.config.batch_size,
            "Starting updater client"
        );

        let mut flush_tick = interval(self.config.flush_interval);
        let mut sync_tick = interval(self.config.cache_sync_interval);
        // The first tick of a tokio interval fires immediately; skip it so
        // the cadences start one period from now.
        flush_tick.tick().await;
        sync_tick.tick().await;

        loop {
            tokio::select! {
                item = self.rx.recv() => match item {
                    Some(info) => {
                        self.batch.push(info);
                        self.metrics.set_queue_depth(self.batch.len() as i64);
                        if self.batch.len() >= self.config.batch_size
                            && !self.flush(FLUSH_QUEUE_SIZE, &mut shutdown).await
                        {
                            self.drain_and_close().await;
                            return;
                        }
                    }
                    None => {
                        self.drain_and_close().await;
                        return;
                    }
                },
                _ = flush_tick.tick() => {
                    if !self.batch.is_empty()
                        && !self.flush(FLUSH_PERIODIC, &mut shutdown).await
                    {
                        self.drain_and_close().await;
                        return;
                    }
                }
                _ = sync_tick.tick() => {
                    if !self.sync_cached_workloads(&mut shutdown).await {
                        self.drain_and_close().await;
                        return;
                    }
                }
                _ = shutdown.recv() => {
                    self.drain_and_close().await;
                    return;
                }
            }
        }
    }

    /// Final drain: fold any queued items into the batch, make one
    /// best-effort delivery, close the connection.
    async fn drain_and_close(&mut self) {
        while let Ok(info) = self.rx.try_recv() {
            self.batch.push(info);
        }
        let batch = std::mem::take(&mut self.batch);
        self.metrics.set_queue_depth(0);
        if !batch.is_empty() {
            self.send_batch_once(batch, FLUSH_SHUTDOWN).await;
        }
        if let Some(conn) = self.conn.take() {
            conn.close().await;
        }
        info!("Updater client drained and closed");
    }

    /// Re-emit every cached container in sub-batches. This is what brings a
    /// restarted updater back up to date. Returns false when shutdown was
    /// observed mid-delivery.
    async fn sync_cached_workloads(&mut self, shutdown: &mut broadcast::Receiver<()>) -> bool {
        let containers = self.cache.get_all_active_containers();
        self.metrics
            .set_workloads_tracked(self.cache.workload_count() as i64);
        for chunk in containers.chunks(self.config.cache_sync_chunk) {
            if !self.send_batch(chunk.to_vec(), FLUSH_CACHE_SYNC, shutdown).await {
                return false;
            }
        }
        true
    }

    /// Returns false when shutdown was observed mid-delivery.
    async fn flush(&mut self, reason: &str, shutdown: &mut broadcast::Receiver<()>) -> bool {
        let batch = std::mem::take(&mut self.batch);
        self.metrics.set_queue_depth(0);
        self.send_batch(batch, reason, shutdown).await
    }

    /// Deliver one batch: ensure a connection, call, and on failure
    /// reconnect and retry exactly once before dropping the batch. Returns
    /// false when shutdown was observed while waiting for a connection.
    async fn send_batch(
        &mut self,
        batch: Vec<ContainerInfo>,
        reason: &str,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> bool {
        if batch.is_empty() {
            return true;
        }

        if self.conn.is_none() && !self.dial_with_retry(shutdown).await {
            self.logger
                .batch_failed(batch.len(), reason, "shutdown before connection established");
            self.metrics.inc_batch_failure();
            return false;
        }
        let Some(conn) = self.conn.as_mut() else {
            return true;
        };

        match conn.call(PUSH_METHOD, &batch).await {
            Ok(reply) => {
                self.metrics.inc_batch_sent(batch.len());
                self.logger.batch_sent(batch.len(), reason, &reply);
                return true;
            }
            Err(e) => {
                self.logger.batch_failed(batch.len(), reason, &e.to_string());
                self.conn = None;
            }
        }

        if !self.dial_with_retry(shutdown).await {
            self.metrics.inc_batch_failure();
            return false;
        }
        let Some(conn) = self.conn.as_mut() else {
            return true;
        };
        match conn.call(PUSH_METHOD, &batch).await {
            Ok(reply) => {
                self.metrics.inc_batch_sent(batch.len());
                self.logger.batch_sent(batch.len(), reason, &reply);
            }
            Err(e) => {
                self.conn = None;
                self.metrics.inc_batch_failure();
                self.logger.batch_failed(batch.len(), reason, &e.to_string());
            }
        }
        true
    }

    /// Single delivery attempt used during shutdown, where waiting on a
    /// reconnect loop would stall the drain.
    async fn send_batch_once(&mut self, batch: Vec<ContainerInfo>, reason: &str) {
        if self.conn.is_none() {
            match Connection::connect(&self.config.server_addr).await {
                Ok(conn) => self.conn = Some(conn),
                Err(e) => {
                    self.metrics.inc_batch_failure();
                    self.logger.batch_failed(batch.len(), reason, &e.to_string());
                    return;
                }
            }
        }
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        match conn.call(PUSH_METHOD, &batch).await {
            Ok(reply) => {
                self.metrics.inc_batch_sent(batch.len());
                self.logger.batch_sent(batch.len(), reason, &reply);
            }
            Err(e) => {
                self.conn = None;
                self.metrics.inc_batch_failure();
                self.logger.batch_failed(batch.len(), reason, &e.to_string());
            }
        }
    }

    /// Dial until connected or shutdown. Returns false when cancelled.
    async fn dial_with_retry(&mut self, shutdown: &mut broadcast::Receiver<()>) -> bool {
        if !self.dialed_once {
            self.dialed_once = true;
            tokio::time::sleep(self.config.startup_delay).await;
        }

        loop {
            info!(server = %self.config.server_addr, "Attempting to connect to updater");
            match Connection::connect(&self.config.server_addr).await {
                Ok(conn) => {
                    info!(server = %self.config.server_addr, "Connected to updater");
                    self.conn = Some(conn);
                    return true;
                }
                Err(e) => {
                    warn!(
                        server = %self.config.server_addr,
                        error = %e,
                        retry_in_secs = self.config.reconnect_interval.as_secs_f64(),
                        "Failed to connect to updater, will retry"
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_interval) => {}
                _ = shutdown.recv() => return false,
            }
        }
    }
}
