//! Observability infrastructure
//!
//! Prometheus metrics behind a cloneable handle, and a domain logger that
//! gives detection, cache and upstream events a consistent structured
//! vocabulary.

use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter, IntCounterVec,
    IntGauge,
};
use std::sync::OnceLock;
use tracing::{debug, error, info, warn};

use crate::models::{Confidence, Language};

static GLOBAL_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();

struct AgentMetricsInner {
    pods_scanned: IntCounter,
    detections: IntCounterVec,
    detection_conflicts: IntCounter,
    cache_hits: IntCounter,
    cache_misses: IntCounter,
    batches_sent: IntCounter,
    batch_failures: IntCounter,
    results_sent: IntCounter,
    queue_depth: IntGauge,
    workloads_tracked: IntGauge,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            pods_scanned: register_int_counter!(
                "polylang_agent_pods_scanned_total",
                "Pods picked up by the scan loop"
            )
            .expect("failed to register pods_scanned_total"),

            detections: register_int_counter_vec!(
                "polylang_agent_detections_total",
                "Completed container language detections",
                &["language", "confidence"]
            )
            .expect("failed to register detections_total"),

            detection_conflicts: register_int_counter!(
                "polylang_agent_detection_conflicts_total",
                "Processes where inspectors disagreed on the language"
            )
            .expect("failed to register detection_conflicts_total"),

            cache_hits: register_int_counter!(
                "polylang_agent_cache_hits_total",
                "Detections served from the image cache"
            )
            .expect("failed to register cache_hits_total"),

            cache_misses: register_int_counter!(
                "polylang_agent_cache_misses_total",
                "Detections that required process inspection"
            )
            .expect("failed to register cache_misses_total"),

            batches_sent: register_int_counter!(
                "polylang_agent_rpc_batches_sent_total",
                "Batches delivered to the config updater"
            )
            .expect("failed to register rpc_batches_sent_total"),

            batch_failures: register_int_counter!(
                "polylang_agent_rpc_batch_failures_total",
                "Batches dropped after reconnect and retry"
            )
            .expect("failed to register rpc_batch_failures_total"),

            results_sent: register_int_counter!(
                "polylang_agent_results_sent_total",
                "Individual container results delivered upstream"
            )
            .expect("failed to register results_sent_total"),

            queue_depth: register_int_gauge!(
                "polylang_agent_queue_depth",
                "Results waiting in the upstream queue batch"
            )
            .expect("failed to register queue_depth"),

            workloads_tracked: register_int_gauge!(
                "polylang_agent_workloads_tracked",
                "Workloads currently held in the cache"
            )
            .expect("failed to register workloads_tracked"),
        }
    }
}

/// Lightweight handle to the process-global metrics.
#[derive(Clone)]
pub struct AgentMetrics {
    _private: (),
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AgentMetricsInner {
        GLOBAL_METRICS.get().expect("metrics not initialized")
    }

    pub fn inc_pods_scanned(&self) {
        self.inner().pods_scanned.inc();
    }

    pub fn inc_detection(&self, language: Language, confidence: Confidence) {
        self.inner()
            .detections
            .with_label_values(&[language.as_str(), confidence.as_str()])
            .inc();
    }

    pub fn inc_detection_conflict(&self) {
        self.inner().detection_conflicts.inc();
    }

    pub fn inc_cache_hit(&self) {
        self.inner().cache_hits.inc();
    }

    pub fn inc_cache_miss(&self) {
        self.inner().cache_misses.inc();
    }

    pub fn inc_batch_sent(&self, results: usize) {
        self.inner().batches_sent.inc();
        self.inner().results_sent.inc_by(results as u64);
    }

    pub fn inc_batch_failure(&self) {
        self.inner().batch_failures.inc();
    }

    pub fn set_queue_depth(&self, depth: i64) {
        self.inner().queue_depth.set(depth);
    }

    pub fn set_workloads_tracked(&self, count: i64) {
        self.inner().workloads_tracked.set(count);
    }
}

/// Structured logger for domain events.
#[derive(Clone, Default)]
pub struct DomainLogger;

impl DomainLogger {
    pub fn new() -> Self {
        Self
    }

    pub fn detection_started(&self, namespace: &str, pod: &str, container: &str) {
        debug!(
            event = "detection.started",
            namespace, pod, container, "Language detection initiated"
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub fn language_detected(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        image: &str,
        language: Language,
        framework: &str,
        confidence: Confidence,
    ) {
        if framework.is_empty() {
            info!(
                event = "detection.completed",
                namespace,
                pod,
                container,
                image,
                language = %language,
                confidence = %confidence,
                "Language successfully detected"
            );
        } else {
            info!(
                event = "detection.completed",
                namespace,
                pod,
                container,
                image,
                language = %language,
                framework,
                confidence = %confidence,
                "Language successfully detected"
            );
        }
    }

    pub fn detection_failed(&self, namespace: &str, pod: &str, container: &str, err: &str) {
        error!(
            event = "detection.failed",
            namespace, pod, container, error = err, "Language detection failed"
        );
    }

    pub fn unsupported_language(&self, language: Language) {
        warn!(
            event = "detection.unsupported",
            language = %language,
            "Language not supported for auto-instrumentation"
        );
    }

    pub fn cache_hit(&self, image: &str, language: Language) {
        debug!(event = "cache.hit", image, language = %language, "Using cached detection result");
    }

    pub fn cache_miss(&self, image: &str) {
        debug!(event = "cache.miss", image, "Performing new detection");
    }

    pub fn cache_stored(&self, image: &str, language: Language) {
        debug!(event = "cache.stored", image, language = %language, "Detection result cached");
    }

    pub fn batch_sent(&self, count: usize, reason: &str, reply: &str) {
        info!(
            event = "rpc.batch_sent",
            count, reason, reply, "Batch delivered to config updater"
        );
    }

    pub fn batch_failed(&self, count: usize, reason: &str, err: &str) {
        error!(
            event = "rpc.batch_failed",
            count, reason, error = err, "Batch delivery failed"
        );
    }

    pub fn workload_resolved(&self, namespace: &str, pod: &str, workload: &str, kind: &str) {
        debug!(
            event = "workload.resolved",
            namespace, pod, workload, kind, "Resolved owning workload"
        );
    }

    pub fn workload_resolve_failed(&self, namespace: &str, pod: &str, err: &str) {
        warn!(
            event = "workload.resolve_failed",
            namespace, pod, error = err, "Failed to resolve owning workload"
        );
    }

    pub fn application_starting(&self, version: &str) {
        info!(event = "app.starting", version, "polylang agent starting");
    }

    pub fn application_ready(&self) {
        info!(event = "app.ready", "polylang agent ready");
    }

    pub fn application_shutting_down(&self, reason: &str) {
        info!(event = "app.shutdown", reason, "polylang agent shutting down");
    }

    pub fn application_shutdown_complete(&self) {
        info!(event = "app.shutdown_complete", "polylang agent shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_handle_is_usable() {
        let metrics = AgentMetrics::new();
        metrics.inc_pods_scanned();
        metrics.inc_detection(Language::Go, Confidence::High);
        metrics.inc_cache_hit();
        metrics.inc_cache_miss();
        metrics.inc_batch_sent(5);
        metrics.inc_batch_failure();
        metrics.set_queue_depth(3);
        metrics.set_workloads_tracked(10);
    }
}
