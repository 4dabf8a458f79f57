//! Per-pod detection coordination
//!
//! Given a running pod: resolve the owning workload, consult the image
//! cache per container, and on a miss locate the container's processes and
//! drive the inspector pipeline over them. Results land in both cache
//! indices and, for supported languages, on the upstream queue.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::cache::DetectionCache;
use crate::cluster::{is_instrumented, resolve_workload, ClusterApi, ContainerSpec, PodSnapshot};
use crate::inspect::{DeepScan, LanguageDetector};
use crate::models::{
    Confidence, ContainerInfo, DetectionResult, Language, WorkloadKind, STANDALONE_POD,
};
use crate::observability::{AgentMetrics, DomainLogger};
use crate::proc::{ElfAnalyzer, PidLocator, ProcReader};

/// What one pod pass produced. `complete` is false when at least one
/// container got no result this cycle (detection conflicts) and the pod
/// should be retried on the next scan.
#[derive(Debug, Default)]
pub struct PodDetectionOutcome {
    pub results: Vec<ContainerInfo>,
    pub complete: bool,
}

pub struct PodCoordinator {
    cluster: Arc<dyn ClusterApi>,
    cache: Arc<DetectionCache>,
    reader: ProcReader,
    locator: PidLocator,
    detector: LanguageDetector,
    elf: ElfAnalyzer,
    queue: mpsc::Sender<ContainerInfo>,
    crd_name: String,
    logger: DomainLogger,
    metrics: AgentMetrics,
}

impl PodCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        cache: Arc<DetectionCache>,
        reader: ProcReader,
        locator: PidLocator,
        queue: mpsc::Sender<ContainerInfo>,
        crd_name: impl Into<String>,
        logger: DomainLogger,
        metrics: AgentMetrics,
    ) -> Self {
        Self {
            cluster,
            cache,
            reader,
            locator,
            detector: LanguageDetector::new(),
            elf: ElfAnalyzer::new(),
            queue,
            crd_name: crd_name.into(),
            logger,
            metrics,
        }
    }

    pub async fn detect_pod(&self, pod: &PodSnapshot) -> PodDetectionOutcome {
        let (workload_name, workload_kind) = match resolve_workload(self.cluster.as_ref(), pod).await
        {
            Ok(resolved) => {
                self.logger
                    .workload_resolved(&pod.namespace, &pod.name, &resolved.0, resolved.1.as_str());
                resolved
            }
            Err(e) => {
                self.logger
                    .workload_resolve_failed(&pod.namespace, &pod.name, &e.to_string());
                (STANDALONE_POD.to_string(), WorkloadKind::Pod)
            }
        };

        let enabled = self
            .workload_instrumented(pod, workload_kind, &workload_name)
            .await;

        let mut outcome = PodDetectionOutcome {
            results: Vec::new(),
            complete: true,
        };

        for container in &pod.containers {
            self.logger
                .detection_started(&pod.namespace, &pod.name, &container.name);

            if let Some(cached) = self.cache.get(&container.image, &container.env) {
                self.metrics.inc_cache_hit();
                self.logger.cache_hit(&container.image, cached.language);
                let info =
                    self.restamp(cached, pod, container, &workload_name, workload_kind, enabled);
                self.store_and_forward(info.clone(), &workload_name, workload_kind, false)
                    .await;
                outcome.results.push(info);
                continue;
            }

            self.metrics.inc_cache_miss();
            self.logger.cache_miss(&container.image);

            match self
                .detect_container(pod, container, &workload_name, workload_kind, enabled)
                .await
            {
                Some(info) => {
                    self.store_and_forward(info.clone(), &workload_name, workload_kind, true)
                        .await;
                    outcome.results.push(info);
                }
                None => outcome.complete = false,
            }
        }

        outcome
    }

    /// Whether the owning workload already opts into instrumentation.
    async fn workload_instrumented(
        &self,
        pod: &PodSnapshot,
        kind: WorkloadKind,
        name: &str,
    ) -> bool {
        if kind == WorkloadKind::Pod {
            return false;
        }
        match self
            .cluster
            .workload_pod_annotations(&pod.namespace, kind, name)
            .await
        {
            Ok(annotations) => is_instrumented(&annotations, &pod.namespace, &self.crd_name),
            Err(e) => {
                debug!(
                    namespace = %pod.namespace,
                    workload = name,
                    error = %e,
                    "Failed to read workload annotations"
                );
                false
            }
        }
    }

    /// Refresh a cached record with this pod's coordinates.
    fn restamp(
        &self,
        mut info: ContainerInfo,
        pod: &PodSnapshot,
        container: &ContainerSpec,
        workload_name: &str,
        workload_kind: WorkloadKind,
        enabled: bool,
    ) -> ContainerInfo {
        info.pod_name = pod.name.clone();
        info.namespace = pod.namespace.clone();
        info.container_name = container.name.clone();
        info.detected_at = Utc::now();
        info.deployment_name = workload_name.to_string();
        info.kind = workload_kind;
        info.enabled = enabled;
        info
    }

    /// Fresh detection for one container. `None` means every candidate
    /// process hit a language conflict, so the container gets no result
    /// this cycle.
    async fn detect_container(
        &self,
        pod: &PodSnapshot,
        container: &ContainerSpec,
        workload_name: &str,
        workload_kind: WorkloadKind,
        enabled: bool,
    ) -> Option<ContainerInfo> {
        let mut info = ContainerInfo::pending(&pod.name, &pod.namespace, &container.name, &container.image);
        info.env_vars = container.env.clone();
        info.deployment_name = workload_name.to_string();
        info.kind = workload_kind;
        info.enabled = enabled;

        // Without a container ID the pod-UID fallback scan could pick up a
        // sibling container's processes, so the container stays Unknown.
        let Some(container_id) = pod.container_id(&container.name) else {
            debug!(
                namespace = %pod.namespace,
                pod = %pod.name,
                container = %container.name,
                "Container ID not reported in pod status"
            );
            info.evidence = vec!["container ID not reported in pod status".to_string()];
            self.metrics.inc_detection(info.language, info.confidence);
            return Some(info);
        };

        let pids = self
            .locator
            .locate(&pod.uid, &container.name, Some(&container_id))
            .await;

        if pids.is_empty() {
            debug!(
                namespace = %pod.namespace,
                pod = %pod.name,
                container = %container.name,
                container_id = %container_id,
                "No processes found for container"
            );
            info.evidence = vec!["no processes found for container".to_string()];
            self.metrics.inc_detection(info.language, info.confidence);
            return Some(info);
        }

        let mut detections: Vec<DetectionResult> = Vec::new();
        let mut conflicts = 0usize;
        let mut commands = Vec::new();

        for pid in pids {
            // The process may have exited since it was located.
            let Ok(ctx) = self.reader.context(pid).await else {
                continue;
            };
            if !ctx.cmdline.is_empty() {
                commands.push(ctx.cmdline.clone());
            }

            let result = match self.detector.quick_detect(&ctx) {
                Ok(Some(result)) => Ok(result),
                Ok(None) => {
                    let maps = self.reader.read_maps(pid).await.ok();
                    let deep = DeepScan {
                        maps: maps.as_deref(),
                        elf: &self.elf,
                    };
                    self.detector.detect(&ctx, &deep)
                }
                Err(conflict) => Err(conflict),
            };

            match result {
                Ok(result) if result.language != Language::Unknown => detections.push(result),
                Ok(_) => {}
                Err(conflict) => {
                    conflicts += 1;
                    self.metrics.inc_detection_conflict();
                    warn!(
                        namespace = %pod.namespace,
                        pod = %pod.name,
                        container = %container.name,
                        pid,
                        error = %conflict,
                        "Language detection conflict"
                    );
                }
            }
        }

        info.process_commands = commands;

        if detections.is_empty() {
            if conflicts > 0 {
                self.logger.detection_failed(
                    &pod.namespace,
                    &pod.name,
                    &container.name,
                    "all candidate processes hit language conflicts",
                );
                return None;
            }
            info.evidence = vec!["no classifiable processes in container".to_string()];
            self.metrics.inc_detection(info.language, info.confidence);
            return Some(info);
        }

        // Prefer the first high-confidence detection, otherwise the first
        // non-Unknown one.
        let best = detections
            .iter()
            .find(|d| d.confidence == Confidence::High)
            .unwrap_or(&detections[0]);

        info.language = best.language;
        info.framework = best.framework.clone();
        info.confidence = best.confidence;
        info.evidence = vec![format!(
            "Detected via host proc inspection with {} confidence",
            best.confidence
        )];

        self.metrics.inc_detection(info.language, info.confidence);
        self.logger.language_detected(
            &pod.namespace,
            &pod.name,
            &container.name,
            &container.image,
            info.language,
            &info.framework,
            info.confidence,
        );

        Some(info)
    }

    /// Insert into both cache indices and forward supported languages.
    async fn store_and_forward(
        &self,
        info: ContainerInfo,
        workload_name: &str,
        workload_kind: WorkloadKind,
        store_image_index: bool,
    ) {
        if store_image_index {
            self.cache.set(&info.image, &info.env_vars, info.clone());
            self.logger.cache_stored(&info.image, info.language);
        }
        self.cache.update_workload_container(
            &info.namespace,
            workload_name,
            workload_kind,
            info.clone(),
        );

        if info.language.otel_supported() {
            // Bounded queue; a full queue applies back-pressure here.
            if self.queue.send(info).await.is_err() {
                warn!("Upstream queue closed, dropping detection result");
            }
        } else if info.language != Language::Unknown {
            self.logger.unsupported_language(info.language);
        }
    }
}
