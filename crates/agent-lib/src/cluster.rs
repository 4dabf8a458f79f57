//! Cluster access interface
//!
//! The agent only ever reads cluster state. Everything it needs is behind
//! [`ClusterApi`] so the Kubernetes client stays at the binary's edge and
//! the detection pipeline can be exercised against a fake cluster in tests.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::models::{WorkloadKind, STANDALONE_POD};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn parse(phase: &str) -> Self {
        match phase {
            "Pending" => PodPhase::Pending,
            "Running" => PodPhase::Running,
            "Succeeded" => PodPhase::Succeeded,
            "Failed" => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }
}

/// Controller owner reference as reported by the API server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerRef {
    pub kind: String,
    pub name: String,
}

/// One container from the pod spec, with value-only env vars.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: HashMap<String, String>,
    pub command: Vec<String>,
}

/// One container status entry; `container_id` keeps the runtime prefix
/// (`containerd://…`) exactly as the API server reports it.
#[derive(Debug, Clone)]
pub struct ContainerStatus {
    pub name: String,
    pub container_id: String,
}

/// The slice of a Pod object the detector needs.
#[derive(Debug, Clone)]
pub struct PodSnapshot {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub phase: PodPhase,
    pub owner: Option<OwnerRef>,
    pub containers: Vec<ContainerSpec>,
    pub statuses: Vec<ContainerStatus>,
}

impl PodSnapshot {
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Container ID for a named container with the `runtime://` prefix
    /// stripped. The full 64-hex form is kept; the PID locator derives the
    /// 12-char short form where cgroup layouts use it.
    pub fn container_id(&self, container_name: &str) -> Option<String> {
        self.statuses
            .iter()
            .find(|s| s.name == container_name && !s.container_id.is_empty())
            .and_then(|s| {
                let id = s.container_id.split("://").nth(1)?;
                if id.is_empty() {
                    return None;
                }
                Some(id.to_string())
            })
    }
}

/// Delete notifications from the watch streams. Only deletions matter to
/// the agent; everything else is picked up by the periodic scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    PodDeleted {
        namespace: String,
        name: String,
    },
    WorkloadDeleted {
        namespace: String,
        name: String,
        kind: WorkloadKind,
    },
}

/// Read-only cluster operations. Implemented over the Kubernetes API by the
/// binary; over fixtures in tests.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// All pods in phase Running, cluster-wide.
    async fn list_running_pods(&self) -> Result<Vec<PodSnapshot>>;

    /// `Ok(None)` means the pod does not exist; `Err` means the API call
    /// itself failed and nothing can be concluded.
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<PodSnapshot>>;

    /// Controller owner of a ReplicaSet, for resolving up to a Deployment.
    async fn replica_set_owner(&self, namespace: &str, name: &str) -> Result<Option<OwnerRef>>;

    /// Whether the named workload currently exists. `Err` means unknown.
    async fn workload_exists(
        &self,
        namespace: &str,
        kind: WorkloadKind,
        name: &str,
    ) -> Result<bool>;

    /// Pod-template annotations of the named workload, empty when absent.
    async fn workload_pod_annotations(
        &self,
        namespace: &str,
        kind: WorkloadKind,
        name: &str,
    ) -> Result<HashMap<String, String>>;

    /// Subscribe to delete events for pods and workloads.
    async fn subscribe_lifecycle(&self) -> Result<mpsc::Receiver<LifecycleEvent>>;

    /// Block until the watch caches have performed their initial sync.
    /// Failure here is fatal to the detector's start.
    async fn wait_for_cache_sync(&self) -> Result<()>;
}

/// Resolve the workload that owns a pod: the controller owner, with
/// ReplicaSets followed one level up to their Deployment. Ownerless pods
/// are reported as standalone.
pub async fn resolve_workload(
    api: &dyn ClusterApi,
    pod: &PodSnapshot,
) -> Result<(String, WorkloadKind)> {
    let Some(owner) = &pod.owner else {
        return Ok((STANDALONE_POD.to_string(), WorkloadKind::Pod));
    };

    let kind = WorkloadKind::parse(&owner.kind).unwrap_or(WorkloadKind::Pod);
    if kind != WorkloadKind::ReplicaSet {
        return Ok((owner.name.clone(), kind));
    }

    match api.replica_set_owner(&pod.namespace, &owner.name).await? {
        Some(rs_owner) => {
            let kind = WorkloadKind::parse(&rs_owner.kind).unwrap_or(WorkloadKind::Deployment);
            Ok((rs_owner.name, kind))
        }
        // The ReplicaSet is a top-level owner.
        None => Ok((owner.name.clone(), WorkloadKind::ReplicaSet)),
    }
}

/// Whether the workload's pod template already opts into instrumentation,
/// either generically or through this agent's CRD.
pub fn is_instrumented(
    annotations: &HashMap<String, String>,
    namespace: &str,
    crd_name: &str,
) -> bool {
    let crd_ref = format!("{namespace}/{crd_name}");
    annotations.iter().any(|(key, value)| {
        key.starts_with("instrumentation.opentelemetry.io/inject-")
            && (!value.starts_with("false") || value.starts_with(&crd_ref))
    })
}
