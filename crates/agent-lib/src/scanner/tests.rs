//! Scanner and coordinator tests against a mock cluster and fake proc and
//! cgroup roots.

use std::collections::HashMap;
use std::os::unix::fs::symlink;
use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;
use tokio::sync::mpsc;

use super::*;
use crate::cache::DetectionCache;
use crate::cluster::mock::MockCluster;
use crate::cluster::{ContainerSpec, ContainerStatus, OwnerRef, PodPhase, PodSnapshot};
use crate::models::{Confidence, ContainerInfo, Language, WorkloadKind};
use crate::observability::{AgentMetrics, DomainLogger};
use crate::proc::{PidLocator, ProcReader};

const FULL_ID: &str = "a1b2c3d4e5f60718293a4b5c6d7e8f90a1b2c3d4e5f60718293a4b5c6d7e8f90";
const POD_UID: &str = "8eb9b7bf-0432-40ad-ba5e-34a9fa74501a";

struct Harness {
    cluster: Arc<MockCluster>,
    cache: Arc<DetectionCache>,
    coordinator: Arc<PodCoordinator>,
    queue_rx: mpsc::Receiver<ContainerInfo>,
    proc_dir: TempDir,
    cgroup_dir: TempDir,
}

fn harness() -> Harness {
    let proc_dir = TempDir::new().unwrap();
    let cgroup_dir = TempDir::new().unwrap();
    let cluster = Arc::new(MockCluster::new());
    let cache = Arc::new(DetectionCache::new());
    let reader = ProcReader::new(proc_dir.path());
    let locator = PidLocator::new(reader.clone(), cgroup_dir.path());
    let (queue_tx, queue_rx) = mpsc::channel(16);

    let coordinator = Arc::new(PodCoordinator::new(
        Arc::clone(&cluster) as Arc<dyn crate::cluster::ClusterApi>,
        Arc::clone(&cache),
        reader,
        locator,
        queue_tx,
        "km-agent-instrumentation-crd",
        DomainLogger::new(),
        AgentMetrics::new(),
    ));

    Harness {
        cluster,
        cache,
        coordinator,
        queue_rx,
        proc_dir,
        cgroup_dir,
    }
}

fn write_proc_entry(
    root: &Path,
    pid: i32,
    exe_name: Option<&str>,
    cmdline: &str,
    env: &[(&str, &str)],
    cgroup: &str,
) {
    let dir = root.join(pid.to_string());
    std::fs::create_dir_all(&dir).unwrap();
    let null_cmdline = cmdline.replace(' ', "\0");
    std::fs::write(dir.join("cmdline"), format!("{null_cmdline}\0")).unwrap();
    let environ: String = env.iter().map(|(k, v)| format!("{k}={v}\0")).collect();
    std::fs::write(dir.join("environ"), environ).unwrap();
    std::fs::write(dir.join("status"), "Name:\tapp\nPPid:\t1\n").unwrap();
    std::fs::write(dir.join("cgroup"), cgroup).unwrap();
    if let Some(name) = exe_name {
        let bin = root.join("bin").join(name);
        std::fs::create_dir_all(bin.parent().unwrap()).unwrap();
        std::fs::write(&bin, b"#!").unwrap();
        symlink(&bin, dir.join("exe")).unwrap();
    }
}

fn write_container_cgroup(root: &Path, pids: &[i32]) {
    let scope = root.join(format!(
        "kubepods.slice/kubepods-besteffort.slice/kubepods-besteffort-pod8eb9b7bf_0432_40ad_ba5e_34a9fa74501a.slice/cri-containerd-{FULL_ID}.scope"
    ));
    std::fs::create_dir_all(&scope).unwrap();
    let content: String = pids.iter().map(|p| format!("{p}\n")).collect();
    std::fs::write(scope.join("cgroup.procs"), content).unwrap();
}

fn running_pod(name: &str, env: &[(&str, &str)], with_status: bool) -> PodSnapshot {
    PodSnapshot {
        name: name.to_string(),
        namespace: "prod".to_string(),
        uid: POD_UID.to_string(),
        phase: PodPhase::Running,
        owner: Some(OwnerRef {
            kind: "ReplicaSet".into(),
            name: format!("{name}-rs"),
        }),
        containers: vec![ContainerSpec {
            name: "srv".into(),
            image: "myorg/api:1.2".into(),
            env: env.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            command: vec![],
        }],
        statuses: if with_status {
            vec![ContainerStatus {
                name: "srv".into(),
                container_id: format!("containerd://{FULL_ID}"),
            }]
        } else {
            vec![]
        },
    }
}

fn link_to_deployment(cluster: &MockCluster, pod_name: &str, deployment: &str) {
    cluster.replica_set_owners.lock().insert(
        format!("prod/{pod_name}-rs"),
        OwnerRef {
            kind: "Deployment".into(),
            name: deployment.to_string(),
        },
    );
    cluster.add_workload("prod", WorkloadKind::Deployment, deployment);
}

#[tokio::test]
async fn cache_miss_detects_language_and_populates_both_indices() {
    let mut h = harness();
    let pod = running_pod("api-7f-abc", &[("PYTHON_VERSION", "3.11.5")], true);
    link_to_deployment(&h.cluster, "api-7f-abc", "api");
    h.cluster.add_pod(pod.clone());

    write_proc_entry(
        h.proc_dir.path(),
        1234,
        Some("python3"),
        "python3 manage.py runserver",
        &[("PYTHON_VERSION", "3.11.5")],
        &format!("0::/kubepods.slice/cri-containerd-{FULL_ID}.scope\n"),
    );
    write_container_cgroup(h.cgroup_dir.path(), &[1234]);

    let outcome = h.coordinator.detect_pod(&pod).await;
    assert!(outcome.complete);
    assert_eq!(outcome.results.len(), 1);

    let info = &outcome.results[0];
    assert_eq!(info.language, Language::Python);
    assert_eq!(info.confidence, Confidence::High);
    assert_eq!(info.framework, "Django");
    assert_eq!(info.deployment_name, "api");
    assert_eq!(info.kind, WorkloadKind::Deployment);
    assert!(info.evidence[0].contains("high confidence"));
    assert!(!info.process_commands.is_empty());

    // Forwarded upstream: Python is in the supported set.
    let queued = h.queue_rx.recv().await.unwrap();
    assert_eq!(queued.language, Language::Python);

    // Both indices populated.
    let env = pod.containers[0].env.clone();
    assert!(h.cache.get("myorg/api:1.2", &env).is_some());
    let workload = h.cache.get_workload("prod", "api").unwrap();
    assert!(workload.containers.contains_key("srv"));
}

#[tokio::test]
async fn cache_hit_is_restamped_and_forwarded_without_proc_access() {
    let mut h = harness();
    let pod = running_pod("api-7f-new", &[], false);
    link_to_deployment(&h.cluster, "api-7f-new", "api");
    h.cluster.add_pod(pod.clone());

    let mut cached = ContainerInfo::pending("api-7f-old", "prod", "srv", "myorg/api:1.2");
    cached.language = Language::Go;
    cached.confidence = Confidence::High;
    h.cache.set("myorg/api:1.2", &HashMap::new(), cached);

    let outcome = h.coordinator.detect_pod(&pod).await;
    assert!(outcome.complete);

    let info = &outcome.results[0];
    assert_eq!(info.language, Language::Go);
    assert_eq!(info.pod_name, "api-7f-new");
    assert_eq!(info.deployment_name, "api");

    let queued = h.queue_rx.recv().await.unwrap();
    assert_eq!(queued.pod_name, "api-7f-new");
}

#[tokio::test]
async fn empty_container_id_yields_unknown_low_without_crashing() {
    let mut h = harness();
    let pod = running_pod("orphan", &[], false);
    h.cluster.add_pod(pod.clone());

    // A sibling container's process shares the pod UID; without a container
    // ID it must not be attributed to this container.
    write_proc_entry(
        h.proc_dir.path(),
        5678,
        Some("python3"),
        "python3 sidecar.py",
        &[],
        "0::/kubepods-besteffort-pod8eb9b7bf_0432_40ad_ba5e_34a9fa74501a.slice/cri-containerd-fff.scope\n",
    );

    let outcome = h.coordinator.detect_pod(&pod).await;
    assert!(outcome.complete);

    let info = &outcome.results[0];
    assert_eq!(info.language, Language::Unknown);
    assert_eq!(info.confidence, Confidence::Low);

    // Unknown is cached so re-scans are cheap, but never forwarded.
    assert!(h.cache.get("myorg/api:1.2", &HashMap::new()).is_some());
    assert!(h.queue_rx.try_recv().is_err());
}

#[tokio::test]
async fn conflicting_processes_leave_container_unresolved_for_retry() {
    let mut h = harness();
    let pod = running_pod("confused", &[], true);
    h.cluster.add_pod(pod.clone());

    // A single process that trips both the Python and Node inspectors.
    write_proc_entry(
        h.proc_dir.path(),
        4321,
        Some("python3"),
        "python3 /app/node_modules/build.py",
        &[],
        &format!("0::/kubepods.slice/cri-containerd-{FULL_ID}.scope\n"),
    );
    write_container_cgroup(h.cgroup_dir.path(), &[4321]);

    let outcome = h.coordinator.detect_pod(&pod).await;
    assert!(!outcome.complete);
    assert!(outcome.results.is_empty());
    assert!(h.cache.get("myorg/api:1.2", &HashMap::new()).is_none());
    assert!(h.queue_rx.try_recv().is_err());
}

#[tokio::test]
async fn first_high_confidence_detection_wins_across_processes() {
    let h = harness();
    let pod = running_pod("multi", &[], true);
    h.cluster.add_pod(pod.clone());

    // One process with only a cmdline hint (stays unclassified) and one
    // high-confidence Python process; the high-confidence finding must win
    // regardless of PID enumeration order.
    write_proc_entry(
        h.proc_dir.path(),
        2001,
        Some("launcher"),
        "launcher --runtime openjdk",
        &[],
        &format!("0::/kubepods.slice/cri-containerd-{FULL_ID}.scope\n"),
    );
    write_proc_entry(
        h.proc_dir.path(),
        2002,
        Some("python3"),
        "python3 worker.py",
        &[],
        &format!("0::/kubepods.slice/cri-containerd-{FULL_ID}.scope\n"),
    );
    write_container_cgroup(h.cgroup_dir.path(), &[2001, 2002]);

    let outcome = h.coordinator.detect_pod(&pod).await;
    let info = &outcome.results[0];
    assert_eq!(info.language, Language::Python);
    assert_eq!(info.confidence, Confidence::High);
}

#[tokio::test]
async fn instrumented_workload_is_flagged_enabled() {
    let h = harness();
    let pod = running_pod("api-7f-abc", &[], false);
    link_to_deployment(&h.cluster, "api-7f-abc", "api");
    h.cluster.annotations.lock().insert(
        "prod/api".into(),
        HashMap::from([(
            "instrumentation.opentelemetry.io/inject-python".to_string(),
            "true".to_string(),
        )]),
    );
    h.cluster.add_pod(pod.clone());

    let outcome = h.coordinator.detect_pod(&pod).await;
    assert!(outcome.results[0].enabled);
}

fn scanner_with(h: &Harness, policy: NamespacePolicy) -> Arc<PodScanner> {
    Arc::new(PodScanner::new(
        Arc::clone(&h.cluster) as Arc<dyn crate::cluster::ClusterApi>,
        Arc::clone(&h.cache),
        Arc::clone(&h.coordinator),
        policy,
        ScannerConfig::default(),
        AgentMetrics::new(),
    ))
}

#[tokio::test]
async fn scan_skips_ignored_namespaces_and_gates_on_processed_set() {
    let h = harness();
    let mut ignored = running_pod("sys-pod", &[], false);
    ignored.namespace = "kube-system".into();
    h.cluster.add_pod(ignored);
    h.cluster.add_pod(running_pod("app-pod", &[], false));

    let scanner = scanner_with(&h, NamespacePolicy::from_env_strings("", "kube-system"));

    let handles = scanner.scan_running_pods().await;
    assert_eq!(handles.len(), 1);
    for handle in handles {
        handle.await.unwrap();
    }
    assert!(scanner.processed_set().contains_key("prod/app-pod"));
    assert!(!scanner.processed_set().contains_key("kube-system/sys-pod"));

    // Already-processed pods are not re-dispatched.
    assert!(scanner.scan_running_pods().await.is_empty());
}

#[tokio::test]
async fn incomplete_pod_is_released_for_retry() {
    let h = harness();
    let pod = running_pod("confused", &[], true);
    h.cluster.add_pod(pod.clone());
    write_proc_entry(
        h.proc_dir.path(),
        4321,
        Some("python3"),
        "python3 /app/node_modules/build.py",
        &[],
        &format!("0::/kubepods.slice/cri-containerd-{FULL_ID}.scope\n"),
    );
    write_container_cgroup(h.cgroup_dir.path(), &[4321]);

    let scanner = scanner_with(&h, NamespacePolicy::default());
    for handle in scanner.scan_running_pods().await {
        handle.await.unwrap();
    }
    assert!(!scanner.processed_set().contains_key("prod/confused"));
}

#[tokio::test]
async fn lifecycle_deletes_evict_cache_and_processed_entries() {
    let h = harness();
    let scanner = scanner_with(&h, NamespacePolicy::default());

    let mut info = ContainerInfo::pending("web-1", "prod", "srv", "img");
    info.language = Language::Go;
    h.cache
        .update_workload_container("prod", "web", WorkloadKind::Deployment, info);
    scanner.processed_set().insert("prod/web-1".into(), ());

    scanner.handle_lifecycle_event(crate::cluster::LifecycleEvent::WorkloadDeleted {
        namespace: "prod".into(),
        name: "web".into(),
        kind: WorkloadKind::Deployment,
    });
    assert!(h.cache.get_workload("prod", "web").is_none());
    assert!(h.cache.get_all_active_containers().is_empty());

    scanner.handle_lifecycle_event(crate::cluster::LifecycleEvent::PodDeleted {
        namespace: "prod".into(),
        name: "web-1".into(),
    });
    assert!(!scanner.processed_set().contains_key("prod/web-1"));
}

#[tokio::test]
async fn reconcile_evicts_missing_workloads_but_not_on_api_errors() {
    let h = harness();
    let scanner = scanner_with(&h, NamespacePolicy::default());

    let info = |c: &str| {
        let mut i = ContainerInfo::pending("p", "prod", c, "img");
        i.language = Language::Go;
        i
    };
    h.cache
        .update_workload_container("prod", "alive", WorkloadKind::Deployment, info("a"));
    h.cache
        .update_workload_container("prod", "gone", WorkloadKind::Deployment, info("b"));
    h.cluster.add_workload("prod", WorkloadKind::Deployment, "alive");

    scanner.reconcile().await;
    assert!(h.cache.get_workload("prod", "alive").is_some());
    assert!(h.cache.get_workload("prod", "gone").is_none());

    // API errors are fail-safe: nothing gets evicted.
    h.cluster.remove_workload("prod", WorkloadKind::Deployment, "alive");
    *h.cluster.fail_workload_lookups.lock() = true;
    scanner.reconcile().await;
    assert!(h.cache.get_workload("prod", "alive").is_some());
}

#[tokio::test]
async fn reconcile_drops_processed_entries_for_vanished_pods() {
    let h = harness();
    let scanner = scanner_with(&h, NamespacePolicy::default());
    h.cluster.add_pod(running_pod("alive", &[], false));

    scanner.processed_set().insert("prod/alive".into(), ());
    scanner.processed_set().insert("prod/vanished".into(), ());

    scanner.reconcile().await;
    assert!(scanner.processed_set().contains_key("prod/alive"));
    assert!(!scanner.processed_set().contains_key("prod/vanished"));
}
