//! Minimal Kubernetes API client
//!
//! Read-only REST access implementing [`ClusterApi`]: list/get with field
//! selectors plus per-resource watch streams that feed the lifecycle
//! delete-event channel. In-cluster service-account configuration is
//! preferred; a kubeconfig fallback covers out-of-cluster runs.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use agent_lib::cluster::{
    ClusterApi, ContainerSpec, ContainerStatus, LifecycleEvent, OwnerRef, PodPhase, PodSnapshot,
};
use agent_lib::WorkloadKind;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const SERVICE_ACCOUNT_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const SERVICE_ACCOUNT_CA: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

const LIST_TIMEOUT: Duration = Duration::from_secs(30);
const WATCH_RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct KubeClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl KubeClient {
    /// Build a client from in-cluster service-account config, falling back
    /// to `KUBECONFIG` (or `~/.kube/config`). Failure here terminates the
    /// agent with exit code 1.
    pub async fn connect() -> Result<Self> {
        if Path::new(SERVICE_ACCOUNT_TOKEN).exists() {
            let client = Self::in_cluster().await?;
            info!(server = %client.base_url, "Using in-cluster Kubernetes configuration");
            return Ok(client);
        }

        warn!("No in-cluster config found, falling back to kubeconfig");
        let client = Self::from_kubeconfig().await?;
        info!(server = %client.base_url, "Using kubeconfig Kubernetes configuration");
        Ok(client)
    }

    async fn in_cluster() -> Result<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .context("KUBERNETES_SERVICE_HOST not set inside cluster")?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
        let token = tokio::fs::read_to_string(SERVICE_ACCOUNT_TOKEN)
            .await
            .context("failed to read service account token")?;

        let mut builder = reqwest::Client::builder().connect_timeout(Duration::from_secs(10));
        match tokio::fs::read(SERVICE_ACCOUNT_CA).await {
            Ok(ca) => {
                let cert = reqwest::Certificate::from_pem(&ca)
                    .context("invalid service account CA certificate")?;
                builder = builder.add_root_certificate(cert);
            }
            Err(_) => {
                warn!("Service account CA unreadable, accepting unverified API server certs");
                builder = builder.danger_accept_invalid_certs(true);
            }
        }

        Ok(Self {
            http: builder.build().context("failed to build HTTP client")?,
            base_url: format!("https://{host}:{port}"),
            token: Some(token.trim().to_string()),
        })
    }

    async fn from_kubeconfig() -> Result<Self> {
        let path = std::env::var("KUBECONFIG").unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_default();
            format!("{home}/.kube/config")
        });
        let raw = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read kubeconfig at {path}"))?;
        let kubeconfig: KubeConfigFile =
            serde_yaml::from_str(&raw).context("failed to parse kubeconfig")?;

        let server = kubeconfig
            .clusters
            .first()
            .map(|c| c.cluster.server.clone())
            .context("kubeconfig has no clusters")?;
        let token = kubeconfig
            .users
            .first()
            .and_then(|u| u.user.token.clone());

        // Client-certificate auth is not supported by this thin client;
        // server certs are accepted unverified for out-of-cluster use.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .danger_accept_invalid_certs(true)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url: server,
            token,
        })
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.http.get(format!("{}{path}", self.base_url));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        req
    }

    /// GET returning `Ok(None)` on 404.
    async fn get_optional<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let response = self
            .request(path)
            .timeout(LIST_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("GET {path} failed"))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            bail!("GET {path} returned {}", response.status());
        }
        Ok(Some(response.json().await.with_context(|| format!("GET {path}: bad body"))?))
    }

    fn workload_path(namespace: &str, kind: WorkloadKind, name: &str) -> Result<String> {
        let collection = match kind {
            WorkloadKind::Deployment => "deployments",
            WorkloadKind::DaemonSet => "daemonsets",
            WorkloadKind::StatefulSet => "statefulsets",
            WorkloadKind::ReplicaSet => "replicasets",
            WorkloadKind::Pod => bail!("pods are not a workload resource"),
        };
        Ok(format!("/apis/apps/v1/namespaces/{namespace}/{collection}/{name}"))
    }

    /// One watch stream: connect, forward DELETED events, reconnect on any
    /// failure. Ends when the event channel is closed.
    async fn watch_resource(
        self,
        path: String,
        kind: Option<WorkloadKind>,
        tx: mpsc::Sender<LifecycleEvent>,
    ) {
        loop {
            match self.watch_once(&path, kind, &tx).await {
                Ok(()) => return,
                Err(e) => {
                    debug!(path = %path, error = %e, "Watch stream interrupted, reconnecting");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(WATCH_RECONNECT_DELAY) => {}
                _ = tx.closed() => return,
            }
        }
    }

    async fn watch_once(
        &self,
        path: &str,
        kind: Option<WorkloadKind>,
        tx: &mpsc::Sender<LifecycleEvent>,
    ) -> Result<()> {
        let mut response = self
            .request(path)
            .query(&[("watch", "true")])
            .send()
            .await
            .context("watch connect failed")?;
        if !response.status().is_success() {
            bail!("watch returned {}", response.status());
        }

        let mut buffer = Vec::new();
        while let Some(chunk) = response.chunk().await.context("watch stream error")? {
            buffer.extend_from_slice(&chunk);
            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let Some(event) = parse_watch_line(&line[..line.len() - 1], kind) else {
                    continue;
                };
                if tx.send(event).await.is_err() {
                    // Receiver gone: the agent is shutting down.
                    return Ok(());
                }
            }
        }
        bail!("watch stream ended")
    }
}

#[async_trait]
impl ClusterApi for KubeClient {
    async fn list_running_pods(&self) -> Result<Vec<PodSnapshot>> {
        let response = self
            .request("/api/v1/pods")
            .query(&[("fieldSelector", "status.phase=Running")])
            .timeout(LIST_TIMEOUT)
            .send()
            .await
            .context("failed to list pods")?;
        if !response.status().is_success() {
            bail!("pod list returned {}", response.status());
        }
        let list: KubeList<KubePod> = response.json().await.context("bad pod list body")?;
        Ok(list.items.into_iter().map(pod_snapshot).collect())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<PodSnapshot>> {
        let pod: Option<KubePod> = self
            .get_optional(&format!("/api/v1/namespaces/{namespace}/pods/{name}"))
            .await?;
        Ok(pod.map(pod_snapshot))
    }

    async fn replica_set_owner(&self, namespace: &str, name: &str) -> Result<Option<OwnerRef>> {
        let rs: Option<KubeObject> = self
            .get_optional(&format!(
                "/apis/apps/v1/namespaces/{namespace}/replicasets/{name}"
            ))
            .await?;
        Ok(rs.and_then(|rs| controller_owner(&rs.metadata)))
    }

    async fn workload_exists(
        &self,
        namespace: &str,
        kind: WorkloadKind,
        name: &str,
    ) -> Result<bool> {
        let path = Self::workload_path(namespace, kind, name)?;
        let workload: Option<KubeObject> = self.get_optional(&path).await?;
        Ok(workload.is_some())
    }

    async fn workload_pod_annotations(
        &self,
        namespace: &str,
        kind: WorkloadKind,
        name: &str,
    ) -> Result<HashMap<String, String>> {
        let path = Self::workload_path(namespace, kind, name)?;
        let workload: Option<KubeWorkload> = self.get_optional(&path).await?;
        Ok(workload
            .and_then(|w| w.spec)
            .and_then(|s| s.template)
            .and_then(|t| t.metadata)
            .and_then(|m| m.annotations)
            .unwrap_or_default())
    }

    async fn subscribe_lifecycle(&self) -> Result<mpsc::Receiver<LifecycleEvent>> {
        let (tx, rx) = mpsc::channel(64);

        let watches: [(&str, Option<WorkloadKind>); 5] = [
            ("/api/v1/pods", None),
            ("/apis/apps/v1/deployments", Some(WorkloadKind::Deployment)),
            ("/apis/apps/v1/daemonsets", Some(WorkloadKind::DaemonSet)),
            ("/apis/apps/v1/replicasets", Some(WorkloadKind::ReplicaSet)),
            ("/apis/apps/v1/statefulsets", Some(WorkloadKind::StatefulSet)),
        ];
        for (path, kind) in watches {
            tokio::spawn(
                self.clone()
                    .watch_resource(path.to_string(), kind, tx.clone()),
            );
        }

        Ok(rx)
    }

    async fn wait_for_cache_sync(&self) -> Result<()> {
        let collections = [
            "/api/v1/pods",
            "/apis/apps/v1/deployments",
            "/apis/apps/v1/daemonsets",
            "/apis/apps/v1/replicasets",
            "/apis/apps/v1/statefulsets",
        ];
        for path in collections {
            let response = self
                .request(path)
                .query(&[("limit", "1")])
                .timeout(LIST_TIMEOUT)
                .send()
                .await
                .with_context(|| format!("initial list of {path} failed"))?;
            if !response.status().is_success() {
                bail!("initial list of {path} returned {}", response.status());
            }
        }
        Ok(())
    }
}

// Kubernetes wire types, reduced to the fields the agent reads.

#[derive(Debug, Deserialize)]
struct KubeList<T> {
    #[serde(default)]
    items: Vec<T>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KubeMetadata {
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    uid: String,
    #[serde(default)]
    annotations: Option<HashMap<String, String>>,
    #[serde(default)]
    owner_references: Vec<KubeOwnerRef>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KubeOwnerRef {
    kind: String,
    name: String,
    #[serde(default)]
    controller: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct KubeObject {
    metadata: KubeMetadata,
}

#[derive(Debug, Deserialize)]
struct KubeWorkload {
    #[serde(default)]
    spec: Option<KubeWorkloadSpec>,
}

#[derive(Debug, Deserialize)]
struct KubeWorkloadSpec {
    #[serde(default)]
    template: Option<KubePodTemplate>,
}

#[derive(Debug, Deserialize)]
struct KubePodTemplate {
    #[serde(default)]
    metadata: Option<KubeMetadata>,
}

#[derive(Debug, Default, Deserialize)]
struct KubePod {
    metadata: KubeMetadata,
    #[serde(default)]
    spec: Option<KubePodSpec>,
    #[serde(default)]
    status: Option<KubePodStatus>,
}

#[derive(Debug, Deserialize)]
struct KubePodSpec {
    #[serde(default)]
    containers: Vec<KubeContainer>,
}

#[derive(Debug, Deserialize)]
struct KubeContainer {
    name: String,
    #[serde(default)]
    image: String,
    #[serde(default)]
    env: Vec<KubeEnvVar>,
    #[serde(default)]
    command: Vec<String>,
    #[serde(default)]
    args: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct KubeEnvVar {
    name: String,
    #[serde(default)]
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KubePodStatus {
    #[serde(default)]
    phase: String,
    #[serde(default)]
    container_statuses: Vec<KubeContainerStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KubeContainerStatus {
    name: String,
    #[serde(default)]
    container_id: String,
}

#[derive(Debug, Deserialize)]
struct KubeWatchEvent {
    #[serde(rename = "type")]
    event_type: String,
    object: KubeObject,
}

fn controller_owner(metadata: &KubeMetadata) -> Option<OwnerRef> {
    metadata
        .owner_references
        .iter()
        .find(|o| o.controller.unwrap_or(false))
        .or_else(|| metadata.owner_references.first())
        .map(|o| OwnerRef {
            kind: o.kind.clone(),
            name: o.name.clone(),
        })
}

fn pod_snapshot(pod: KubePod) -> PodSnapshot {
    let owner = controller_owner(&pod.metadata);
    let status = pod.status.unwrap_or_else(|| KubePodStatus {
        phase: String::new(),
        container_statuses: Vec::new(),
    });

    let containers = pod
        .spec
        .map(|s| s.containers)
        .unwrap_or_default()
        .into_iter()
        .map(|c| {
            // Only literal values participate; valueFrom references are
            // unresolvable without extra lookups and are skipped.
            let env = c
                .env
                .into_iter()
                .filter_map(|e| e.value.map(|v| (e.name, v)))
                .filter(|(_, v)| !v.is_empty())
                .collect();
            let mut command = c.command;
            command.extend(c.args);
            ContainerSpec {
                name: c.name,
                image: c.image,
                env,
                command,
            }
        })
        .collect();

    let statuses = status
        .container_statuses
        .into_iter()
        .map(|s| ContainerStatus {
            name: s.name,
            container_id: s.container_id,
        })
        .collect();

    PodSnapshot {
        name: pod.metadata.name,
        namespace: pod.metadata.namespace,
        uid: pod.metadata.uid,
        phase: PodPhase::parse(&status.phase),
        owner,
        containers,
        statuses,
    }
}

/// Parse one watch-stream line; only DELETED events become lifecycle
/// events, everything else (ADDED, MODIFIED, BOOKMARK, parse noise) is
/// dropped.
fn parse_watch_line(line: &[u8], kind: Option<WorkloadKind>) -> Option<LifecycleEvent> {
    if line.is_empty() {
        return None;
    }
    let event: KubeWatchEvent = serde_json::from_slice(line).ok()?;
    if event.event_type != "DELETED" {
        return None;
    }
    let metadata = event.object.metadata;
    Some(match kind {
        None => LifecycleEvent::PodDeleted {
            namespace: metadata.namespace,
            name: metadata.name,
        },
        Some(kind) => LifecycleEvent::WorkloadDeleted {
            namespace: metadata.namespace,
            name: metadata.name,
            kind,
        },
    })
}


// Minimal kubeconfig shape for the out-of-cluster fallback.

#[derive(Debug, Deserialize)]
struct KubeConfigFile {
    #[serde(default)]
    clusters: Vec<KubeConfigCluster>,
    #[serde(default)]
    users: Vec<KubeConfigUser>,
}

#[derive(Debug, Deserialize)]
struct KubeConfigCluster {
    cluster: KubeConfigClusterDetail,
}

#[derive(Debug, Deserialize)]
struct KubeConfigClusterDetail {
    server: String,
}

#[derive(Debug, Deserialize)]
struct KubeConfigUser {
    user: KubeConfigUserDetail,
}

#[derive(Debug, Default, Deserialize)]
struct KubeConfigUserDetail {
    #[serde(default)]
    token: Option<String>,
}
