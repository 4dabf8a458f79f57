//! Container to host-PID resolution
//!
//! Two strategies, tried in order: probe known cgroup layouts for the
//! container's `cgroup.procs` (needs the container ID), then fall back to
//! scanning every process's cgroup file for the pod UID. Cgroup paths vary
//! wildly across platforms (GKE, EKS, AKS, on-prem docker/containerd/CRI-O,
//! cgroup v1 and v2), hence the breadth of the pattern table.

use std::path::PathBuf;

use anyhow::{bail, Result};
use tokio::fs;
use tracing::debug;

use super::ProcReader;

#[derive(Debug, Clone)]
pub struct PidLocator {
    reader: ProcReader,
    cgroup_root: PathBuf,
}

impl PidLocator {
    pub fn new(reader: ProcReader, cgroup_root: impl Into<PathBuf>) -> Self {
        Self {
            reader,
            cgroup_root: cgroup_root.into(),
        }
    }

    pub fn discover(reader: ProcReader) -> Self {
        Self::new(reader, "/sys/fs/cgroup")
    }

    /// All host PIDs belonging to `(pod_uid, container_name)`. Uses the
    /// cgroup-glob strategy when the container ID is known, the pod-UID scan
    /// otherwise or when the globs come up empty.
    pub async fn locate(
        &self,
        pod_uid: &str,
        container_name: &str,
        container_id: Option<&str>,
    ) -> Vec<i32> {
        if let Some(id) = container_id {
            match self.pids_for_container(id).await {
                Ok(pids) if !pids.is_empty() => return pids,
                Ok(_) => {}
                Err(e) => debug!(container_id = id, error = %e, "cgroup glob search failed"),
            }
        }
        self.pids_for_pod(pod_uid, container_name).await
    }

    /// Cgroup-glob strategy: the first pattern whose `cgroup.procs` is
    /// non-empty is authoritative.
    pub async fn pids_for_container(&self, container_id: &str) -> Result<Vec<i32>> {
        if container_id.is_empty() {
            bail!("container ID is empty");
        }

        let short_id = if container_id.len() > 12 {
            &container_id[..12]
        } else {
            container_id
        };

        let mut tried = 0usize;
        for pattern in self.cgroup_patterns(container_id, short_id) {
            let matches = match glob::glob(&pattern) {
                Ok(paths) => paths,
                Err(_) => continue,
            };

            for entry in matches.flatten() {
                tried += 1;
                let Ok(content) = fs::read_to_string(&entry).await else {
                    continue;
                };
                let pids: Vec<i32> = content.lines().filter_map(|l| l.trim().parse().ok()).collect();
                if !pids.is_empty() {
                    debug!(
                        container_id = short_id,
                        cgroup = %entry.display(),
                        count = pids.len(),
                        "Resolved container PIDs from cgroup"
                    );
                    return Ok(pids);
                }
            }
        }

        bail!("no PIDs found for container {container_id} (probed {tried} cgroup files)")
    }

    /// Mountinfo/cgroup-scan strategy: accept any process whose cgroup line
    /// carries the pod UID (dashed or underscored form) and is not a pause
    /// container. Container-name filtering is unreliable across platforms,
    /// so sibling-container PIDs may be returned; callers tolerate that
    /// because the first language match wins.
    pub async fn pids_for_pod(&self, pod_uid: &str, _container_name: &str) -> Vec<i32> {
        let all_pids = match self.reader.enumerate_pids().await {
            Ok(pids) => pids,
            Err(e) => {
                debug!(error = %e, "failed to enumerate processes");
                return Vec::new();
            }
        };

        let uid_dashed = pod_uid.to_string();
        let uid_underscored = pod_uid.replace('-', "_");

        let mut matching = Vec::new();
        for pid in all_pids {
            // The process may vanish between enumeration and read.
            let cgroup = self.reader.read_cgroup(pid).await;
            if cgroup.is_empty() {
                continue;
            }
            if cgroup_matches_pod(&cgroup, &uid_dashed, &uid_underscored) {
                matching.push(pid);
            }
        }

        debug!(pod_uid, count = matching.len(), "Pod UID cgroup scan complete");
        matching
    }

    /// Prioritized cgroup.procs probe patterns: cgroup v2 unified layouts
    /// first (modern containerd with QoS slices), then v1 legacy layouts.
    fn cgroup_patterns(&self, full_id: &str, short_id: &str) -> Vec<String> {
        let root = self.cgroup_root.display();
        let mut patterns = Vec::new();

        for id in [full_id, short_id] {
            patterns.extend([
                // cgroup v2, containerd with QoS classes
                format!("{root}/kubepods.slice/kubepods-burstable.slice/kubepods-burstable-pod*.slice/cri-containerd-{id}.scope/cgroup.procs"),
                format!("{root}/kubepods.slice/kubepods-besteffort.slice/kubepods-besteffort-pod*.slice/cri-containerd-{id}.scope/cgroup.procs"),
                format!("{root}/kubepods.slice/kubepods-pod*.slice/cri-containerd-{id}.scope/cgroup.procs"),
                format!("{root}/kubepods.slice/kubepods-*.slice/kubepods-*-pod*.slice/cri-containerd-{id}.scope/cgroup.procs"),
                format!("{root}/system.slice/containerd.service/kubepods-*.slice/kubepods-*-pod*.slice/cri-containerd-{id}.scope/cgroup.procs"),
                format!("{root}/kubepods.slice/*/*/cri-containerd-{id}.scope/cgroup.procs"),
                // cgroup v2, docker
                format!("{root}/kubepods.slice/kubepods-burstable.slice/kubepods-burstable-pod*.slice/docker-{id}.scope/cgroup.procs"),
                format!("{root}/kubepods.slice/kubepods-besteffort.slice/kubepods-besteffort-pod*.slice/docker-{id}.scope/cgroup.procs"),
                format!("{root}/kubepods.slice/kubepods-pod*.slice/docker-{id}.scope/cgroup.procs"),
                format!("{root}/kubepods.slice/kubepods-*.slice/kubepods-*-pod*.slice/docker-{id}.scope/cgroup.procs"),
                // cgroup v2, CRI-O
                format!("{root}/kubepods.slice/kubepods-burstable.slice/kubepods-burstable-pod*.slice/crio-{id}.scope/cgroup.procs"),
                format!("{root}/kubepods.slice/kubepods-besteffort.slice/kubepods-besteffort-pod*.slice/crio-{id}.scope/cgroup.procs"),
                format!("{root}/kubepods.slice/kubepods-pod*.slice/crio-{id}.scope/cgroup.procs"),
                format!("{root}/kubepods.slice/kubepods-*.slice/kubepods-*-pod*.slice/crio-{id}.scope/cgroup.procs"),
                // cgroup v1 legacy
                format!("{root}/system.slice/docker-{id}.scope/cgroup.procs"),
                format!("{root}/kubepods/pod*/docker-{id}/cgroup.procs"),
                format!("{root}/kubepods/pod*/{id}/cgroup.procs"),
                format!("{root}/system.slice/cri-containerd-{id}.scope/cgroup.procs"),
                format!("{root}/system.slice/crio-{id}.scope/cgroup.procs"),
            ]);
        }

        patterns
    }
}

/// True if any cgroup line carries the pod UID and is not a pause-container
/// path.
fn cgroup_matches_pod(cgroup_text: &str, uid_dashed: &str, uid_underscored: &str) -> bool {
    for line in cgroup_text.lines() {
        if !(line.contains(uid_dashed) || line.contains(uid_underscored)) {
            continue;
        }
        let lower = line.to_lowercase();
        if lower.contains("/pause") || lower.contains("/pod.slice") {
            continue;
        }
        return true;
    }
    false
}
