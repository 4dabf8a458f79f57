//! Detection-result cache
//!
//! Two indices under one lock: an image-fingerprint index whose entries
//! never expire (content-addressed, so staleness is harmless) and a
//! workload index that mirrors live cluster state. Only the reconciler and
//! the lifecycle informer are allowed to remove workload entries. All
//! operations release the lock before callers do any network or disk I/O.

use std::collections::HashMap;

use parking_lot::RwLock;
use sha2::{Digest, Sha256};

use crate::models::{ContainerInfo, WorkloadKind};

/// Env vars that change which language runtime an image actually runs;
/// they participate in the image fingerprint.
const CRITICAL_ENV_VARS: [&str; 7] = [
    "JAVA_VERSION",
    "NODE_VERSION",
    "PYTHON_VERSION",
    "GO_VERSION",
    "RUBY_VERSION",
    "PHP_VERSION",
    "DOTNET_VERSION",
];

#[derive(Debug, Clone)]
struct CacheEntry {
    info: ContainerInfo,
}

/// Detection results for one workload, keyed by container name.
#[derive(Debug, Clone)]
pub struct WorkloadCacheEntry {
    pub namespace: String,
    pub workload_name: String,
    pub workload_kind: WorkloadKind,
    pub containers: HashMap<String, ContainerInfo>,
}

#[derive(Default)]
struct Indices {
    by_image: HashMap<String, CacheEntry>,
    by_workload: HashMap<String, WorkloadCacheEntry>,
}

#[derive(Default)]
pub struct DetectionCache {
    inner: RwLock<Indices>,
}

impl DetectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// SHA-256 over the image reference plus the critical env pairs.
    fn image_key(image: &str, env_vars: &HashMap<String, String>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(image.as_bytes());
        for key in CRITICAL_ENV_VARS {
            if let Some(value) = env_vars.get(key) {
                hasher.update(format!("{key}={value}").as_bytes());
            }
        }
        format!("{:x}", hasher.finalize())
    }

    fn workload_key(namespace: &str, workload_name: &str) -> String {
        format!("{namespace}/{workload_name}")
    }

    /// Look up a prior detection for this image/env fingerprint.
    pub fn get(&self, image: &str, env_vars: &HashMap<String, String>) -> Option<ContainerInfo> {
        let key = Self::image_key(image, env_vars);
        self.inner.read().by_image.get(&key).map(|e| e.info.clone())
    }

    /// Store a detection under the image fingerprint; overwrites.
    pub fn set(&self, image: &str, env_vars: &HashMap<String, String>, info: ContainerInfo) {
        let key = Self::image_key(image, env_vars);
        self.inner.write().by_image.insert(key, CacheEntry { info });
    }

    /// Replace a workload's full container map.
    pub fn set_workload(
        &self,
        namespace: &str,
        workload_name: &str,
        workload_kind: WorkloadKind,
        containers: HashMap<String, ContainerInfo>,
    ) {
        let key = Self::workload_key(namespace, workload_name);
        self.inner.write().by_workload.insert(
            key,
            WorkloadCacheEntry {
                namespace: namespace.to_string(),
                workload_name: workload_name.to_string(),
                workload_kind,
                containers,
            },
        );
    }

    /// Upsert a single container into its workload's entry.
    pub fn update_workload_container(
        &self,
        namespace: &str,
        workload_name: &str,
        workload_kind: WorkloadKind,
        info: ContainerInfo,
    ) {
        let key = Self::workload_key(namespace, workload_name);
        let mut inner = self.inner.write();
        let entry = inner.by_workload.entry(key).or_insert_with(|| WorkloadCacheEntry {
            namespace: namespace.to_string(),
            workload_name: workload_name.to_string(),
            workload_kind,
            containers: HashMap::new(),
        });
        entry.containers.insert(info.container_name.clone(), info);
    }

    pub fn get_workload(&self, namespace: &str, workload_name: &str) -> Option<WorkloadCacheEntry> {
        let key = Self::workload_key(namespace, workload_name);
        self.inner.read().by_workload.get(&key).cloned()
    }

    /// Drop a workload entirely. Reserved for the reconciler and the
    /// lifecycle informer.
    pub fn remove_workload(&self, namespace: &str, workload_name: &str) {
        let key = Self::workload_key(namespace, workload_name);
        self.inner.write().by_workload.remove(&key);
    }

    pub fn get_all_active_workloads(&self) -> Vec<WorkloadCacheEntry> {
        self.inner.read().by_workload.values().cloned().collect()
    }

    /// Every container across every tracked workload, flattened.
    pub fn get_all_active_containers(&self) -> Vec<ContainerInfo> {
        self.inner
            .read()
            .by_workload
            .values()
            .flat_map(|w| w.containers.values().cloned())
            .collect()
    }

    pub fn workload_count(&self) -> usize {
        self.inner.read().by_workload.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Confidence, Language};

    fn info(container: &str, language: Language) -> ContainerInfo {
        let mut i = ContainerInfo::pending("pod-1", "prod", container, "myorg/app:1.0");
        i.language = language;
        i.confidence = Confidence::High;
        i
    }

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn get_after_set_returns_value_until_overwrite() {
        let cache = DetectionCache::new();
        let e = env(&[]);

        assert!(cache.get("myorg/app:1.0", &e).is_none());

        cache.set("myorg/app:1.0", &e, info("srv", Language::Go));
        assert_eq!(cache.get("myorg/app:1.0", &e).unwrap().language, Language::Go);

        cache.set("myorg/app:1.0", &e, info("srv", Language::Python));
        assert_eq!(cache.get("myorg/app:1.0", &e).unwrap().language, Language::Python);
    }

    #[test]
    fn critical_env_vars_change_the_fingerprint() {
        let cache = DetectionCache::new();
        cache.set("python:slim", &env(&[]), info("a", Language::Python));

        // A different PYTHON_VERSION is a different fingerprint.
        assert!(cache
            .get("python:slim", &env(&[("PYTHON_VERSION", "3.12")]))
            .is_none());

        // Non-critical env vars do not participate.
        assert!(cache
            .get("python:slim", &env(&[("HOME", "/root")]))
            .is_some());
    }

    #[test]
    fn remove_workload_excludes_its_containers_from_flatten() {
        let cache = DetectionCache::new();
        cache.update_workload_container("prod", "web", WorkloadKind::Deployment, info("a", Language::Go));
        cache.update_workload_container("prod", "api", WorkloadKind::Deployment, info("b", Language::Java));

        assert_eq!(cache.get_all_active_containers().len(), 2);
        assert_eq!(cache.get_all_active_workloads().len(), 2);

        cache.remove_workload("prod", "web");

        let remaining = cache.get_all_active_containers();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].container_name, "b");
        assert!(cache.get_workload("prod", "web").is_none());
    }

    #[test]
    fn upsert_replaces_container_in_place() {
        let cache = DetectionCache::new();
        cache.update_workload_container("prod", "web", WorkloadKind::Deployment, info("a", Language::Go));
        cache.update_workload_container("prod", "web", WorkloadKind::Deployment, info("a", Language::Rust));

        let entry = cache.get_workload("prod", "web").unwrap();
        assert_eq!(entry.containers.len(), 1);
        assert_eq!(entry.containers["a"].language, Language::Rust);
        assert_eq!(entry.workload_kind, WorkloadKind::Deployment);
    }
}
