//! Agent configuration
//!
//! Everything arrives through `KM_`-prefixed environment variables; each
//! field has a serde default so a bare deployment starts with sane
//! settings.

use agent_lib::sync::UpdaterClientConfig;
use agent_lib::NamespacePolicy;
use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Config-updater TCP endpoint (KM_CFG_UPDATER_RPC_ADDR).
    #[serde(default)]
    pub cfg_updater_rpc_addr: String,

    /// Comma-separated namespace deny-list (KM_IGNORED_NS).
    #[serde(default)]
    pub ignored_ns: String,

    /// Comma-separated namespace allow-list (KM_K8S_MONITORED_NAMESPACES);
    /// overrides the deny-list when non-empty.
    #[serde(default)]
    pub k8s_monitored_namespaces: String,

    /// Retained for backward compatibility; cache entries persist until
    /// workload deletion regardless of this value.
    #[serde(default)]
    pub cache_ttl_minutes: Option<u64>,

    /// Instrumentation CRD consulted for pre-instrumentation detection
    /// (KM_CRD_NAME).
    #[serde(default = "default_crd_name")]
    pub crd_name: String,

    /// Opt-in for the registry-pull image inspection fallback
    /// (KM_ENABLE_IMAGE_INSPECTION). Recognized but currently inactive.
    #[serde(default)]
    pub enable_image_inspection: bool,

    /// Port for the health and metrics API (KM_API_PORT).
    #[serde(default = "default_api_port")]
    pub api_port: u16,
}

fn default_crd_name() -> String {
    "km-agent-instrumentation-crd".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl AgentConfig {
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("KM").try_parsing(true))
            .build()
            .context("failed to read environment configuration")?;

        config
            .try_deserialize()
            .context("failed to deserialize agent configuration")
    }

    pub fn namespace_policy(&self) -> NamespacePolicy {
        NamespacePolicy::from_env_strings(&self.k8s_monitored_namespaces, &self.ignored_ns)
    }

    pub fn updater_config(&self) -> UpdaterClientConfig {
        UpdaterClientConfig::new(self.cfg_updater_rpc_addr.clone())
    }
}
