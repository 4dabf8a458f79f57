//! polylang agent
//!
//! Runs as a DaemonSet on each node: watches the cluster for running pods,
//! classifies their container processes through `/proc` and ELF analysis,
//! caches the results and ships them to the config updater so automatic
//! instrumentation can be applied.

use std::sync::Arc;

use agent_lib::health::components;
use agent_lib::proc::{PidLocator, ProcReader};
use agent_lib::scanner::{PodCoordinator, PodScanner, ScannerConfig};
use agent_lib::sync::UpdaterClient;
use agent_lib::{AgentMetrics, DetectionCache, DomainLogger, HealthRegistry};
use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;
mod kubeapi;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let logger = DomainLogger::new();
    logger.application_starting(AGENT_VERSION);

    let config = config::AgentConfig::load()?;
    if config.cfg_updater_rpc_addr.is_empty() {
        warn!("KM_CFG_UPDATER_RPC_ADDR is not set; upstream delivery will keep retrying");
    }
    if config.cache_ttl_minutes.is_some() {
        info!("KM_CACHE_TTL_MINUTES is deprecated; cache entries persist until workload deletion");
    }
    if config.enable_image_inspection {
        warn!("KM_ENABLE_IMAGE_INSPECTION is set but image inspection is not active in this build");
    }

    // Kubernetes client construction is the one failure that exits 1.
    let cluster = match kubeapi::KubeClient::connect().await {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!(error = %e, "Failed to construct Kubernetes client");
            std::process::exit(1);
        }
    };

    let metrics = AgentMetrics::new();
    let health_registry = HealthRegistry::new();
    health_registry.register(components::SCANNER).await;
    health_registry.register(components::RECONCILER).await;
    health_registry.register(components::UPDATER_CLIENT).await;

    let app_state = Arc::new(api::AppState::new(health_registry.clone()));
    tokio::spawn(api::serve(config.api_port, app_state));

    let cache = Arc::new(DetectionCache::new());
    let reader = ProcReader::discover();
    let locator = PidLocator::discover(reader.clone());

    let (updater, queue_tx) = UpdaterClient::new(
        config.updater_config(),
        Arc::clone(&cache),
        logger.clone(),
        metrics.clone(),
    );

    let coordinator = Arc::new(PodCoordinator::new(
        cluster.clone(),
        Arc::clone(&cache),
        reader,
        locator,
        queue_tx,
        config.crd_name.clone(),
        logger.clone(),
        metrics.clone(),
    ));

    let scanner = Arc::new(PodScanner::new(
        cluster,
        cache,
        coordinator,
        config.namespace_policy(),
        ScannerConfig::default(),
        metrics,
    ));

    let (shutdown_tx, _) = broadcast::channel(1);

    let mut handles = scanner
        .start(&shutdown_tx)
        .await
        .context("failed to start pod scanner")?;
    handles.push(tokio::spawn(updater.run(shutdown_tx.subscribe())));

    health_registry.set_ready(true).await;
    logger.application_ready();

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let reason = tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    };

    logger.application_shutting_down(reason);
    health_registry.set_ready(false).await;
    let _ = shutdown_tx.send(());

    // Barrier: scanner loops, reconciler and the updater drain must all
    // finish before shutdown is declared complete.
    for handle in handles {
        let _ = handle.await;
    }
    logger.application_shutdown_complete();
    Ok(())
}
