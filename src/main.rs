use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use allotter::cache::AvailabilityCache;
use allotter::config::Config;
use allotter::notify::NotifyHub;
use allotter::storage::{MemoryStorage, Storage};
use allotter::worker::{Coordinator, ExecutionLock};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    allotter::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let storage = Arc::new(MemoryStorage::open(
        &config.data_dir.join("allotter.wal"),
        config.compact_threshold,
    )?);

    let cache = Arc::new(AvailabilityCache::new());
    for resource in storage.load_resources().await? {
        let id = resource.id;
        if let Err(e) = cache.add_resource(resource).await {
            warn!(resource = %id, error = %e, "resource not cached");
        }
    }

    info!("allotter started");
    info!("  domain: {}", config.scheduler.domain.name);
    info!("  data_dir: {}", config.data_dir.display());
    info!("  resources: {}", cache.len().await);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let notifier = Arc::new(NotifyHub::new());
    let coordinator = Arc::new(Coordinator::new(
        storage,
        cache,
        notifier,
        ExecutionLock::new(),
        config.scheduler.clone(),
    ));

    let cancel = CancellationToken::new();
    let worker = {
        let coordinator = coordinator.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { coordinator.run(cancel).await })
    };

    // Stop on SIGTERM/ctrl-c. A running cycle finishes first.
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    info!("shutdown signal received, waiting for the running cycle");
    cancel.cancel();
    worker.await?;

    info!("allotter stopped");
    Ok(())
}
