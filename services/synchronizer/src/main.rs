//! Address-manager synchronizer binary.
//!
//! Seeds the in-memory store from the model file, then runs the orphan
//! policy and the sync worker until interrupted.

use std::sync::Arc;

use amsync_synchronizer::config::Config;
use amsync_synchronizer::model_file::ModelFile;
use amsync_synchronizer::onos::OnosClient;
use amsync_synchronizer::policy::PolicyRunner;
use amsync_synchronizer::{MemoryStore, SyncAddressManagerServiceInstance, SyncWorker};
use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to AMSYNC_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting address-manager synchronizer");
    info!(
        model_file = %config.model_file.display(),
        sync_interval_secs = config.sync_interval.as_secs(),
        http_timeout_secs = config.http_timeout.as_secs(),
        once = config.once,
        "Configuration loaded"
    );

    let (store, events) = MemoryStore::new(config.backoff);
    let store = Arc::new(store);

    let model = ModelFile::from_path(&config.model_file)?;
    model.seed(&store).await?;

    let mut policy = PolicyRunner::new(Arc::clone(&store), events);
    let onos = OnosClient::new(config.http_timeout).context("failed to build ONOS client")?;
    let step = SyncAddressManagerServiceInstance::new(Arc::clone(&store), onos);
    let worker = SyncWorker::new(step, Arc::clone(&store), config.sync_interval);

    if config.once {
        policy.drain().await;
        let report = worker.run_cycle().await;
        info!(complete = report.is_complete(), "Single cycle finished");
        return Ok(());
    }

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let policy_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { policy.run(shutdown_rx).await }
    });

    let mut worker_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { worker.run(shutdown_rx).await }
    });

    let mut worker_done = false;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut worker_handle => {
            worker_done = true;
            if let Err(e) = result {
                error!(error = %e, "Sync worker task panicked");
            }
        }
    }

    // Signal shutdown to all workers and let an in-flight cycle finish
    let _ = shutdown_tx.send(true);
    if !worker_done {
        if let Err(e) = worker_handle.await {
            error!(error = %e, "Sync worker task panicked");
        }
    }
    if let Err(e) = policy_handle.await {
        error!(error = %e, "Policy runner task panicked");
    }

    info!("Synchronizer shutdown complete");
    Ok(())
}
