mod config;

use std::sync::Arc;

use batch_staging_local::{Janitor, StagingManager};
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    let staging = config.to_staging_config();
    let settings = config.to_janitor_settings();

    info!("Starting batch-staging-local janitor");
    info!("  Staging dir: {}", staging.directory.display());
    info!("  Cluster: {}", staging.cluster_enabled);
    info!("  TTL: {:?}", staging.ttl);
    info!("  Instance: {}", settings.instance_id);

    let manager = StagingManager::new(staging)?;
    let janitor = Arc::new(Janitor::new(manager, settings));

    if config.once {
        let sweeper = Arc::clone(&janitor);
        match tokio::task::spawn_blocking(move || sweeper.sweep_once()).await? {
            Some(stats) => println!("{}", serde_json::to_string_pretty(&stats)?),
            None => info!("Purge lock is held by another node, nothing done"),
        }
        return Ok(());
    }

    let shutdown_rx = create_shutdown_signal();
    janitor.run(shutdown_rx).await;

    info!("Janitor shutdown complete");
    Ok(())
}

/// Create a shutdown signal that triggers on Ctrl+C or SIGTERM.
fn create_shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            match signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C, initiating shutdown"),
                Err(e) => {
                    warn!("Failed to install Ctrl+C handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, initiating shutdown");
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        let _ = tx.send(true);
    });

    rx
}
