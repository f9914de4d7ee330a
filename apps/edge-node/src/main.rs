//! # AgriLink Edge Node
//!
//! Runs the durable sync pipeline on a farm edge node.
//!
//! ## Startup
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Edge Node Startup                                │
//! │                                                                         │
//! │  1. tracing (RUST_LOG, default info)                                   │
//! │  2. EdgeConfig::load(path)  defaults → edge.toml → AGRILINK_* env      │
//! │  3. Database::new()         WAL, migrations                            │
//! │  4. EdgeAgent::start()      forwarder recovers in-flight, gateway up   │
//! │  5. Ctrl+C / SIGTERM        gateway stops, forwarder finishes cycle    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Usage: `edge-node [path/to/edge.toml]`

use std::path::PathBuf;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use agrilink_db::Database;
use agrilink_sync::{EdgeAgent, EdgeConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting AgriLink edge node");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = EdgeConfig::load(config_path).context("Failed to load edge configuration")?;
    info!(
        node_id = %config.node.id,
        database = %config.database_path().display(),
        devices = config.devices.len(),
        "Configuration loaded"
    );

    if let Some(parent) = config.database_path().parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    let db = Database::new(config.db_config())
        .await
        .context("Failed to open outbox database")?;

    let mut agent = EdgeAgent::new(config, db.clone())?;
    agent.start().await?;

    shutdown_signal().await;

    agent.shutdown().await?;
    db.close().await;

    info!("Edge node shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(?e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(?e, "Failed to install SIGTERM handler");
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

    info!("Shutdown signal received, starting graceful shutdown...");
}
