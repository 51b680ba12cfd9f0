use anyhow::{Context, Result};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use homewatch_bridge::config::load_config;
use homewatch_bridge::store::open_store;
use homewatch_bridge::{http, lifecycle, Bridge, BridgeStats, StartupError};

#[tokio::main]
async fn main() -> ExitCode {
    // .env is optional
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("homewatch_bridge=info")),
        )
        .init();

    match run().await {
        Ok(()) => {
            info!("bridge stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "homewatch bridge starting");

    let config = load_config()
        .await
        .map_err(StartupError::from)
        .context("Failed to load configuration")?;

    let store = open_store(&config.store)
        .await
        .map_err(StartupError::from)
        .context("Failed to open document store")?;

    let stats = BridgeStats::new();
    if let Some(address) = config.http.listen {
        http::spawn_health_server(address, stats.clone())
            .await
            .context("Failed to start health endpoint")?;
    }

    let bridge = Bridge::new(store, config.topics.clone(), stats);
    lifecycle::run(&config, &bridge, shutdown_signal())
        .await
        .context("Bridge terminated")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "cannot listen for ctrl-c");
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
                error!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}
