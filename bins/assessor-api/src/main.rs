mod error;
mod handlers;
mod metrics;
mod routes;
mod state;
mod telemetry;

use anyhow::{Context, Result};
use assessor_common::config::Config;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing();
    info!("Assessor API booting...");

    let config = Config::from_env().context("invalid configuration")?;
    let state = AppState::build(&config).await?;

    spawn_sweeper(state.clone(), config.sweep_interval);

    let app = routes::build_router(state);
    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    info!("Assessor API stopped");
    Ok(())
}

/// Periodically abandon attempts whose session went idle.
fn spawn_sweeper(state: Arc<AppState>, every: std::time::Duration) {
    tokio::spawn(async move {
        // interval() panics on a zero period
        let mut ticker = tokio::time::interval(every.max(std::time::Duration::from_secs(1)));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match state.grading.sweep_idle().await {
                Ok(0) => {}
                Ok(swept) => info!(swept, "idle attempts abandoned"),
                Err(e) => error!(error = %e, "idle sweep failed"),
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
