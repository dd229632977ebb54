use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rendezvous_relay::{serve, Cli, RelayConfig, RelayState};
use tokio::signal;
use tracing::info;

mod telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = telemetry::Telemetry::init()?;

    let cli = Cli::parse();
    let config = RelayConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        queue_depth = config.queue_depth,
        "starting rendezvous relay"
    );

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("websocket server started on {}", config.listen_addr);

    let state = Arc::new(RelayState::new(config, Some(telemetry.metrics_handle())));
    serve(listener, state, shutdown_signal()).await?;

    info!("relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
