//! Relay server binary: parses configuration and runs the wiring in `relayd_server`
//! until a shutdown signal arrives.

use anyhow::{Context, Result};
use clap::Parser;
use relayd_server::ServerConfig;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::parse();
    init_logging(&config.log_level)?;

    info!(control_addr = %config.control_addr, domain = %config.domain, "starting relay server");

    let server = relayd_server::spawn(config).await?;

    signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("shutdown signal received, stopping");
    server.shutdown();

    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
