use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bastion_core::config::BastionConfig;
use bastion_services::{ServerIdentity, TracingSink};
use bastiond::Server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config_path = BastionConfig::write_default_if_missing().context("initializing config")?;
    info!(path = %config_path.display(), "config file");
    let config = BastionConfig::load().context("loading config")?;

    let identity = ServerIdentity::load(
        &config.keys.server_private_key,
        &config.keys.server_public_key,
    )
    .context("loading server identity keys")?;

    let handle = Server::start(config, identity, Arc::new(TracingSink)).await?;
    info!(addr = %handle.local_addr(), "listening");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutting down");
    handle.shutdown().await;
    Ok(())
}
