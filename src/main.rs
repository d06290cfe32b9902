//! clawrouter binary: start the proxy and run until interrupted.
//!
//! Routing configuration is read from an optional TOML file passed as the
//! first argument; everything else comes from the environment
//! (`WALLET_KEY`, `PROXY_PORT`, `CLAWROUTER_DISABLED`).

use anyhow::Context;
use clawrouter::proxy::ProxyConfig;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    clawrouter::init_tracing();

    let mut config = ProxyConfig::from_env();
    if let Some(path) = std::env::args().nth(1) {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading routing config {path}"))?;
        config.routing =
            toml::from_str(&text).with_context(|| format!("parsing routing config {path}"))?;
    }

    let handle = clawrouter::start(config).await?;
    info!(
        url = handle.base_url(),
        wallet = handle.wallet_address(),
        "clawrouter ready"
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutting down");
    handle.close().await;

    Ok(())
}
