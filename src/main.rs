//! dnsgate - Entry point.
//!
//! Brings up the TUN interface described in the configuration and filters
//! the DNS queries sent through it until Ctrl-C.

use std::borrow::Cow;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use dnsgate::config::{Config, ConfigFile};
use dnsgate::network::TunProvider;
use dnsgate::{SessionState, TunnelSession};

/// Log every state change until the session reaches `Stopped`.
async fn log_transitions(mut states: watch::Receiver<SessionState>) {
    while states.changed().await.is_ok() {
        let state = *states.borrow_and_update();
        info!(%state, "session state changed");
        if state.is_terminal() {
            break;
        }
    }
}

async fn run() -> Result<()> {
    let config_path = std::env::var("CONFIG_PATH")
        .map(Cow::Owned)
        .unwrap_or(Cow::Borrowed("config.toml"));
    // The session re-reads the file on every (re)start.
    let config = Config::load(config_path.as_ref()).context("Failed to load configuration")?;

    // Initialize metrics (must be done early, before any metrics are recorded)
    dnsgate::metrics::init(&config.metrics).context("Failed to initialize metrics")?;
    if config.metrics.enabled {
        info!("Metrics enabled on {}", config.metrics.listen);
    }

    info!("Starting dnsgate...");
    info!("Policy endpoint: {}", config.policy.endpoint);
    info!("Upstream resolver: {}", config.upstream_resolver);
    info!(
        "Tunnel: {}/{} (DNS {})",
        config.tunnel.address, config.tunnel.prefix_len, config.tunnel.dns_server
    );

    let session = TunnelSession::new(TunProvider, ConfigFile::new(config_path.as_ref()))
        .with_reconnect(config.reconnect.clone());
    let transitions = tokio::spawn(log_transitions(session.subscribe()));
    let handle = session.spawn();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Ctrl-C received, shutting down...");

    handle.stop().await;
    let _ = transitions.await;

    info!("Shutdown complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    run().await
}
