use anyhow::{Context, Result};
use noisy_sni_proxy::config::Config;
use noisy_sni_proxy::connection::ClientTiming;
use noisy_sni_proxy::doh::DohHandle;
use noisy_sni_proxy::policy::NoPolicy;
use noisy_sni_proxy::{listener, telemetry};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Install ring as the default CryptoProvider before any TLS usage: the
    // DoH resolver dials cloudflare-dns.com over a genuine TLS connection,
    // and rustls panics on its first handshake if no provider is installed.
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install default rustls CryptoProvider");

    let config = Config::load().context("failed to load configuration")?;
    telemetry::init_telemetry(&config.log.level);

    info!(version = env!("CARGO_PKG_VERSION"), "starting noisy-sni-proxy");

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| {
            format!(
                "invalid listen address {}:{}",
                config.server.host, config.server.port
            )
        })?;

    // The DoH resolver reaches Cloudflare through this very proxy, so it
    // needs this listener's own address to dial back into.
    let doh = Arc::new(DohHandle::new(addr));
    let policy = Arc::new(NoPolicy);
    let timing = ClientTiming {
        connect_timeout: Duration::from_millis(config.client.conn_timeout_ms),
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let listener_task = tokio::spawn(listener::run(
        addr,
        config.server.backlog,
        doh,
        policy,
        timing,
        shutdown_rx,
    ));

    signal::ctrl_c().await.context("failed to listen for SIGINT")?;
    info!("received SIGINT, shutting down");
    let _ = shutdown_tx.send(true);

    match listener_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("listener exited with error: {e}"),
        Err(e) => tracing::warn!("listener task panicked: {e}"),
    }

    info!("noisy-sni-proxy shut down");
    Ok(())
}
