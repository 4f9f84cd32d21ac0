//! NicoCache proxy server
//!
//! Loads configuration, indexes the cache directory and serves the proxy
//! until Ctrl-C.

use anyhow::Context;
use nicocache::{NicoCacheProxy, SharedConfig};
use std::env;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Main entry point for the NicoCache server
///
/// # Usage
/// ```bash
/// # Start with default config (nicocache.yaml, created if missing)
/// nicocache
///
/// # Start with custom config
/// nicocache /path/to/config.yaml
/// ```
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "nicocache.yaml".to_string());

    let config = SharedConfig::load_or_create(&config_path)
        .with_context(|| format!("cannot load configuration from {}", config_path))?;
    let current = config.current();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(if current.debug {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting NicoCache");
    info!("Configuration loaded from: {}", config_path);
    info!("  - Listen port: {}", current.listen_port);
    match current.secondary_proxy() {
        Some((host, port)) => info!("  - Secondary proxy: {}:{} (ssl: {})", host, port, current.proxy_ssl),
        None => info!("  - Secondary proxy: none"),
    }
    info!("  - Cache dir: {}", current.cache_dir);
    info!("  - Resume download: {}", current.resume_download);

    let proxy = NicoCacheProxy::new(config.clone()).await?;
    let server = proxy.bind().await.context("cannot bind listening socket")?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutting down");
                signal.cancel();
            }
            Err(e) => error!("cannot listen for Ctrl-C: {}", e),
        }
    });

    if let Err(e) = server.run(shutdown).await {
        error!("Server stopped: {}", e);
    }

    let stats = proxy.metrics().get_stats();
    info!("=== Session summary ===");
    info!("  Connections: {}", stats.connections_accepted);
    info!("  Requests: {}", stats.total_requests);
    info!(
        "  Cache hits: {} ({:.1}%), misses: {} ({} duplicate)",
        stats.cache_hits,
        stats.cache_hit_rate(),
        stats.cache_misses,
        stats.duplicate_downloads
    );
    info!(
        "  Downloads completed: {}, suspended: {}, discarded: {}",
        stats.downloads_completed, stats.downloads_suspended, stats.downloads_discarded
    );
    info!("  Bytes served from cache: {}", stats.bytes_from_cache);
    Ok(())
}
