//! mcroute
//!
//! Memcache routing proxy. Accepts client connections, hashes each request
//! onto the configured server pool and fails over around servers marked
//! TKO.

use std::sync::Arc;

use anyhow::{Context, Result};
use mcroute_proxy::{pool_config, Config, Listener, ListenerConfig, Router};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to MCROUTE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting mcroute");
    info!(
        listen_addr = %config.listen_addr,
        servers = config.servers.len(),
        num_proxies = config.router.num_proxies,
        failover = config.failover,
        "Configuration loaded"
    );

    let router = Arc::new(Router::new(config.router.clone()).context("Failed to start router")?);
    router
        .configure(pool_config(
            config.servers.clone(),
            config.server_timeout,
            config.failover,
        ))
        .await
        .context("Failed to configure router")?;

    let mut listener_config = ListenerConfig::new(config.listen_addr);
    listener_config.max_connections = config.max_connections;

    let listener = match Listener::bind(listener_config, Arc::clone(&router)).await {
        Ok(listener) => Arc::new(listener),
        Err(e) => {
            error!(bind_addr = %config.listen_addr, error = %e, "Failed to bind listener");
            return Err(e.into());
        }
    };

    let listener_handle = tokio::spawn(async move {
        if let Err(e) = listener.run().await {
            error!(error = %e, "Listener error");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    // The listener task holds the other router reference.
    listener_handle.abort();
    let _ = listener_handle.await;

    match Arc::try_unwrap(router) {
        Ok(mut router) => {
            tokio::task::spawn_blocking(move || router.shutdown())
                .await
                .context("Router shutdown panicked")?;
        }
        Err(_) => warn!("Router still referenced, workers stop on exit"),
    }

    info!("mcroute stopped");
    Ok(())
}
