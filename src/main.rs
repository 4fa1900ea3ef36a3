//! iris - message relay
//!
//! Routes requests between clustered clients and correlates their replies.

use iris_relay::{Config, Server, ServerConfig};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Defaults, then IRIS_CONFIG file, then env overrides
    let config_path = std::env::var("IRIS_CONFIG").ok();
    let config = match Config::load() {
        Ok(c) => {
            if let Some(ref path) = config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // An explicitly named config file must load
            if config_path.is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::warn!("Invalid configuration ({}), using defaults", e);
            Config::default()
        }
    };

    tracing::info!("Starting iris relay");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Max connections: {}", config.network.max_connections);
    if config.network.idle_timeout_secs == 0 {
        tracing::info!("  Idle timeout: disabled");
    } else {
        tracing::info!("  Idle timeout: {}s", config.network.idle_timeout_secs);
    }
    tracing::info!("  Route sweep interval: {}ms", config.routing.sweep_interval_ms);

    let server = Arc::new(Server::new(ServerConfig::from(&config)));

    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping relay...");
        shutdown_server.shutdown();
    });

    // Blocks until shutdown
    server.run().await?;

    let stats = server.stats();
    tracing::info!(
        "Relay stopped ({} connections served, {} requests routed)",
        stats
            .connections_total
            .load(std::sync::atomic::Ordering::Relaxed),
        server
            .router()
            .stats()
            .requests_routed
            .load(std::sync::atomic::Ordering::Relaxed)
    );
    Ok(())
}
