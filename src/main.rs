//! tandem - Binary RPC transport server
//!
//! Accepts TCP connections, negotiates a protocol version and optional
//! in-band TLS, then serves requests on each established session.

use std::sync::Arc;
use tandem_server::{run_metrics_server, tls, Config, Metrics, Server, ServerConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if TANDEM_CONFIG is set, then env overrides)
    let config_path = std::env::var("TANDEM_CONFIG").ok();
    let config = match Config::load() {
        Ok(c) => {
            if let Some(ref path) = config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if config_path.is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    if let Err(e) = config.validate() {
        tracing::error!("Configuration error: {}", e);
        return Err(e.into());
    }

    let protocol = config.effective_protocol();

    tracing::info!("Starting tandem server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!(
        "  Protocol versions: {}..={}",
        protocol.server_min_version,
        protocol.server_max_version
    );
    tracing::info!(
        "  Keep-alive: every {}ms, dead after {}ms",
        protocol.keep_alive_interval_ms,
        protocol.keep_alive_timeout_ms
    );
    if !protocol.enabled {
        tracing::warn!("  Server disabled: every handshake will be rejected");
    }

    let mut server_config = ServerConfig::new(config.network.bind_addr)
        .with_protocol(protocol)
        .with_max_connections(config.network.max_connections);

    if config.tls.enabled {
        let acceptor = tls::create_tls_acceptor(&config.tls)?;
        tracing::info!(
            "  TLS: available{}",
            if config.protocol.requires_tls {
                " (required)"
            } else {
                ""
            }
        );
        if config.tls.require_client_cert {
            tracing::info!("  mTLS: enabled (client certificate required)");
        }
        server_config = server_config.with_tls(acceptor);
    } else {
        tracing::info!("  TLS: disabled");
    }

    let metrics = if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        server_config = server_config.with_metrics(metrics.clone());
        Some(metrics)
    } else {
        None
    };

    let server = Arc::new(Server::new(server_config));

    // Spawn metrics server
    if let Some(metrics) = metrics {
        let addr = config.metrics.bind_addr;
        let shutdown = server.subscribe_shutdown();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, shutdown).await {
                tracing::error!("Metrics server error: {}", e);
            }
        });
    }

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    // Run server (blocks until shutdown)
    server.run().await?;

    tracing::info!("Server stopped");
    Ok(())
}
