use anyhow::Result;
use std::net::SocketAddr;
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keyed_ratelimit::{build_limiter, service::app, LimiterConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keyed_ratelimit=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting keyed rate limiter");

    let config_path = std::env::var("CONFIG_PATH").ok();
    if let Some(path) = &config_path {
        info!("Loading configuration from: {}", path);
    }
    let config = LimiterConfig::load(config_path.as_deref())?;
    info!(
        backend = ?config.backend,
        rate = config.rate,
        burst = config.burst,
        "Configuration loaded"
    );

    let limiter = build_limiter(&config).await?;

    let http_addr = std::env::var("HTTP_PORT")
        .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        .parse::<SocketAddr>()?;

    let listener = TcpListener::bind(http_addr).await?;
    info!("HTTP server listening on {}", http_addr);

    axum::serve(listener, app(limiter))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Service stopped");
    Ok(())
}

async fn shutdown_signal() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down"),
        Err(e) => warn!("Failed to listen for Ctrl+C, shutting down: {}", e),
    }
}
