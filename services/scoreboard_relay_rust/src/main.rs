//! Scoreboard Relay Service
//!
//! Streams live game state to scoreboard overlays over server-sent events.
//!
//! This service:
//! - Accepts viewer connections per game channel
//! - Polls the gamesheet feed once per watched game, never for unwatched ones
//! - Pushes only changed fields to every viewer of the game
//! - Serves the last known state on request

mod config;
mod routes;

use anyhow::{Context, Result};
use config::ServiceConfig;
use dotenv::dotenv;
use routes::AppState;
use scoreboard_rust_core::providers::GamesheetFeedProducer;
use scoreboard_rust_core::RelayHub;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    info!("Starting Scoreboard Relay Service...");

    let config = ServiceConfig::from_env()?;

    let producer = Arc::new(
        GamesheetFeedProducer::new(config.feed.clone())
            .context("Failed to initialize gamesheet feed")?,
    );
    info!(feed = %config.feed.url_template, "Gamesheet feed configured");

    let hub = RelayHub::start(config.relay.clone(), producer);
    let router = routes::build_router(AppState {
        hub: Arc::clone(&hub),
        sse_keepalive: config.sse_keepalive,
    });

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!(addr = %listener.local_addr()?, "Scoreboard relay listening");

    // SSE responses end only once the hub disconnects their clients
    let shutdown_hub = Arc::clone(&hub);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received shutdown signal"),
                Err(err) => error!("Unable to listen for shutdown signal: {}", err),
            }
            shutdown_hub.shutdown().await;
        })
        .await
        .context("HTTP server failed")?;

    info!("Scoreboard relay stopped");
    Ok(())
}
