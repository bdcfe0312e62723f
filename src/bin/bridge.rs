//! AirPlay to Cast Bridge
//!
//! Discovers Cast devices and runs one AirPlay receiver per device.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use airplay_cast_bridge::{config::AppConfig, http::WebServer, protocol::BridgeEvent, BridgeOrchestrator};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting AirPlay to Cast Bridge");

    // Config path from args, else the platform config dir
    let config = match std::env::args().nth(1) {
        Some(path) => AppConfig::load(&PathBuf::from(path))?,
        None => AppConfig::load_or_default()?,
    };

    let orchestrator = Arc::new(BridgeOrchestrator::with_defaults(config.clone()));
    let mut events = orchestrator.subscribe();

    let web_server = WebServer::new(config.http.clone(), orchestrator.clone());
    let _web_handle = web_server.start_background();
    tracing::info!(
        "Streams served at http://{}:{}/stream/",
        config.http.bind_address,
        config.http.port
    );

    orchestrator.start().await?;
    tracing::info!("Press Ctrl+C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(BridgeEvent::Error(report)) => tracing::warn!(
                    "[{}] {}: {}",
                    report.source,
                    report.device_name.as_deref().unwrap_or("bridge"),
                    report.error
                ),
                Ok(event) => tracing::debug!("{:?}", event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Dropped {} bridge events", n)
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    tracing::info!("Shutting down...");
    orchestrator.stop().await;
    Ok(())
}
