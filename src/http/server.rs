//! HTTP server

use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::HttpConfig;
use crate::error::{Error, Result};
use crate::http::handlers;
use crate::orchestrator::BridgeOrchestrator;

/// Shared handler state
pub struct AppState {
    pub orchestrator: Arc<BridgeOrchestrator>,
}

pub struct WebServer {
    config: HttpConfig,
    state: Arc<AppState>,
}

impl WebServer {
    pub fn new(config: HttpConfig, orchestrator: Arc<BridgeOrchestrator>) -> Self {
        Self {
            config,
            state: Arc::new(AppState { orchestrator }),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/stream/:id", get(handlers::stream_audio))
            .route("/api/status", get(handlers::get_status))
            .route("/api/devices", get(handlers::get_devices))
            .route("/api/sessions", get(handlers::get_sessions))
            .route("/api/sessions/:name", get(handlers::get_session))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.config.bind_address, self.config.port)
            .parse()
            .map_err(|e| Error::Config(format!("http bind address: {}", e)))
    }

    /// Serve until the listener fails
    pub async fn run(self) -> Result<()> {
        let addr = self.bind_addr()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Stream server listening on http://{}", addr);
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    /// Serve on a background task
    pub fn start_background(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run().await {
                tracing::error!("Stream server error: {}", e);
            }
        })
    }
}
