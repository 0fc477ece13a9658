//! API server setup.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api::routes;
use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::pipeline::PipelineOrchestrator;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Server start time for uptime reporting.
    pub start_time: Instant,
    pub orchestrator: Arc<PipelineOrchestrator>,
    pub ffmpeg: Arc<transmux::Ffmpeg>,
}

impl AppState {
    pub fn new(orchestrator: Arc<PipelineOrchestrator>, ffmpeg: Arc<transmux::Ffmpeg>) -> Self {
        Self {
            start_time: Instant::now(),
            orchestrator,
            ffmpeg,
        }
    }
}

/// Build the router with middleware applied.
pub fn build_router(config: &ApiConfig, state: AppState) -> Router {
    let mut router = routes::router().layer(TraceLayer::new_for_http());

    if config.enable_cors {
        router = router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }

    router.with_state(state)
}

/// Serve the API until the token is cancelled.
pub async fn serve(config: &ApiConfig, state: AppState, token: CancellationToken) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.bind_address, config.port)
        .parse()
        .map_err(|e| Error::config(format!("Invalid API bind address: {e}")))?;

    let router = build_router(config, state);
    let listener = TcpListener::bind(addr).await?;
    info!("API listening on {addr}");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;
    Ok(())
}
