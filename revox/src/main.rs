//! revox - live HLS restreaming with external audio substitution.

use std::sync::Arc;

use revox::api::{AppState, serve};
use revox::config::ServiceConfig;
use revox::logging::init_logging;
use revox::pipeline::PipelineOrchestrator;
use revox::storage::{FsStorage, StorageService};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServiceConfig::from_env_or_default();

    let _guard = init_logging(&config.log_dir)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    info!("Starting revox v{}", env!("CARGO_PKG_VERSION"));

    let storage = Arc::new(FsStorage::new(config.storage_root.clone()));
    storage.init().await?;
    info!("Storage initialized at {}", storage.root().display());

    let ffmpeg = Arc::new(transmux::Ffmpeg::new());
    match ffmpeg.version() {
        Some(version) => info!("Transmuxer available: {version}"),
        None => warn!(
            "Transmuxer binary '{}' not found; pipeline starts will fail",
            ffmpeg.binary()
        ),
    }

    let orchestrator = Arc::new(PipelineOrchestrator::new(
        config.clone(),
        storage.clone() as Arc<dyn StorageService>,
        ffmpeg.clone(),
    ));

    let token = CancellationToken::new();
    let state = AppState::new(orchestrator.clone(), ffmpeg);
    let api_config = config.api.clone();
    let api_token = token.clone();
    let api_task =
        tokio::spawn(async move { serve(&api_config, state, api_token).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT (Ctrl+C), initiating shutdown...");
        }
        _ = wait_for_sigterm() => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    if let Err(e) = orchestrator.stop().await {
        error!("Error stopping pipeline: {e}");
    }

    token.cancel();
    match api_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("API server error: {e}"),
        Err(e) => error!("API task failed: {e}"),
    }

    info!("revox shutdown complete");
    Ok(())
}

/// Wait for SIGTERM (Unix only).
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            error!("Failed to register SIGTERM handler: {e}");
            std::future::pending::<()>().await;
        }
    }
}

/// On non-Unix targets only Ctrl+C is handled.
#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
