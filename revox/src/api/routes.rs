//! Route handlers.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | POST | `/api/pipeline/start` | Start a pipeline session |
//! | POST | `/api/pipeline/stop` | Stop the running session (idempotent) |
//! | GET | `/api/pipeline/status` | Consolidated pipeline status |
//! | POST | `/api/storage/clean` | Remove stored stream data |
//! | GET | `/health` | Liveness and helper availability |

use axum::{Json, Router, extract::State, routing::{get, post}};

use crate::api::error::ApiResult;
use crate::api::models::{
    CleanStorageResponse, HealthResponse, MessageResponse, StartPipelineRequest,
};
use crate::api::server::AppState;
use crate::pipeline::PipelineStatus;

/// Build the API router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/api/pipeline/start", post(start_pipeline))
        .route("/api/pipeline/stop", post(stop_pipeline))
        .route("/api/pipeline/status", get(pipeline_status))
        .route("/api/storage/clean", post(clean_storage))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.start_time.elapsed().as_secs(),
        transmuxer: state.ffmpeg.version().map(str::to_string),
    })
}

async fn start_pipeline(
    State(state): State<AppState>,
    Json(request): Json<StartPipelineRequest>,
) -> ApiResult<Json<MessageResponse>> {
    state.orchestrator.start(request.into()).await?;
    Ok(Json(MessageResponse::new("Pipeline started")))
}

async fn stop_pipeline(State(state): State<AppState>) -> ApiResult<Json<MessageResponse>> {
    state.orchestrator.stop().await?;
    Ok(Json(MessageResponse::new("Pipeline stopped")))
}

async fn pipeline_status(State(state): State<AppState>) -> Json<PipelineStatus> {
    Json(state.orchestrator.status().await)
}

async fn clean_storage(State(state): State<AppState>) -> ApiResult<Json<CleanStorageResponse>> {
    let reclaimed_bytes = state.orchestrator.clean_storage().await?;
    Ok(Json(CleanStorageResponse { reclaimed_bytes }))
}
