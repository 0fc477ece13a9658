//! Pipeline ownership and wiring.

use serde::Serialize;

use crate::buffer::BufferStatus;
use crate::publisher::PublisherState;

mod orchestrator;

pub use orchestrator::PipelineOrchestrator;

/// Observable pipeline phase. Cycles `fetching → processing → publishing`
/// and back while the session runs; `error` on any unhandled fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelinePhase {
    Idle,
    Fetching,
    Processing,
    Publishing,
    Error,
}

/// Parameters for starting a pipeline session.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub source_url: String,
    pub stream_id: String,
    pub audio_processor_url: String,
    /// Overrides the configured batch threshold when set.
    pub buffer_duration: Option<f64>,
    /// Overrides the configured publish target when set.
    pub output_url: Option<String>,
}

/// Consolidated pipeline status for the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub running: bool,
    pub phase: PipelinePhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
    pub segments_downloaded: u64,
    pub batches_emitted: u64,
    pub audio_fragments_processed: u64,
    pub fragments_published: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buffer: Option<BufferStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publisher_state: Option<PublisherState>,
    pub reconnect_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl PipelineStatus {
    pub(crate) fn idle() -> Self {
        Self {
            running: false,
            phase: PipelinePhase::Idle,
            stream_id: None,
            segments_downloaded: 0,
            batches_emitted: 0,
            audio_fragments_processed: 0,
            fragments_published: 0,
            buffer: None,
            publisher_state: None,
            reconnect_attempts: 0,
            last_error: None,
        }
    }
}
