//! API request and response models (DTOs).

use serde::{Deserialize, Serialize};

use crate::pipeline::StartRequest;

/// Body of `POST /api/pipeline/start`.
#[derive(Debug, Clone, Deserialize)]
pub struct StartPipelineRequest {
    /// Live HLS source URL (master or media playlist).
    pub source_url: String,
    /// Stream identifier, stable for the session.
    pub stream_id: String,
    /// Speech processor WebSocket URL.
    pub audio_processor_url: String,
    /// Batch duration threshold in seconds (default 30, legal 5-120).
    #[serde(default)]
    pub buffer_duration: Option<f64>,
    /// Publish target override (`rtmp://host/app` or `srt://host:port`).
    #[serde(default)]
    pub output_url: Option<String>,
}

impl From<StartPipelineRequest> for StartRequest {
    fn from(request: StartPipelineRequest) -> Self {
        Self {
            source_url: request.source_url,
            stream_id: request.stream_id,
            audio_processor_url: request.audio_processor_url,
            buffer_duration: request.buffer_duration,
            output_url: request.output_url,
        }
    }
}

/// Simple acknowledgment body.
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Body of `POST /api/storage/clean`.
#[derive(Debug, Serialize)]
pub struct CleanStorageResponse {
    pub reclaimed_bytes: u64,
}

/// Body of `GET /health`.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transmuxer: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_request_deserializes_with_defaults() {
        let body = r#"{
            "source_url": "http://example.com/live.m3u8",
            "stream_id": "cam1",
            "audio_processor_url": "ws://localhost:9030"
        }"#;
        let request: StartPipelineRequest = serde_json::from_str(body).unwrap();
        assert_eq!(request.stream_id, "cam1");
        assert!(request.buffer_duration.is_none());
        assert!(request.output_url.is_none());
    }
}
