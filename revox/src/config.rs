//! Service and pipeline configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Batch duration bounds in seconds.
pub const MIN_BUFFER_DURATION: f64 = 5.0;
pub const MAX_BUFFER_DURATION: f64 = 120.0;

/// Per-session pipeline tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Batch duration threshold in seconds.
    pub buffer_duration: f64,
    /// Manifest poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Publisher chunk size in bytes.
    pub chunk_size: usize,
    /// Chunker token-bucket rate in bytes per second; 0 disables.
    pub rate_limit_bps: u64,
    /// Whether the publish helper reads at native frame rate (`-re`).
    pub use_rate_limit: bool,
    /// Publisher reconnect attempts before the session fails.
    pub max_reconnect_attempts: u32,
    /// Delay between publisher reconnect attempts in milliseconds.
    pub reconnect_delay_ms: u64,
    /// Published batches kept on disk beyond the safety buffer.
    pub max_segments_to_keep: usize,
    /// Extra published batches retained before cleanup kicks in.
    pub cleanup_safety_buffer: usize,
    /// Whether the sliding-window cleanup runs at all.
    pub enable_cleanup: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_duration: 30.0,
            poll_interval_ms: 2000,
            chunk_size: 1024 * 1024,
            rate_limit_bps: 0,
            use_rate_limit: false,
            max_reconnect_attempts: 5,
            reconnect_delay_ms: 2000,
            max_segments_to_keep: 3,
            cleanup_safety_buffer: 5,
            enable_cleanup: true,
        }
    }
}

impl PipelineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Validate option ranges before a session starts.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_BUFFER_DURATION..=MAX_BUFFER_DURATION).contains(&self.buffer_duration) {
            return Err(Error::config(format!(
                "buffer_duration must be between {MIN_BUFFER_DURATION} and {MAX_BUFFER_DURATION} \
                 seconds, got {}",
                self.buffer_duration
            )));
        }
        if self.chunk_size == 0 {
            return Err(Error::config("chunk_size must be non-zero"));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::config("poll_interval_ms must be non-zero"));
        }
        Ok(())
    }
}

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_address: String,
    pub port: u16,
    pub enable_cors: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 12590,
            enable_cors: true,
        }
    }
}

/// Process-level configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Root of the on-disk storage tree.
    pub storage_root: PathBuf,
    /// Log directory.
    pub log_dir: PathBuf,
    /// Default publish target when a start request does not name one.
    pub output_url: String,
    pub api: ApiConfig,
    pub pipeline: PipelineConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("storage"),
            log_dir: PathBuf::from("logs"),
            output_url: "rtmp://127.0.0.1/live".to_string(),
            api: ApiConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Load from environment variables, falling back to defaults.
    ///
    /// Supported env vars: `REVOX_STORAGE_ROOT`, `REVOX_LOG_DIR`,
    /// `REVOX_OUTPUT_URL`, `REVOX_API_ADDR`, `REVOX_API_PORT`.
    pub fn from_env_or_default() -> Self {
        let mut config = Self::default();

        if let Ok(root) = std::env::var("REVOX_STORAGE_ROOT")
            && !root.trim().is_empty()
        {
            config.storage_root = PathBuf::from(root);
        }

        if let Ok(dir) = std::env::var("REVOX_LOG_DIR")
            && !dir.trim().is_empty()
        {
            config.log_dir = PathBuf::from(dir);
        }

        if let Ok(url) = std::env::var("REVOX_OUTPUT_URL")
            && !url.trim().is_empty()
        {
            config.output_url = url;
        }

        if let Ok(addr) = std::env::var("REVOX_API_ADDR")
            && !addr.trim().is_empty()
        {
            config.api.bind_address = addr;
        }

        if let Ok(port) = std::env::var("REVOX_API_PORT")
            && let Ok(parsed) = port.parse::<u16>()
        {
            config.api.port = parsed;
        }

        config
    }
}

/// A stream identifier: non-empty and URL-safe.
pub fn validate_stream_id(stream_id: &str) -> Result<()> {
    if stream_id.is_empty() {
        return Err(Error::validation("stream_id must not be empty"));
    }
    if !stream_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(Error::validation(format!(
            "stream_id '{stream_id}' must contain only alphanumerics, '-', '_' or '.'"
        )));
    }
    Ok(())
}
