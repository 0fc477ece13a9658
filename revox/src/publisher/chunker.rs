//! Chunked, backpressure-aware streaming of one fragment into the publish
//! helper's stdin.
//!
//! A fragment is never written as one buffer: it is read in `chunk_size`
//! slices, each write bounded by a drain deadline, keeping peak per-fragment
//! memory at one chunk.

use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tracing::trace;

use transmux::PublishProcess;

/// Chunker tuning.
#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// Read/write slice size in bytes.
    pub chunk_size: usize,
    /// Token-bucket rate in bytes per second; 0 disables throttling.
    pub rate_limit_bps: u64,
    /// Deadline for one backpressured write to drain.
    pub drain_timeout: Duration,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024,
            rate_limit_bps: 0,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Accounting for one streamed fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkStats {
    pub chunks: u64,
    pub bytes: u64,
}

#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("Failed to open fragment {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read fragment: {0}")]
    Read(#[source] std::io::Error),

    #[error("Helper exited before the fragment completed")]
    HelperExited,

    #[error("Helper stdin is not available")]
    StdinUnavailable,

    #[error("Write did not drain within {0:?}")]
    DrainTimeout(Duration),

    #[error("Write to helper stdin failed: {0}")]
    Write(#[source] std::io::Error),
}

impl ChunkError {
    /// Whether the publisher should respond with a reconnect rather than a
    /// hard error: helper exit, broken pipe, stdin loss, or a drain that
    /// never completed. Local file problems are not reconnectable.
    pub fn is_reconnectable(&self) -> bool {
        matches!(
            self,
            ChunkError::HelperExited
                | ChunkError::StdinUnavailable
                | ChunkError::DrainTimeout(_)
                | ChunkError::Write(_)
        )
    }
}

/// Token bucket pacing chunk writes to `bps` bytes per second.
struct RateLimiter {
    bps: u64,
    allowance: f64,
    last: Instant,
}

impl RateLimiter {
    fn new(bps: u64) -> Self {
        Self {
            bps,
            allowance: bps as f64,
            last: Instant::now(),
        }
    }

    /// Sleep off the deficit before a write of `bytes`.
    async fn throttle(&mut self, bytes: usize) {
        if self.bps == 0 {
            return;
        }
        let now = Instant::now();
        let refill = now.duration_since(self.last).as_secs_f64() * self.bps as f64;
        self.allowance = (self.allowance + refill).min(self.bps as f64);
        self.last = now;

        let needed = bytes as f64;
        if needed > self.allowance {
            let deficit = needed - self.allowance;
            let wait = Duration::from_secs_f64(deficit / self.bps as f64);
            tokio::time::sleep(wait).await;
            // The slept interval paid for this write; it must not be
            // re-credited as refill on the next chunk.
            self.last = Instant::now();
            self.allowance = 0.0;
        } else {
            self.allowance -= needed;
        }
    }
}

/// Stream one fragment file into the helper's stdin.
///
/// Before each write the helper is checked to still be alive and its stdin
/// attached; the write itself must complete within the drain deadline.
pub async fn stream_file(
    config: &ChunkerConfig,
    path: &Path,
    process: &mut PublishProcess,
) -> Result<ChunkStats, ChunkError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|source| ChunkError::Open {
            path: path.display().to_string(),
            source,
        })?;

    let mut limiter = RateLimiter::new(config.rate_limit_bps);
    let mut chunk = vec![0u8; config.chunk_size];
    let mut stats = ChunkStats { chunks: 0, bytes: 0 };

    loop {
        let filled = fill_chunk(&mut file, &mut chunk).await?;
        if filled == 0 {
            break;
        }

        match process.try_wait() {
            Ok(None) => {}
            // A wait error means the child is no longer observable.
            Ok(Some(_)) | Err(_) => return Err(ChunkError::HelperExited),
        }
        let Some(stdin) = process.stdin() else {
            return Err(ChunkError::StdinUnavailable);
        };

        limiter.throttle(filled).await;

        match tokio::time::timeout(config.drain_timeout, stdin.write_all(&chunk[..filled])).await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(ChunkError::Write(e)),
            Err(_) => return Err(ChunkError::DrainTimeout(config.drain_timeout)),
        }

        stats.chunks += 1;
        stats.bytes += filled as u64;
        trace!(chunk = stats.chunks, bytes = stats.bytes, "Chunk written");
    }

    if let Some(stdin) = process.stdin() {
        match tokio::time::timeout(config.drain_timeout, stdin.flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(ChunkError::Write(e)),
            Err(_) => return Err(ChunkError::DrainTimeout(config.drain_timeout)),
        }
    }

    Ok(stats)
}

/// Fill the chunk buffer from the file, short only at end of file.
async fn fill_chunk(
    file: &mut tokio::fs::File,
    chunk: &mut [u8],
) -> Result<usize, ChunkError> {
    let mut filled = 0;
    while filled < chunk.len() {
        let n = file
            .read(&mut chunk[filled..])
            .await
            .map_err(ChunkError::Read)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn sink_process() -> PublishProcess {
        let args = vec!["-c".to_string(), "cat > /dev/null".to_string()];
        PublishProcess::spawn("sh", &args).unwrap()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn chunk_accounting_matches_fragment_size() {
        // 2 MiB fragment with 512 KiB chunks: exactly 4 chunks, 2 097 152 bytes.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fragment.mp4");
        tokio::fs::write(&path, vec![7u8; 2 * 1024 * 1024]).await.unwrap();

        let config = ChunkerConfig {
            chunk_size: 512 * 1024,
            ..Default::default()
        };
        let mut process = sink_process();
        let stats = stream_file(&config, &path, &mut process).await.unwrap();

        assert_eq!(stats.chunks, 4);
        assert_eq!(stats.bytes, 2_097_152);
        process.terminate(Duration::from_secs(5)).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn empty_fragment_writes_no_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fragment.mp4");
        tokio::fs::write(&path, b"").await.unwrap();

        let mut process = sink_process();
        let stats = stream_file(&ChunkerConfig::default(), &path, &mut process)
            .await
            .unwrap();
        assert_eq!(stats, ChunkStats { chunks: 0, bytes: 0 });
        process.terminate(Duration::from_secs(5)).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dead_helper_surfaces_as_reconnectable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fragment.mp4");
        tokio::fs::write(&path, vec![1u8; 64 * 1024]).await.unwrap();

        let args = vec!["-c".to_string(), "exit 1".to_string()];
        let mut process = PublishProcess::spawn("sh", &args).unwrap();
        // Let the helper die before the first chunk.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let config = ChunkerConfig {
            chunk_size: 16 * 1024,
            ..Default::default()
        };
        let err = stream_file(&config, &path, &mut process).await.unwrap_err();
        assert!(err.is_reconnectable());
    }

    #[tokio::test]
    async fn missing_fragment_is_not_reconnectable() {
        let err = ChunkError::Open {
            path: "/nowhere/batch-0.mp4".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(!err.is_reconnectable());
    }

    #[cfg(unix)]
    #[tokio::test(start_paused = true)]
    async fn rate_limit_paces_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fragment.mp4");
        tokio::fs::write(&path, vec![2u8; 256 * 1024]).await.unwrap();

        let config = ChunkerConfig {
            chunk_size: 64 * 1024,
            rate_limit_bps: 64 * 1024,
            ..Default::default()
        };
        let mut process = sink_process();

        let started = Instant::now();
        let stats = stream_file(&config, &path, &mut process).await.unwrap();
        assert_eq!(stats.chunks, 4);
        // First chunk spends the initial allowance; the remaining three sleep
        // roughly one second each under the paused clock.
        assert!(started.elapsed() >= Duration::from_secs(3));
        process.terminate(Duration::from_secs(5)).await;
    }
}
