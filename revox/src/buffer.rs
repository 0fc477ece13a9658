//! Duration-bounded segment batching.

use std::path::PathBuf;

use serde::Serialize;
use tracing::debug;

/// One downloaded HLS media segment on disk.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Canonical sequence number: `media_sequence + index` in the manifest.
    pub sequence: u64,
    /// Local id the file is stored under (`seg-{counter}`).
    pub local_id: String,
    /// Media-segment URI as advertised by the manifest.
    pub uri: String,
    /// Declared duration in seconds.
    pub duration: f64,
    /// File path on disk.
    pub path: PathBuf,
    /// Byte size on disk.
    pub size: u64,
}

/// An ordered, contiguous group of segments processed as a unit.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Strictly monotonic per stream, starting at 0.
    pub batch_number: u64,
    pub segments: Vec<Segment>,
    pub total_duration: f64,
}

impl Batch {
    pub fn segment_paths(&self) -> Vec<PathBuf> {
        self.segments.iter().map(|s| s.path.clone()).collect()
    }
}

/// Snapshot of buffer accumulation for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct BufferStatus {
    pub segment_count: usize,
    pub accumulated_duration: f64,
    pub progress_percent: f64,
    pub next_batch_number: u64,
}

/// Accumulates segments and emits a batch when the duration threshold is
/// crossed.
pub struct BufferManager {
    buffer_duration: f64,
    pending: Vec<Segment>,
    accumulated: f64,
    next_batch_number: u64,
}

impl BufferManager {
    pub fn new(buffer_duration: f64) -> Self {
        Self {
            buffer_duration,
            pending: Vec::new(),
            accumulated: 0.0,
            next_batch_number: 0,
        }
    }

    /// Add a segment; returns a batch when accumulated duration reaches the
    /// threshold. Internal state resets to zero on emission.
    pub fn add_segment(&mut self, segment: Segment) -> Option<Batch> {
        self.accumulated += segment.duration;
        self.pending.push(segment);

        if self.accumulated >= self.buffer_duration {
            self.emit()
        } else {
            None
        }
    }

    /// Emit any residual segments as a possibly-short batch.
    pub fn flush(&mut self) -> Option<Batch> {
        if self.pending.is_empty() {
            return None;
        }
        self.emit()
    }

    pub fn status(&self) -> BufferStatus {
        let progress = if self.buffer_duration > 0.0 {
            (self.accumulated / self.buffer_duration * 100.0).min(100.0)
        } else {
            0.0
        };
        BufferStatus {
            segment_count: self.pending.len(),
            accumulated_duration: self.accumulated,
            progress_percent: progress,
            next_batch_number: self.next_batch_number,
        }
    }

    fn emit(&mut self) -> Option<Batch> {
        let segments = std::mem::take(&mut self.pending);
        let total_duration = self.accumulated;
        self.accumulated = 0.0;

        let batch = Batch {
            batch_number: self.next_batch_number,
            segments,
            total_duration,
        };
        self.next_batch_number += 1;

        debug!(
            batch_number = batch.batch_number,
            segments = batch.segments.len(),
            total_duration = batch.total_duration,
            "Batch emitted"
        );
        Some(batch)
    }
}
