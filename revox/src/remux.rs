//! Remux stage: pairs the stored video fragment with the processor's audio.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::processor::ProcessedAudio;
use crate::storage::StorageService;

/// One publishable output fragment: a single container with exactly one
/// video and one audio track.
#[derive(Debug, Clone)]
pub struct RemuxedOutput {
    pub batch_number: u64,
    pub output_path: PathBuf,
    pub size: u64,
}

/// Events emitted by the remux stage.
#[derive(Debug)]
pub enum RemuxerEvent {
    RemuxComplete(RemuxedOutput),
    BatchFailed { batch_number: u64, message: String },
}

/// Combines demuxed video with processed audio, copying both tracks.
///
/// `-shortest` terminates the output with the shorter track; fine-grained
/// A/V resync is not attempted.
pub struct Remuxer {
    stream_id: String,
    storage: Arc<dyn StorageService>,
    ffmpeg: Arc<transmux::Ffmpeg>,
    events: mpsc::Sender<RemuxerEvent>,
}

impl Remuxer {
    pub fn new(
        stream_id: impl Into<String>,
        storage: Arc<dyn StorageService>,
        ffmpeg: Arc<transmux::Ffmpeg>,
        events: mpsc::Sender<RemuxerEvent>,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            storage,
            ffmpeg,
            events,
        }
    }

    /// Produce the output fragment for one batch's processed audio.
    pub async fn on_processed_audio(&self, processed: ProcessedAudio) -> Result<()> {
        let batch_number = processed.batch_number;
        match self.remux_inner(&processed).await {
            Ok(output) => {
                info!(
                    batch_number,
                    size = output.size,
                    path = %output.output_path.display(),
                    "Remux complete"
                );
                let _ = self
                    .events
                    .send(RemuxerEvent::RemuxComplete(output))
                    .await;
                Ok(())
            }
            Err(e) => {
                let _ = self
                    .events
                    .send(RemuxerEvent::BatchFailed {
                        batch_number,
                        message: e.to_string(),
                    })
                    .await;
                Err(e)
            }
        }
    }

    async fn remux_inner(&self, processed: &ProcessedAudio) -> Result<RemuxedOutput> {
        let batch_number = processed.batch_number;
        let video_path = self.storage.video_path(&self.stream_id, batch_number);

        if !tokio::fs::try_exists(&video_path).await.unwrap_or(false) {
            return Err(Error::Storage(format!(
                "Video fragment {} missing for batch {batch_number}",
                video_path.display()
            )));
        }

        let output_path = self.storage.output_path(&self.stream_id, batch_number);
        transmux::run(
            self.ffmpeg.binary(),
            &transmux::remux_args(&video_path, &processed.audio_path, &output_path),
        )
        .await?;

        let size = tokio::fs::metadata(&output_path).await?.len();
        debug!(batch_number, size, "Output fragment written");

        Ok(RemuxedOutput {
            batch_number,
            output_path,
            size,
        })
    }
}
