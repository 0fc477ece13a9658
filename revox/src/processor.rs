//! Audio processing stage: batch concatenation, demux, and the exchange with
//! the external speech processor.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use speech_link::envelope::batch_number_of;
use speech_link::{FragmentDescriptor, LinkClient, LinkEvent};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::buffer::Batch;
use crate::error::{Error, Result};
use crate::storage::StorageService;

/// Video and audio halves of one demuxed batch.
#[derive(Debug, Clone)]
pub struct DemuxedOutput {
    pub batch_number: u64,
    pub video_path: PathBuf,
    pub audio_path: PathBuf,
    pub video_size: u64,
    pub audio_size: u64,
}

/// The processor's returned audio for one batch, stored on disk.
#[derive(Debug, Clone)]
pub struct ProcessedAudio {
    pub batch_number: u64,
    pub audio_path: PathBuf,
    pub size: u64,
}

/// Events emitted by the audio processing stage.
#[derive(Debug)]
pub enum ProcessorEvent {
    DemuxComplete(DemuxedOutput),
    AudioSent { batch_number: u64 },
    AudioProcessed(ProcessedAudio),
    /// The batch is dropped; the pipeline continues with subsequent batches.
    BatchFailed { batch_number: u64, message: String },
}

/// Turns a batch into a stored video fragment plus a processing request, and
/// absorbs the processor's response.
///
/// In-order completion is not enforced here; the remuxer and publisher own
/// ordering by batch number.
pub struct AudioProcessor {
    stream_id: String,
    storage: Arc<dyn StorageService>,
    ffmpeg: Arc<transmux::Ffmpeg>,
    link: Arc<LinkClient>,
    events: mpsc::Sender<ProcessorEvent>,
    /// Fragment ids sent and not yet answered, with their batch numbers.
    outstanding: Mutex<HashMap<String, u64>>,
}

impl AudioProcessor {
    pub fn new(
        stream_id: impl Into<String>,
        storage: Arc<dyn StorageService>,
        ffmpeg: Arc<transmux::Ffmpeg>,
        link: Arc<LinkClient>,
        events: mpsc::Sender<ProcessorEvent>,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            storage,
            ffmpeg,
            link,
            events,
            outstanding: Mutex::new(HashMap::new()),
        }
    }

    /// Process one batch: concatenate, demux, ship the audio fragment.
    pub async fn process_batch(&self, batch: Batch) -> Result<()> {
        let batch_number = batch.batch_number;
        match self.process_batch_inner(&batch).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = self
                    .events
                    .send(ProcessorEvent::BatchFailed {
                        batch_number,
                        message: e.to_string(),
                    })
                    .await;
                Err(e)
            }
        }
    }

    async fn process_batch_inner(&self, batch: &Batch) -> Result<()> {
        let batch_number = batch.batch_number;
        let source_path = self.concat_segments(batch).await?;

        let video_path = self.storage.video_path(&self.stream_id, batch_number);
        let audio_path = self.storage.audio_path(&self.stream_id, batch_number);

        transmux::run(
            self.ffmpeg.binary(),
            &transmux::demux_args(&source_path, &video_path, &audio_path),
        )
        .await?;

        let video_size = tokio::fs::metadata(&video_path).await?.len();
        let audio_size = tokio::fs::metadata(&audio_path).await?.len();

        let demuxed = DemuxedOutput {
            batch_number,
            video_path,
            audio_path: audio_path.clone(),
            video_size,
            audio_size,
        };
        debug!(
            batch_number,
            video_size, audio_size, "Batch demuxed into video and audio fragments"
        );
        let _ = self
            .events
            .send(ProcessorEvent::DemuxComplete(demuxed))
            .await;

        let audio_bytes = Bytes::from(tokio::fs::read(&audio_path).await?);
        let descriptor = FragmentDescriptor::new(
            self.stream_id.clone(),
            batch_number,
            "audio/mp4",
            audio_size,
            batch.total_duration,
        );

        self.outstanding
            .lock()
            .insert(descriptor.id.clone(), batch_number);

        if let Err(e) = self.link.send_fragment(descriptor.clone(), audio_bytes).await {
            self.outstanding.lock().remove(&descriptor.id);
            return Err(e.into());
        }

        info!(batch_number, id = %descriptor.id, "Audio fragment sent for processing");
        let _ = self
            .events
            .send(ProcessorEvent::AudioSent { batch_number })
            .await;
        Ok(())
    }

    /// Absorb one link event. Non-fragment events are ignored here.
    pub async fn handle_link_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::FragmentProcessed {
                descriptor, data, ..
            } => {
                if let Err(e) = self.on_fragment_processed(&descriptor, data).await {
                    let batch_number = self.batch_number_for(&descriptor.id);
                    let _ = self
                        .events
                        .send(ProcessorEvent::BatchFailed {
                            batch_number: batch_number.unwrap_or(descriptor.batch_number),
                            message: e.to_string(),
                        })
                        .await;
                }
            }
            LinkEvent::FragmentError {
                fragment_id,
                message,
            } => {
                let batch_number = self.batch_number_for(&fragment_id);
                warn!(id = %fragment_id, "Processor reported fragment error: {message}");
                if let Some(batch_number) = batch_number {
                    let _ = self
                        .events
                        .send(ProcessorEvent::BatchFailed {
                            batch_number,
                            message,
                        })
                        .await;
                }
            }
            _ => {}
        }
    }

    async fn on_fragment_processed(
        &self,
        descriptor: &FragmentDescriptor,
        data: Bytes,
    ) -> Result<()> {
        // Responses match outstanding requests by id, not order. An id we
        // never sent is accepted too, as long as it belongs to this stream.
        let batch_number = match self.batch_number_for(&descriptor.id) {
            Some(n) => n,
            None if descriptor.stream_id == self.stream_id => {
                batch_number_of(&descriptor.id).ok_or_else(|| {
                    Error::Other(format!("Unparseable fragment id '{}'", descriptor.id))
                })?
            }
            None => {
                warn!(id = %descriptor.id, "Ignoring response for a foreign stream");
                return Ok(());
            }
        };

        let path = self
            .storage
            .processed_audio_path(&self.stream_id, batch_number);
        let size = data.len() as u64;
        tokio::fs::write(&path, &data).await?;

        if let Err(e) = self.link.ack_fragment(descriptor.id.clone()).await {
            debug!(id = %descriptor.id, "Ack failed: {e}");
        }

        info!(batch_number, size, "Processed audio received");
        let _ = self
            .events
            .send(ProcessorEvent::AudioProcessed(ProcessedAudio {
                batch_number,
                audio_path: path,
                size,
            }))
            .await;
        Ok(())
    }

    /// Remove and return the outstanding batch number for a fragment id.
    fn batch_number_for(&self, fragment_id: &str) -> Option<u64> {
        self.outstanding.lock().remove(fragment_id)
    }

    /// Byte-concatenate the batch's segment files into one container.
    async fn concat_segments(&self, batch: &Batch) -> Result<PathBuf> {
        let path = self
            .storage
            .batch_source_path(&self.stream_id, batch.batch_number);
        let mut dest = tokio::fs::File::create(&path).await?;

        for segment in &batch.segments {
            let mut source = tokio::fs::File::open(&segment.path).await.map_err(|e| {
                Error::Storage(format!(
                    "Segment file {} missing: {e}",
                    segment.path.display()
                ))
            })?;
            tokio::io::copy(&mut source, &mut dest).await?;
        }

        dest.flush().await?;
        Ok(path)
    }
}
