//! HLS ingestion: polls the manifest and turns new entries into segments on
//! disk, feeding the batch buffer.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::buffer::{Batch, BufferManager, Segment};
use crate::error::Result;
use crate::storage::StorageService;

pub mod playlist;

use playlist::{ManifestEntry, PlaylistClient, resolve_uri};

/// Events emitted by the fetcher.
#[derive(Debug)]
pub enum FetcherEvent {
    SegmentDownloaded(Segment),
    BatchReady(Batch),
    /// Transient fetch failure; polling continues.
    Error(String),
}

/// Fetcher session settings.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub source_url: Url,
    pub stream_id: String,
    pub poll_interval: Duration,
}

/// Handle to the polling task.
pub struct StreamFetcher {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl StreamFetcher {
    /// Spawn the polling task.
    ///
    /// The buffer is shared so the status surface can observe accumulation
    /// between polls.
    pub fn spawn(
        config: FetcherConfig,
        http: reqwest::Client,
        storage: Arc<dyn StorageService>,
        buffer: Arc<Mutex<BufferManager>>,
        events: mpsc::Sender<FetcherEvent>,
    ) -> Self {
        let token = CancellationToken::new();
        let task = tokio::spawn(run_fetcher(
            config,
            http,
            storage,
            buffer,
            events,
            token.clone(),
        ));
        Self { token, task }
    }

    /// Halt polling and flush any accumulated (possibly short) batch.
    pub async fn stop(self) {
        self.token.cancel();
        let _ = self.task.await;
    }
}

async fn run_fetcher(
    config: FetcherConfig,
    http: reqwest::Client,
    storage: Arc<dyn StorageService>,
    buffer: Arc<Mutex<BufferManager>>,
    events: mpsc::Sender<FetcherEvent>,
    token: CancellationToken,
) {
    let playlist_client = PlaylistClient::new(http.clone());

    // Re-pointed to the resolved variant after the first master fetch.
    let mut media_url = config.source_url.clone();
    let mut last_sequence: Option<u64> = None;
    let mut segment_counter: u64 = 0;

    let mut interval = tokio::time::interval(config.poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!(stream_id = %config.stream_id, source = %config.source_url, "Fetcher started");

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }

        let snapshot = match playlist_client.fetch(&media_url).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(stream_id = %config.stream_id, "Manifest fetch failed: {e}");
                let _ = events
                    .send(FetcherEvent::Error(format!("Manifest fetch failed: {e}")))
                    .await;
                continue;
            }
        };

        if snapshot.url != media_url {
            debug!(variant = %snapshot.url, "Following variant playlist");
            media_url = snapshot.url.clone();
        }

        for entry in &snapshot.entries {
            if token.is_cancelled() {
                break;
            }
            if last_sequence.is_some_and(|last| entry.sequence <= last) {
                continue;
            }

            match download_segment(
                &http,
                storage.as_ref(),
                &config.stream_id,
                &media_url,
                entry,
                segment_counter,
            )
            .await
            {
                Ok(segment) => {
                    last_sequence = Some(entry.sequence);
                    segment_counter += 1;

                    debug!(
                        stream_id = %config.stream_id,
                        sequence = segment.sequence,
                        size = segment.size,
                        "Segment downloaded"
                    );
                    let emitted = {
                        let mut buffer = buffer.lock();
                        buffer.add_segment(segment.clone())
                    };
                    let _ = events.send(FetcherEvent::SegmentDownloaded(segment)).await;
                    if let Some(batch) = emitted {
                        let _ = events.send(FetcherEvent::BatchReady(batch)).await;
                    }
                }
                Err(e) => {
                    // The sequence was not recorded, so the next poll retries it.
                    warn!(
                        stream_id = %config.stream_id,
                        sequence = entry.sequence,
                        "Segment download failed: {e}"
                    );
                    let _ = events
                        .send(FetcherEvent::Error(format!(
                            "Segment {} download failed: {e}",
                            entry.sequence
                        )))
                        .await;
                    break;
                }
            }
        }
    }

    // Late arrivals are not lost on stop.
    let flushed = buffer.lock().flush();
    if let Some(batch) = flushed {
        info!(
            stream_id = %config.stream_id,
            batch_number = batch.batch_number,
            "Flushing partial batch on stop"
        );
        let _ = events.send(FetcherEvent::BatchReady(batch)).await;
    }

    info!(stream_id = %config.stream_id, "Fetcher stopped");
}

/// Download one segment to disk with bounded memory.
async fn download_segment(
    http: &reqwest::Client,
    storage: &dyn StorageService,
    stream_id: &str,
    base_url: &Url,
    entry: &ManifestEntry,
    counter: u64,
) -> Result<Segment> {
    let segment_url = resolve_uri(base_url, &entry.uri)?;
    let response = http.get(segment_url.clone()).send().await?;
    let response = response.error_for_status()?;

    let local_id = format!("seg-{counter}");
    let path = storage.segment_path(stream_id, &local_id);

    let mut file = tokio::fs::File::create(&path).await?;
    let mut stream = response.bytes_stream();
    let mut size: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        size += chunk.len() as u64;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;

    Ok(Segment {
        sequence: entry.sequence,
        local_id,
        uri: entry.uri.clone(),
        duration: entry.duration,
        path,
        size,
    })
}
