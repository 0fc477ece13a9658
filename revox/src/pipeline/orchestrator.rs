//! The orchestrator owns the five stages, wires their events into the next
//! stage's inputs, and exposes start/stop/status to the control surface.
//!
//! Startup order: storage initialized, speech link connected, publisher
//! started, fetcher started. Shutdown is the reverse.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use speech_link::{LinkClient, LinkConfig, LinkEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use transmux::PublishTarget;

use crate::buffer::{Batch, BufferManager};
use crate::config::{ServiceConfig, validate_stream_id};
use crate::error::{Error, Result};
use crate::fetcher::{FetcherConfig, FetcherEvent, StreamFetcher};
use crate::pipeline::{PipelinePhase, PipelineStatus, StartRequest};
use crate::processor::{AudioProcessor, ProcessorEvent};
use crate::publisher::{
    PublishRequest, PublisherConfig, PublisherEvent, StreamPublisher,
};
use crate::remux::{Remuxer, RemuxerEvent};
use crate::storage::StorageService;

const EVENT_CAPACITY: usize = 64;
const BATCH_CAPACITY: usize = 8;

#[derive(Default)]
struct Counters {
    segments_downloaded: AtomicU64,
    batches_emitted: AtomicU64,
    audio_fragments_processed: AtomicU64,
    fragments_published: AtomicU64,
}

/// State shared between the wiring tasks and the status surface.
struct Shared {
    phase: Mutex<PipelinePhase>,
    last_error: Mutex<Option<String>>,
    counters: Counters,
    buffer: Arc<Mutex<BufferManager>>,
    /// Batch number to source-segment paths, for retention cleanup.
    segment_paths: Mutex<HashMap<u64, Vec<PathBuf>>>,
}

impl Shared {
    fn set_phase(&self, phase: PipelinePhase) {
        *self.phase.lock() = phase;
    }

    fn record_error(&self, message: impl Into<String>) {
        let message = message.into();
        warn!("Pipeline error: {message}");
        *self.last_error.lock() = Some(message);
        self.set_phase(PipelinePhase::Error);
    }
}

struct Session {
    stream_id: String,
    shared: Arc<Shared>,
    fetcher: StreamFetcher,
    publisher: Arc<StreamPublisher>,
    link: Arc<LinkClient>,
    tasks: Vec<JoinHandle<()>>,
}

/// Owns the pipeline stages for at most one running session.
pub struct PipelineOrchestrator {
    config: ServiceConfig,
    storage: Arc<dyn StorageService>,
    ffmpeg: Arc<transmux::Ffmpeg>,
    http: reqwest::Client,
    session: tokio::sync::Mutex<Option<Session>>,
}

impl PipelineOrchestrator {
    pub fn new(
        config: ServiceConfig,
        storage: Arc<dyn StorageService>,
        ffmpeg: Arc<transmux::Ffmpeg>,
    ) -> Self {
        Self {
            config,
            storage,
            ffmpeg,
            http: reqwest::Client::new(),
            session: tokio::sync::Mutex::new(None),
        }
    }

    /// Whether a session is currently running.
    pub async fn is_running(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Start a pipeline session.
    pub async fn start(&self, request: StartRequest) -> Result<()> {
        let mut session_slot = self.session.lock().await;
        if session_slot.is_some() {
            return Err(Error::PipelineAlreadyRunning);
        }

        validate_stream_id(&request.stream_id)?;

        let mut pipeline_config = self.config.pipeline.clone();
        if let Some(buffer_duration) = request.buffer_duration {
            pipeline_config.buffer_duration = buffer_duration;
        }
        pipeline_config.validate()?;

        let source_url = Url::parse(&request.source_url)
            .map_err(|e| Error::validation(format!("Invalid source_url: {e}")))?;

        let output_url = request
            .output_url
            .as_deref()
            .unwrap_or(&self.config.output_url);
        let target = PublishTarget::parse(output_url).ok_or_else(|| {
            Error::config(format!("Unsupported output URL '{output_url}'"))
        })?;

        let stream_id = request.stream_id.clone();
        info!(stream_id = %stream_id, source = %source_url, output = output_url, "Starting pipeline");

        self.storage.init_stream(&stream_id).await?;

        // Speech link comes up before any batch can need it; subscribe is
        // queued until the socket is established.
        let (link, link_events) =
            LinkClient::connect(LinkConfig::new(request.audio_processor_url.clone()));
        let link = Arc::new(link);
        link.subscribe(stream_id.clone()).await?;

        let shared = Arc::new(Shared {
            phase: Mutex::new(PipelinePhase::Fetching),
            last_error: Mutex::new(None),
            counters: Counters::default(),
            buffer: Arc::new(Mutex::new(BufferManager::new(
                pipeline_config.buffer_duration,
            ))),
            segment_paths: Mutex::new(HashMap::new()),
        });

        let (publisher_events_tx, publisher_events_rx) = mpsc::channel(EVENT_CAPACITY);
        let publisher = Arc::new(StreamPublisher::new(
            PublisherConfig::from_pipeline(&pipeline_config, stream_id.clone(), target),
            self.ffmpeg.clone(),
            self.storage.clone(),
            publisher_events_tx,
        ));
        if let Err(e) = publisher.start().await {
            link.close().await;
            return Err(e);
        }

        let (processor_events_tx, processor_events_rx) = mpsc::channel(EVENT_CAPACITY);
        let processor = Arc::new(AudioProcessor::new(
            stream_id.clone(),
            self.storage.clone(),
            self.ffmpeg.clone(),
            link.clone(),
            processor_events_tx,
        ));

        let (remux_events_tx, remux_events_rx) = mpsc::channel(EVENT_CAPACITY);
        let remuxer = Remuxer::new(
            stream_id.clone(),
            self.storage.clone(),
            self.ffmpeg.clone(),
            remux_events_tx,
        );

        let (fetcher_events_tx, fetcher_events_rx) = mpsc::channel(EVENT_CAPACITY);
        let fetcher = StreamFetcher::spawn(
            FetcherConfig {
                source_url,
                stream_id: stream_id.clone(),
                poll_interval: pipeline_config.poll_interval(),
            },
            self.http.clone(),
            self.storage.clone(),
            shared.buffer.clone(),
            fetcher_events_tx,
        );

        let tasks = wire_stages(
            shared.clone(),
            processor,
            remuxer,
            publisher.clone(),
            fetcher_events_rx,
            link_events,
            processor_events_rx,
            remux_events_rx,
            publisher_events_rx,
        );

        *session_slot = Some(Session {
            stream_id,
            shared,
            fetcher,
            publisher,
            link,
            tasks,
        });
        Ok(())
    }

    /// Stop the running session. A second call is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let Some(session) = self.session.lock().await.take() else {
            return Ok(());
        };
        info!(stream_id = %session.stream_id, "Stopping pipeline");

        // Reverse of startup: fetcher, publisher, link. In-flight stage work
        // is abandoned with the wiring tasks.
        session.fetcher.stop().await;
        session.publisher.stop().await?;
        if let Err(e) = session.link.unsubscribe(session.stream_id.clone()).await {
            debug!("Unsubscribe on stop failed: {e}");
        }
        session.link.close().await;

        for task in session.tasks {
            task.abort();
        }

        session.shared.set_phase(PipelinePhase::Idle);
        info!(stream_id = %session.stream_id, "Pipeline stopped");
        Ok(())
    }

    /// Consolidated status for the control surface.
    pub async fn status(&self) -> PipelineStatus {
        let session = self.session.lock().await;
        let Some(session) = session.as_ref() else {
            return PipelineStatus::idle();
        };

        let shared = &session.shared;
        PipelineStatus {
            running: true,
            phase: *shared.phase.lock(),
            stream_id: Some(session.stream_id.clone()),
            segments_downloaded: shared.counters.segments_downloaded.load(Ordering::Relaxed),
            batches_emitted: shared.counters.batches_emitted.load(Ordering::Relaxed),
            audio_fragments_processed: shared
                .counters
                .audio_fragments_processed
                .load(Ordering::Relaxed),
            fragments_published: shared.counters.fragments_published.load(Ordering::Relaxed),
            buffer: Some(shared.buffer.lock().status()),
            publisher_state: Some(session.publisher.state()),
            reconnect_attempts: session.publisher.reconnect_attempts(),
            last_error: shared.last_error.lock().clone(),
        }
    }

    /// Remove stored stream data. Refused while a session is running.
    pub async fn clean_storage(&self) -> Result<u64> {
        let session = self.session.lock().await;
        if session.is_some() {
            return Err(Error::validation(
                "Cannot clean storage while a pipeline is running",
            ));
        }
        self.storage.clean_all().await
    }
}

/// Spawn the wiring tasks linking stage outputs to the next stage's inputs.
#[allow(clippy::too_many_arguments)]
fn wire_stages(
    shared: Arc<Shared>,
    processor: Arc<AudioProcessor>,
    remuxer: Remuxer,
    publisher: Arc<StreamPublisher>,
    mut fetcher_events: mpsc::Receiver<FetcherEvent>,
    mut link_events: mpsc::Receiver<LinkEvent>,
    mut processor_events: mpsc::Receiver<ProcessorEvent>,
    mut remux_events: mpsc::Receiver<RemuxerEvent>,
    mut publisher_events: mpsc::Receiver<PublisherEvent>,
) -> Vec<JoinHandle<()>> {
    let mut tasks = Vec::new();

    // Fetcher events: count segments, queue ready batches.
    let (batch_tx, mut batch_rx) = mpsc::channel::<Batch>(BATCH_CAPACITY);
    {
        let shared = shared.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(event) = fetcher_events.recv().await {
                match event {
                    FetcherEvent::SegmentDownloaded(segment) => {
                        shared
                            .counters
                            .segments_downloaded
                            .fetch_add(1, Ordering::Relaxed);
                        debug!(sequence = segment.sequence, "Segment counted");
                    }
                    FetcherEvent::BatchReady(batch) => {
                        shared
                            .counters
                            .batches_emitted
                            .fetch_add(1, Ordering::Relaxed);
                        shared.set_phase(PipelinePhase::Processing);
                        shared
                            .segment_paths
                            .lock()
                            .insert(batch.batch_number, batch.segment_paths());
                        if batch_tx.send(batch).await.is_err() {
                            break;
                        }
                    }
                    FetcherEvent::Error(message) => shared.record_error(message),
                }
            }
        }));
    }

    // Audio processor: one batch at a time.
    {
        let processor = processor.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(batch) = batch_rx.recv().await {
                let batch_number = batch.batch_number;
                if let Err(e) = processor.process_batch(batch).await {
                    debug!(batch_number, "Batch processing failed: {e}");
                }
            }
        }));
    }

    // Speech-link events feed the processor's response handling.
    {
        let shared = shared.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(event) = link_events.recv().await {
                match event {
                    LinkEvent::Connected => debug!("Speech link connected"),
                    LinkEvent::Disconnected { reason } => {
                        warn!("Speech link disconnected: {reason}")
                    }
                    LinkEvent::Subscribed { stream_id } => {
                        debug!(stream_id = %stream_id, "Speech processor subscription confirmed")
                    }
                    LinkEvent::StreamComplete { stream_id } => {
                        info!(stream_id = %stream_id, "Speech processor reported stream complete")
                    }
                    LinkEvent::ProtocolError { message } => {
                        shared.record_error(format!("Speech processor error: {message}"))
                    }
                    LinkEvent::Closed => {
                        shared.record_error("Speech link closed");
                        break;
                    }
                    other => processor.handle_link_event(other).await,
                }
            }
        }));
    }

    // Processor events: processed audio flows into the remuxer.
    {
        let shared = shared.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(event) = processor_events.recv().await {
                match event {
                    ProcessorEvent::DemuxComplete(demuxed) => {
                        debug!(batch_number = demuxed.batch_number, "Demux complete")
                    }
                    ProcessorEvent::AudioSent { batch_number } => {
                        debug!(batch_number, "Audio sent")
                    }
                    ProcessorEvent::AudioProcessed(processed) => {
                        shared
                            .counters
                            .audio_fragments_processed
                            .fetch_add(1, Ordering::Relaxed);
                        let batch_number = processed.batch_number;
                        if let Err(e) = remuxer.on_processed_audio(processed).await {
                            debug!(batch_number, "Remux failed: {e}");
                        }
                    }
                    ProcessorEvent::BatchFailed {
                        batch_number,
                        message,
                    } => {
                        shared.segment_paths.lock().remove(&batch_number);
                        shared.record_error(format!("Batch {batch_number}: {message}"));
                    }
                }
            }
        }));
    }

    // Remux events: completed fragments are queued for publishing.
    let (publish_tx, mut publish_rx) = mpsc::channel::<PublishRequest>(BATCH_CAPACITY);
    {
        let shared = shared.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(event) = remux_events.recv().await {
                match event {
                    RemuxerEvent::RemuxComplete(fragment) => {
                        shared.set_phase(PipelinePhase::Publishing);
                        let segment_paths = shared
                            .segment_paths
                            .lock()
                            .remove(&fragment.batch_number)
                            .unwrap_or_default();
                        let request = PublishRequest {
                            fragment,
                            segment_paths,
                        };
                        if publish_tx.send(request).await.is_err() {
                            break;
                        }
                    }
                    RemuxerEvent::BatchFailed {
                        batch_number,
                        message,
                    } => {
                        shared.segment_paths.lock().remove(&batch_number);
                        shared.record_error(format!("Batch {batch_number}: {message}"));
                    }
                }
            }
        }));
    }

    // Publisher: fragments in remux-completion order, strictly serialized.
    {
        let publisher = publisher.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(request) = publish_rx.recv().await {
                let batch_number = request.fragment.batch_number;
                if let Err(e) = publisher.publish(request).await {
                    debug!(batch_number, "Publish failed: {e}");
                }
            }
        }));
    }

    // Publisher events: counters, phase cycling, error aggregation.
    {
        let shared = shared.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(event) = publisher_events.recv().await {
                match event {
                    PublisherEvent::Started => debug!("Publisher started"),
                    PublisherEvent::FragmentComplete {
                        batch_number,
                        chunks,
                        bytes,
                    } => {
                        debug!(batch_number, chunks, bytes, "Fragment streamed")
                    }
                    PublisherEvent::FragmentPublished { batch_number } => {
                        shared
                            .counters
                            .fragments_published
                            .fetch_add(1, Ordering::Relaxed);
                        shared.set_phase(PipelinePhase::Fetching);
                        info!(batch_number, "Fragment published");
                    }
                    PublisherEvent::Reconnecting { attempt } => {
                        warn!(attempt, "Publisher reconnecting")
                    }
                    PublisherEvent::Reconnected => info!("Publisher reconnected"),
                    PublisherEvent::Stopped => debug!("Publisher stopped"),
                    PublisherEvent::Error { message } => shared.record_error(message),
                }
            }
        }));
    }

    tasks
}
