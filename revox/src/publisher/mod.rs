//! Stream publishing: one long-running transmuxer subprocess whose stdin is
//! fed remuxed fragments and whose output is an RTMP or SRT publish.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use transmux::{PublishProcess, PublishTarget};

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::remux::RemuxedOutput;
use crate::storage::StorageService;

pub mod chunker;

pub use chunker::{ChunkError, ChunkStats, ChunkerConfig};

/// Publisher lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PublisherState {
    Idle,
    Starting,
    Publishing,
    Reconnecting,
    Stopping,
    /// Reconnect attempts exceeded; terminal until an external `start`.
    Failed,
}

/// Events emitted by the publisher.
#[derive(Debug)]
pub enum PublisherEvent {
    Started,
    FragmentComplete {
        batch_number: u64,
        chunks: u64,
        bytes: u64,
    },
    FragmentPublished { batch_number: u64 },
    Reconnecting { attempt: u32 },
    Reconnected,
    Stopped,
    Error { message: String },
}

/// Publisher session settings.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub stream_id: String,
    pub target: PublishTarget,
    pub chunk_size: usize,
    pub rate_limit_bps: u64,
    pub use_rate_limit: bool,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub max_segments_to_keep: usize,
    pub cleanup_safety_buffer: usize,
    pub enable_cleanup: bool,
    pub drain_timeout: Duration,
    pub stop_grace: Duration,
}

impl PublisherConfig {
    pub fn new(stream_id: impl Into<String>, target: PublishTarget) -> Self {
        Self::from_pipeline(&PipelineConfig::default(), stream_id, target)
    }

    pub fn from_pipeline(
        pipeline: &PipelineConfig,
        stream_id: impl Into<String>,
        target: PublishTarget,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            target,
            chunk_size: pipeline.chunk_size,
            rate_limit_bps: pipeline.rate_limit_bps,
            use_rate_limit: pipeline.use_rate_limit,
            max_reconnect_attempts: pipeline.max_reconnect_attempts,
            reconnect_delay: pipeline.reconnect_delay(),
            max_segments_to_keep: pipeline.max_segments_to_keep,
            cleanup_safety_buffer: pipeline.cleanup_safety_buffer,
            enable_cleanup: pipeline.enable_cleanup,
            drain_timeout: Duration::from_secs(30),
            stop_grace: Duration::from_secs(5),
        }
    }

    fn chunker(&self) -> ChunkerConfig {
        ChunkerConfig {
            chunk_size: self.chunk_size,
            rate_limit_bps: self.rate_limit_bps,
            drain_timeout: self.drain_timeout,
        }
    }

    fn retention_limit(&self) -> usize {
        self.max_segments_to_keep + self.cleanup_safety_buffer
    }
}

/// One fragment to publish, with the source segments that become eligible
/// for cleanup once it leaves the retention window.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub fragment: RemuxedOutput,
    pub segment_paths: Vec<PathBuf>,
}

struct WindowEntry {
    batch_number: u64,
    segment_paths: Vec<PathBuf>,
}

/// Long-running publisher with in-order delivery, reconnection, and a
/// bounded on-disk retention window.
///
/// `publish` is safe to call concurrently; calls are totally ordered by a
/// FIFO queue keyed by arrival order.
pub struct StreamPublisher {
    config: PublisherConfig,
    ffmpeg: Arc<transmux::Ffmpeg>,
    storage: Arc<dyn StorageService>,
    events: mpsc::Sender<PublisherEvent>,
    state: Mutex<PublisherState>,
    reconnect_attempts: AtomicU32,
    /// The helper owned while a session runs.
    process: tokio::sync::Mutex<Option<PublishProcess>>,
    /// FIFO serialization of fragment streaming; tokio mutexes queue fairly.
    queue: tokio::sync::Mutex<()>,
    window: Mutex<Vec<WindowEntry>>,
}

impl StreamPublisher {
    pub fn new(
        config: PublisherConfig,
        ffmpeg: Arc<transmux::Ffmpeg>,
        storage: Arc<dyn StorageService>,
        events: mpsc::Sender<PublisherEvent>,
    ) -> Self {
        Self {
            config,
            ffmpeg,
            storage,
            events,
            state: Mutex::new(PublisherState::Idle),
            reconnect_attempts: AtomicU32::new(0),
            process: tokio::sync::Mutex::new(None),
            queue: tokio::sync::Mutex::new(()),
            window: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> PublisherState {
        *self.state.lock()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Number of entries currently tracked by the retention window.
    pub fn published_count(&self) -> usize {
        self.window.lock().len()
    }

    /// Spawn the publish helper and enter the Publishing state.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                PublisherState::Idle | PublisherState::Failed => {
                    *state = PublisherState::Starting;
                }
                other => {
                    return Err(Error::publish(format!(
                        "Publisher cannot start from state {other:?}"
                    )));
                }
            }
        }

        match self.spawn_helper() {
            Ok(process) => {
                info!(
                    stream_id = %self.config.stream_id,
                    pid = ?process.id(),
                    "Publish helper started"
                );
                *self.process.lock().await = Some(process);
                *self.state.lock() = PublisherState::Publishing;
                self.reconnect_attempts.store(0, Ordering::SeqCst);
                let _ = self.events.send(PublisherEvent::Started).await;
                Ok(())
            }
            Err(e) => {
                *self.state.lock() = PublisherState::Failed;
                let _ = self
                    .events
                    .send(PublisherEvent::Error {
                        message: format!("Failed to start publish helper: {e}"),
                    })
                    .await;
                Err(e.into())
            }
        }
    }

    /// Stream one fragment into the helper.
    ///
    /// Returns when streaming completed or has failed into a reconnect. A
    /// missing fragment file is a hard failure.
    pub async fn publish(&self, request: PublishRequest) -> Result<()> {
        let batch_number = request.fragment.batch_number;
        let path = request.fragment.output_path.clone();

        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let message = format!(
                "Fragment file {} missing for batch {batch_number}",
                path.display()
            );
            let _ = self
                .events
                .send(PublisherEvent::Error {
                    message: message.clone(),
                })
                .await;
            return Err(Error::publish(message));
        }

        // Total order by arrival; no chunk of fragment N+1 is written before
        // fragment N's last chunk.
        let _serialized = self.queue.lock().await;

        match self.state() {
            PublisherState::Publishing => {}
            other => {
                return Err(Error::publish(format!(
                    "Publisher is not publishing (state {other:?})"
                )));
            }
        }

        let result = {
            let mut guard = self.process.lock().await;
            let Some(process) = guard.as_mut() else {
                return Err(Error::publish("Publish helper is not running"));
            };
            chunker::stream_file(&self.config.chunker(), &path, process).await
        };

        match result {
            Ok(stats) => {
                info!(
                    batch_number,
                    chunks = stats.chunks,
                    bytes = stats.bytes,
                    "Fragment published"
                );
                let _ = self
                    .events
                    .send(PublisherEvent::FragmentComplete {
                        batch_number,
                        chunks: stats.chunks,
                        bytes: stats.bytes,
                    })
                    .await;
                let _ = self
                    .events
                    .send(PublisherEvent::FragmentPublished { batch_number })
                    .await;
                self.record_published(request).await;
                Ok(())
            }
            Err(e) if e.is_reconnectable() => {
                // The fragment is abandoned, not retried; observers see one
                // bounded discontinuity.
                warn!(batch_number, "Publish failed, reconnecting: {e}");
                self.reconnect().await;
                Ok(())
            }
            Err(e) => {
                let message = format!("Publish of batch {batch_number} failed: {e}");
                let _ = self
                    .events
                    .send(PublisherEvent::Error {
                        message: message.clone(),
                    })
                    .await;
                Err(Error::publish(message))
            }
        }
    }

    /// End the stdin stream, wait out the grace period, then force-terminate.
    ///
    /// Calling `stop` twice is a no-op.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state == PublisherState::Idle {
                return Ok(());
            }
            *state = PublisherState::Stopping;
        }

        if let Some(process) = self.process.lock().await.take() {
            let code = process.terminate(self.config.stop_grace).await;
            info!(
                stream_id = %self.config.stream_id,
                exit_code = ?code,
                "Publish helper stopped"
            );
        }

        *self.state.lock() = PublisherState::Idle;
        let _ = self.events.send(PublisherEvent::Stopped).await;
        Ok(())
    }

    fn spawn_helper(&self) -> transmux::Result<PublishProcess> {
        let args = transmux::publish_args(
            &self.config.target,
            &self.config.stream_id,
            self.config.use_rate_limit,
        );
        PublishProcess::spawn(self.ffmpeg.binary(), &args)
    }

    /// Reconnection loop: tear down the dead helper, wait, respawn. Resets
    /// the attempt counter on success; enters Failed once attempts are
    /// exhausted.
    async fn reconnect(&self) {
        *self.state.lock() = PublisherState::Reconnecting;

        loop {
            let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let _ = self
                .events
                .send(PublisherEvent::Reconnecting { attempt })
                .await;
            warn!(
                stream_id = %self.config.stream_id,
                attempt,
                "Reconnecting publish helper"
            );

            if let Some(old) = self.process.lock().await.take() {
                old.kill().await;
            }

            tokio::time::sleep(self.config.reconnect_delay).await;

            match self.spawn_helper() {
                Ok(process) => {
                    *self.process.lock().await = Some(process);
                    self.reconnect_attempts.store(0, Ordering::SeqCst);
                    *self.state.lock() = PublisherState::Publishing;
                    info!(stream_id = %self.config.stream_id, "Publish helper reconnected");
                    let _ = self.events.send(PublisherEvent::Reconnected).await;
                    return;
                }
                Err(e) => {
                    warn!(
                        stream_id = %self.config.stream_id,
                        attempt,
                        "Respawn failed: {e}"
                    );
                    if attempt >= self.config.max_reconnect_attempts {
                        *self.state.lock() = PublisherState::Failed;
                        let _ = self
                            .events
                            .send(PublisherEvent::Error {
                                message: "Max reconnection attempts reached".to_string(),
                            })
                            .await;
                        return;
                    }
                }
            }
        }
    }

    /// Append to the retention window and evict beyond the limit. Cleanup
    /// failures are logged, never propagated.
    async fn record_published(&self, request: PublishRequest) {
        let evicted: Vec<WindowEntry> = {
            let mut window = self.window.lock();
            window.push(WindowEntry {
                batch_number: request.fragment.batch_number,
                segment_paths: request.segment_paths,
            });
            if !self.config.enable_cleanup {
                return;
            }
            let limit = self.config.retention_limit();
            if window.len() > limit {
                let excess = window.len() - limit;
                window.drain(..excess).collect()
            } else {
                Vec::new()
            }
        };

        for entry in evicted {
            if let Err(e) = self
                .storage
                .remove_batch_files(&self.config.stream_id, entry.batch_number)
                .await
            {
                warn!(
                    batch_number = entry.batch_number,
                    "Batch cleanup failed: {e}"
                );
            }
            for path in entry.segment_paths {
                if let Err(e) = self.storage.remove_file(&path).await {
                    warn!(path = %path.display(), "Segment cleanup failed: {e}");
                }
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::storage::FsStorage;
    use std::os::unix::fs::PermissionsExt;

    struct Fixture {
        _dir: tempfile::TempDir,
        storage: Arc<FsStorage>,
        events: mpsc::Receiver<PublisherEvent>,
        publisher: StreamPublisher,
        helper_path: PathBuf,
    }

    /// A stand-in helper that consumes stdin like the real transmuxer.
    fn write_helper_script(dir: &std::path::Path, body: &str) -> PathBuf {
        let path = dir.join("fake-transmuxer.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    async fn fixture(script_body: &str, tweak: impl FnOnce(&mut PublisherConfig)) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FsStorage::new(dir.path()));
        storage.init_stream("s1").await.unwrap();

        let helper_path = write_helper_script(dir.path(), script_body);
        let ffmpeg = Arc::new(transmux::Ffmpeg::with_binary(
            helper_path.to_string_lossy().into_owned(),
        ));

        let mut config = PublisherConfig::new(
            "s1",
            PublishTarget::Rtmp {
                base_url: "rtmp://127.0.0.1/live".to_string(),
            },
        );
        config.reconnect_delay = Duration::from_millis(20);
        config.stop_grace = Duration::from_millis(500);
        tweak(&mut config);

        let (events_tx, events) = mpsc::channel(64);
        let publisher = StreamPublisher::new(config, ffmpeg, storage.clone(), events_tx);
        Fixture {
            _dir: dir,
            storage,
            events,
            publisher,
            helper_path,
        }
    }

    async fn write_fragment(storage: &FsStorage, batch_number: u64, size: usize) -> PublishRequest {
        let path = storage.output_path("s1", batch_number);
        tokio::fs::write(&path, vec![0u8; size]).await.unwrap();
        PublishRequest {
            fragment: RemuxedOutput {
                batch_number,
                output_path: path,
                size: size as u64,
            },
            segment_paths: Vec::new(),
        }
    }

    async fn next_event(events: &mut mpsc::Receiver<PublisherEvent>) -> PublisherEvent {
        tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("event deadline")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn publishes_in_order_and_tracks_window() {
        let mut fx = fixture("exec cat > /dev/null", |c| {
            c.max_segments_to_keep = 1;
            c.cleanup_safety_buffer = 1;
        })
        .await;

        fx.publisher.start().await.unwrap();
        assert!(matches!(next_event(&mut fx.events).await, PublisherEvent::Started));
        assert_eq!(fx.publisher.state(), PublisherState::Publishing);

        for n in 0..4u64 {
            let request = write_fragment(&fx.storage, n, 2048).await;
            fx.publisher.publish(request).await.unwrap();

            match next_event(&mut fx.events).await {
                PublisherEvent::FragmentComplete { batch_number, chunks, bytes } => {
                    assert_eq!(batch_number, n);
                    assert_eq!(chunks, 1);
                    assert_eq!(bytes, 2048);
                }
                other => panic!("unexpected event: {other:?}"),
            }
            match next_event(&mut fx.events).await {
                PublisherEvent::FragmentPublished { batch_number } => {
                    assert_eq!(batch_number, n)
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }

        // Window limit 2: batches 0 and 1 were evicted and deleted.
        assert_eq!(fx.publisher.published_count(), 2);
        assert!(!fx.storage.output_path("s1", 0).exists());
        assert!(!fx.storage.output_path("s1", 1).exists());
        assert!(fx.storage.output_path("s1", 2).exists());
        assert!(fx.storage.output_path("s1", 3).exists());

        fx.publisher.stop().await.unwrap();
        assert_eq!(fx.publisher.state(), PublisherState::Idle);
    }

    #[tokio::test]
    async fn missing_fragment_is_a_hard_failure() {
        let fx = fixture("exec cat > /dev/null", |_| {}).await;
        fx.publisher.start().await.unwrap();

        let request = PublishRequest {
            fragment: RemuxedOutput {
                batch_number: 0,
                output_path: fx.storage.output_path("s1", 0),
                size: 0,
            },
            segment_paths: Vec::new(),
        };
        let err = fx.publisher.publish(request).await.unwrap_err();
        assert!(matches!(err, Error::Publish(_)));
        assert_eq!(fx.publisher.state(), PublisherState::Publishing);

        fx.publisher.stop().await.unwrap();
    }

    #[tokio::test]
    async fn helper_death_triggers_reconnect_and_next_fragment_is_fresh() {
        // The helper consumes a little stdin and dies; the respawned one lives.
        let mut fx = fixture("head -c 1024 > /dev/null; exit 1", |_| {}).await;

        fx.publisher.start().await.unwrap();
        assert!(matches!(next_event(&mut fx.events).await, PublisherEvent::Started));

        // Large enough that the helper dies mid-fragment.
        let request = write_fragment(&fx.storage, 0, 512 * 1024).await;
        fx.publisher.publish(request).await.unwrap();

        match next_event(&mut fx.events).await {
            PublisherEvent::Reconnecting { attempt } => assert_eq!(attempt, 1),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(next_event(&mut fx.events).await, PublisherEvent::Reconnected));
        assert_eq!(fx.publisher.reconnect_attempts(), 0);
        assert_eq!(fx.publisher.state(), PublisherState::Publishing);

        // The failed fragment was not retried and did not enter the window.
        assert_eq!(fx.publisher.published_count(), 0);

        fx.publisher.stop().await.unwrap();
    }

    #[tokio::test]
    async fn reconnect_exhaustion_enters_failed() {
        let mut fx = fixture("head -c 64 > /dev/null; exit 1", |c| {
            c.max_reconnect_attempts = 3;
        })
        .await;

        fx.publisher.start().await.unwrap();
        assert!(matches!(next_event(&mut fx.events).await, PublisherEvent::Started));

        // Remove the helper so every respawn fails.
        std::fs::remove_file(&fx.helper_path).unwrap();

        let request = write_fragment(&fx.storage, 0, 256 * 1024).await;
        fx.publisher.publish(request).await.unwrap();

        for expected in 1..=3u32 {
            match next_event(&mut fx.events).await {
                PublisherEvent::Reconnecting { attempt } => assert_eq!(attempt, expected),
                other => panic!("unexpected event: {other:?}"),
            }
        }
        match next_event(&mut fx.events).await {
            PublisherEvent::Error { message } => {
                assert_eq!(message, "Max reconnection attempts reached")
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(fx.publisher.state(), PublisherState::Failed);
    }

    #[tokio::test]
    async fn stop_twice_is_a_no_op() {
        let fx = fixture("exec cat > /dev/null", |_| {}).await;
        fx.publisher.start().await.unwrap();
        fx.publisher.stop().await.unwrap();
        fx.publisher.stop().await.unwrap();
        assert_eq!(fx.publisher.state(), PublisherState::Idle);
    }

    #[tokio::test]
    async fn start_while_publishing_is_rejected() {
        let fx = fixture("exec cat > /dev/null", |_| {}).await;
        fx.publisher.start().await.unwrap();
        assert!(fx.publisher.start().await.is_err());
        fx.publisher.stop().await.unwrap();
    }

    #[tokio::test]
    async fn cleanup_disabled_keeps_everything() {
        let mut fx = fixture("exec cat > /dev/null", |c| {
            c.enable_cleanup = false;
            c.max_segments_to_keep = 1;
            c.cleanup_safety_buffer = 0;
        })
        .await;

        fx.publisher.start().await.unwrap();
        assert!(matches!(next_event(&mut fx.events).await, PublisherEvent::Started));

        for n in 0..5u64 {
            let request = write_fragment(&fx.storage, n, 128).await;
            fx.publisher.publish(request).await.unwrap();
            // Drain the two per-fragment events.
            next_event(&mut fx.events).await;
            next_event(&mut fx.events).await;
        }
        assert_eq!(fx.publisher.published_count(), 5);
        for n in 0..5u64 {
            assert!(fx.storage.output_path("s1", n).exists());
        }
        fx.publisher.stop().await.unwrap();
    }
}
