//! Integration coverage: HLS ingestion into batches, and the publisher's
//! retention window, driven against in-process stand-ins.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{Router, extract::Path, routing::get};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use url::Url;

use revox::buffer::BufferManager;
use revox::fetcher::{FetcherConfig, FetcherEvent, StreamFetcher};
use revox::storage::{FsStorage, StorageService};

const MEDIA_MANIFEST: &str = "#EXTM3U\n\
#EXT-X-VERSION:3\n\
#EXT-X-TARGETDURATION:2\n\
#EXT-X-MEDIA-SEQUENCE:0\n\
#EXTINF:2.0,\nseg0.ts\n\
#EXTINF:2.0,\nseg1.ts\n\
#EXTINF:2.0,\nseg2.ts\n\
#EXTINF:2.0,\nseg3.ts\n";

async fn spawn_hls_server() -> SocketAddr {
    let app = Router::new()
        .route("/master.m3u8", get(master_manifest))
        .route("/live.m3u8", get(|| async { MEDIA_MANIFEST }))
        .route("/{segment}", get(segment_bytes));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn master_manifest() -> &'static str {
    "#EXTM3U\n\
     #EXT-X-STREAM-INF:BANDWIDTH=1280000,RESOLUTION=1280x720\n\
     live.m3u8\n"
}

async fn segment_bytes(Path(segment): Path<String>) -> Vec<u8> {
    segment.into_bytes()
}

async fn collect_until_batch(
    events: &mut mpsc::Receiver<FetcherEvent>,
) -> (u64, Vec<u64>, revox::buffer::Batch) {
    let mut downloaded = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("fetcher event deadline")
            .expect("fetcher event channel closed");
        match event {
            FetcherEvent::SegmentDownloaded(segment) => downloaded.push(segment.sequence),
            FetcherEvent::BatchReady(batch) => {
                return (downloaded.len() as u64, downloaded, batch);
            }
            FetcherEvent::Error(message) => panic!("fetcher error: {message}"),
        }
    }
}

#[tokio::test]
async fn segments_accumulate_into_a_batch_and_flush_on_stop() {
    let addr = spawn_hls_server().await;
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(FsStorage::new(dir.path()));
    storage.init_stream("s1").await.unwrap();

    let buffer = Arc::new(Mutex::new(BufferManager::new(6.0)));
    let (events_tx, mut events) = mpsc::channel(64);

    let fetcher = StreamFetcher::spawn(
        FetcherConfig {
            source_url: Url::parse(&format!("http://{addr}/live.m3u8")).unwrap(),
            stream_id: "s1".to_string(),
            poll_interval: Duration::from_millis(50),
        },
        reqwest::Client::new(),
        storage.clone() as Arc<dyn StorageService>,
        buffer.clone(),
        events_tx,
    );

    // Durations {2, 2, 2, 2} with a 6 s threshold: batch 0 closes on the
    // third segment, the fourth starts batch 1.
    let (_count, downloaded, batch) = collect_until_batch(&mut events).await;
    assert_eq!(downloaded, vec![0, 1, 2]);
    assert_eq!(batch.batch_number, 0);
    assert_eq!(batch.total_duration, 6.0);
    assert_eq!(batch.segments.len(), 3);

    for segment in &batch.segments {
        let bytes = tokio::fs::read(&segment.path).await.unwrap();
        assert!(!bytes.is_empty());
    }

    // The fourth segment arrives; later polls must not re-download any.
    let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        FetcherEvent::SegmentDownloaded(segment) => assert_eq!(segment.sequence, 3),
        other => panic!("unexpected event: {other:?}"),
    }

    // Give the fetcher a few more poll cycles; nothing new may appear.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(buffer.lock().status().segment_count, 1);

    // Stop flushes the partial batch.
    fetcher.stop().await;
    loop {
        match events.recv().await {
            Some(FetcherEvent::BatchReady(batch)) => {
                assert_eq!(batch.batch_number, 1);
                assert_eq!(batch.segments.len(), 1);
                assert_eq!(batch.segments[0].sequence, 3);
                break;
            }
            Some(FetcherEvent::SegmentDownloaded(segment)) => {
                panic!("segment {} downloaded twice", segment.sequence)
            }
            Some(FetcherEvent::Error(message)) => panic!("fetcher error: {message}"),
            None => panic!("fetcher stopped without flushing"),
        }
    }
}

#[tokio::test]
async fn master_manifest_is_followed_to_its_first_variant() {
    let addr = spawn_hls_server().await;
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(FsStorage::new(dir.path()));
    storage.init_stream("s1").await.unwrap();

    let buffer = Arc::new(Mutex::new(BufferManager::new(6.0)));
    let (events_tx, mut events) = mpsc::channel(64);

    let fetcher = StreamFetcher::spawn(
        FetcherConfig {
            source_url: Url::parse(&format!("http://{addr}/master.m3u8")).unwrap(),
            stream_id: "s1".to_string(),
            poll_interval: Duration::from_millis(50),
        },
        reqwest::Client::new(),
        storage.clone() as Arc<dyn StorageService>,
        buffer.clone(),
        events_tx,
    );

    // Segments resolve against the variant playlist URL, so downloads only
    // succeed if the variant was followed.
    let (_count, downloaded, batch) = collect_until_batch(&mut events).await;
    assert_eq!(downloaded, vec![0, 1, 2]);
    assert_eq!(batch.batch_number, 0);

    fetcher.stop().await;
}

#[cfg(unix)]
mod retention {
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use revox::publisher::{
        PublishRequest, PublisherConfig, PublisherEvent, StreamPublisher,
    };
    use revox::remux::RemuxedOutput;
    use revox::storage::{FsStorage, StorageService};
    use transmux::PublishTarget;

    fn write_helper_script(dir: &std::path::Path) -> PathBuf {
        let path = dir.join("fake-transmuxer.sh");
        std::fs::write(&path, "#!/bin/sh\nexec cat > /dev/null\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// maxSegmentsToKeep = 3, cleanupSafetyBuffer = 5: after publishing
    /// batches 0..10, files for 0, 1, 2 are gone, 3..10 remain, and the
    /// window holds 8 entries.
    #[tokio::test]
    async fn sliding_window_keeps_the_last_eight_batches() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FsStorage::new(dir.path()));
        storage.init_stream("s1").await.unwrap();

        let helper = write_helper_script(dir.path());
        let ffmpeg = Arc::new(transmux::Ffmpeg::with_binary(
            helper.to_string_lossy().into_owned(),
        ));

        let config = PublisherConfig::new(
            "s1",
            PublishTarget::Rtmp {
                base_url: "rtmp://127.0.0.1/live".to_string(),
            },
        );
        assert_eq!(config.max_segments_to_keep, 3);
        assert_eq!(config.cleanup_safety_buffer, 5);

        let (events_tx, mut events) = mpsc::channel(256);
        let publisher = StreamPublisher::new(
            config,
            ffmpeg,
            storage.clone() as Arc<dyn StorageService>,
            events_tx,
        );
        publisher.start().await.unwrap();

        for batch_number in 0..=10u64 {
            let fragment_path = storage.output_path("s1", batch_number);
            tokio::fs::write(&fragment_path, vec![0u8; 1024]).await.unwrap();

            let segment_path = storage.segment_path("s1", &format!("seg-{batch_number}"));
            tokio::fs::write(&segment_path, b"ts").await.unwrap();

            publisher
                .publish(PublishRequest {
                    fragment: RemuxedOutput {
                        batch_number,
                        output_path: fragment_path,
                        size: 1024,
                    },
                    segment_paths: vec![segment_path],
                })
                .await
                .unwrap();
        }

        // All eleven publishes succeeded, in order.
        let mut published = Vec::new();
        while published.len() < 11 {
            match tokio::time::timeout(Duration::from_secs(10), events.recv())
                .await
                .unwrap()
                .unwrap()
            {
                PublisherEvent::FragmentPublished { batch_number } => {
                    published.push(batch_number)
                }
                PublisherEvent::Error { message } => panic!("publish error: {message}"),
                _ => {}
            }
        }
        assert_eq!(published, (0..=10).collect::<Vec<_>>());

        assert_eq!(publisher.published_count(), 8);
        for batch_number in 0..=2u64 {
            assert!(!storage.output_path("s1", batch_number).exists());
            assert!(
                !storage
                    .segment_path("s1", &format!("seg-{batch_number}"))
                    .exists()
            );
        }
        for batch_number in 3..=10u64 {
            assert!(storage.output_path("s1", batch_number).exists());
        }

        publisher.stop().await.unwrap();
    }
}
