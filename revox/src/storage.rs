//! On-disk storage tree.
//!
//! The layout is the only cross-stage state:
//!
//! ```text
//! {storage}/
//!   original_stream/{stream_id}/seg-{counter}.ts
//!   processed_fragments/{stream_id}/batch-src-{N}.ts
//!                                   video-{N}.mp4
//!                                   audio-{N}.mp4
//!                                   audio-processed-{N}.mp4
//!                                   batch-{N}.mp4
//!   logs/{stream_id}/
//! ```
//!
//! One producer per path by convention; no lockfiles.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{Error, Result};

const ORIGINAL_DIR: &str = "original_stream";
const PROCESSED_DIR: &str = "processed_fragments";
const LOGS_DIR: &str = "logs";

/// Storage seam between the pipeline stages and the filesystem.
#[async_trait]
pub trait StorageService: Send + Sync {
    fn root(&self) -> &Path;

    /// Path for a downloaded source segment.
    fn segment_path(&self, stream_id: &str, local_id: &str) -> PathBuf;

    /// Path for the concatenated batch container handed to the demuxer.
    fn batch_source_path(&self, stream_id: &str, batch_number: u64) -> PathBuf;

    /// Path for the demuxed video-only fragment.
    fn video_path(&self, stream_id: &str, batch_number: u64) -> PathBuf;

    /// Path for the demuxed audio-only fragment.
    fn audio_path(&self, stream_id: &str, batch_number: u64) -> PathBuf;

    /// Path for the processor's returned audio.
    fn processed_audio_path(&self, stream_id: &str, batch_number: u64) -> PathBuf;

    /// Path for the remuxed output fragment.
    fn output_path(&self, stream_id: &str, batch_number: u64) -> PathBuf;

    /// Per-stream log directory.
    fn stream_log_dir(&self, stream_id: &str) -> PathBuf;

    /// Create the per-stream directories.
    async fn init_stream(&self, stream_id: &str) -> Result<()>;

    /// Delete a single file, tolerating its absence.
    async fn remove_file(&self, path: &Path) -> Result<()>;

    /// Delete every per-batch file for one batch number.
    async fn remove_batch_files(&self, stream_id: &str, batch_number: u64) -> Result<()>;

    /// Delete a stream's directories, returning the bytes reclaimed.
    async fn clean_stream(&self, stream_id: &str) -> Result<u64>;

    /// Delete all stream data under the root, returning the bytes reclaimed.
    async fn clean_all(&self) -> Result<u64>;
}

/// Filesystem-backed storage.
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the root directory tree.
    pub async fn init(&self) -> Result<()> {
        for dir in [ORIGINAL_DIR, PROCESSED_DIR, LOGS_DIR] {
            tokio::fs::create_dir_all(self.root.join(dir)).await?;
        }
        Ok(())
    }

    fn original_dir(&self, stream_id: &str) -> PathBuf {
        self.root.join(ORIGINAL_DIR).join(stream_id)
    }

    fn processed_dir(&self, stream_id: &str) -> PathBuf {
        self.root.join(PROCESSED_DIR).join(stream_id)
    }

    async fn dir_size(path: &Path) -> u64 {
        let mut total = 0u64;
        let mut stack = vec![path.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
                continue;
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let Ok(file_type) = entry.file_type().await else {
                    continue;
                };
                if file_type.is_dir() {
                    stack.push(entry.path());
                } else if let Ok(meta) = entry.metadata().await {
                    total += meta.len();
                }
            }
        }
        total
    }

    async fn remove_dir(path: &Path) -> Result<u64> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(0);
        }
        let size = Self::dir_size(path).await;
        tokio::fs::remove_dir_all(path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to remove {}: {e}", path.display())))?;
        Ok(size)
    }
}

#[async_trait]
impl StorageService for FsStorage {
    fn root(&self) -> &Path {
        &self.root
    }

    fn segment_path(&self, stream_id: &str, local_id: &str) -> PathBuf {
        self.original_dir(stream_id).join(format!("{local_id}.ts"))
    }

    fn batch_source_path(&self, stream_id: &str, batch_number: u64) -> PathBuf {
        self.processed_dir(stream_id)
            .join(format!("batch-src-{batch_number}.ts"))
    }

    fn video_path(&self, stream_id: &str, batch_number: u64) -> PathBuf {
        self.processed_dir(stream_id)
            .join(format!("video-{batch_number}.mp4"))
    }

    fn audio_path(&self, stream_id: &str, batch_number: u64) -> PathBuf {
        self.processed_dir(stream_id)
            .join(format!("audio-{batch_number}.mp4"))
    }

    fn processed_audio_path(&self, stream_id: &str, batch_number: u64) -> PathBuf {
        self.processed_dir(stream_id)
            .join(format!("audio-processed-{batch_number}.mp4"))
    }

    fn output_path(&self, stream_id: &str, batch_number: u64) -> PathBuf {
        self.processed_dir(stream_id)
            .join(format!("batch-{batch_number}.mp4"))
    }

    fn stream_log_dir(&self, stream_id: &str) -> PathBuf {
        self.root.join(LOGS_DIR).join(stream_id)
    }

    async fn init_stream(&self, stream_id: &str) -> Result<()> {
        tokio::fs::create_dir_all(self.original_dir(stream_id)).await?;
        tokio::fs::create_dir_all(self.processed_dir(stream_id)).await?;
        tokio::fs::create_dir_all(self.stream_log_dir(stream_id)).await?;
        debug!(stream_id, root = %self.root.display(), "Initialized stream storage");
        Ok(())
    }

    async fn remove_file(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!(
                "Failed to remove {}: {e}",
                path.display()
            ))),
        }
    }

    async fn remove_batch_files(&self, stream_id: &str, batch_number: u64) -> Result<()> {
        let paths = [
            self.output_path(stream_id, batch_number),
            self.batch_source_path(stream_id, batch_number),
            self.video_path(stream_id, batch_number),
            self.audio_path(stream_id, batch_number),
            self.processed_audio_path(stream_id, batch_number),
        ];
        for path in paths {
            if let Err(e) = self.remove_file(&path).await {
                warn!(stream_id, batch_number, "Cleanup failure: {e}");
            }
        }
        Ok(())
    }

    async fn clean_stream(&self, stream_id: &str) -> Result<u64> {
        let mut reclaimed = 0;
        reclaimed += Self::remove_dir(&self.original_dir(stream_id)).await?;
        reclaimed += Self::remove_dir(&self.processed_dir(stream_id)).await?;
        Ok(reclaimed)
    }

    async fn clean_all(&self) -> Result<u64> {
        let mut reclaimed = 0;
        reclaimed += Self::remove_dir(&self.root.join(ORIGINAL_DIR)).await?;
        reclaimed += Self::remove_dir(&self.root.join(PROCESSED_DIR)).await?;
        self.init().await?;
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> (tempfile::TempDir, FsStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());
        (dir, storage)
    }

    #[tokio::test]
    async fn init_stream_creates_layout() {
        let (_dir, storage) = storage();
        storage.init().await.unwrap();
        storage.init_stream("s1").await.unwrap();

        assert!(storage.segment_path("s1", "seg-0").parent().unwrap().is_dir());
        assert!(storage.output_path("s1", 0).parent().unwrap().is_dir());
        assert!(storage.stream_log_dir("s1").is_dir());
    }

    #[tokio::test]
    async fn paths_follow_layout() {
        let (_dir, storage) = storage();
        let path = storage.segment_path("s1", "seg-4");
        assert!(path.ends_with("original_stream/s1/seg-4.ts"));

        let path = storage.processed_audio_path("s1", 9);
        assert!(path.ends_with("processed_fragments/s1/audio-processed-9.mp4"));

        let path = storage.output_path("s1", 9);
        assert!(path.ends_with("processed_fragments/s1/batch-9.mp4"));
    }

    #[tokio::test]
    async fn remove_batch_files_tolerates_missing() {
        let (_dir, storage) = storage();
        storage.init_stream("s1").await.unwrap();

        tokio::fs::write(storage.output_path("s1", 2), b"out").await.unwrap();
        tokio::fs::write(storage.video_path("s1", 2), b"vid").await.unwrap();

        storage.remove_batch_files("s1", 2).await.unwrap();
        assert!(!storage.output_path("s1", 2).exists());
        assert!(!storage.video_path("s1", 2).exists());

        // Nothing exists for batch 3; still succeeds.
        storage.remove_batch_files("s1", 3).await.unwrap();
    }

    #[tokio::test]
    async fn clean_all_reclaims_and_reinitializes() {
        let (_dir, storage) = storage();
        storage.init().await.unwrap();
        storage.init_stream("s1").await.unwrap();
        tokio::fs::write(storage.output_path("s1", 0), vec![0u8; 128])
            .await
            .unwrap();

        let reclaimed = storage.clean_all().await.unwrap();
        assert!(reclaimed >= 128);
        assert!(storage.root().join("original_stream").is_dir());
        assert!(!storage.output_path("s1", 0).exists());
    }
}
