//! Artifact transfer
//!
//! Streams a single artifact into a `<file>.download` sibling and atomically
//! renames it into place once complete. The temporary file is removed on every
//! failure or cancellation path before the error reaches the caller.

use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use common::error::{Error, Result};
use common::models::DownloadProgress;
use common::utils::format_bytes;

use crate::catalog::ArtifactSpec;
use crate::source::ArtifactSource;

/// Suffix of in-flight transfer files
pub const TEMP_SUFFIX: &str = "download";

/// Progress callback shared by every transfer of one download
pub type ProgressCallback<'a> = &'a (dyn Fn(DownloadProgress) + Send + Sync);

/// Temporary path for an artifact destination
pub fn temp_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(TEMP_SUFFIX);
    dest.with_file_name(name)
}

/// Deletes the temporary file when dropped unless the transfer was committed
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed partial download {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove partial download {}: {}", self.path.display(), e),
        }
    }
}

/// Combined, rate-limited progress across all artifacts of one variant
pub struct ProgressTracker<'a> {
    /// Bytes accounted for so far
    bytes_done: u64,

    /// Bytes expected in total
    bytes_total: u64,

    /// Minimum delay between emissions
    interval: Duration,

    /// Time of the last emission
    last_emit: Option<Instant>,

    /// Receiver of progress snapshots
    callback: ProgressCallback<'a>,
}

impl<'a> ProgressTracker<'a> {
    /// Creates a tracker over `bytes_total` bytes
    pub fn new(bytes_total: u64, interval: Duration, callback: ProgressCallback<'a>) -> Self {
        Self {
            bytes_done: 0,
            bytes_total,
            interval,
            last_emit: None,
            callback,
        }
    }

    /// Counts bytes that need no transfer
    pub fn skip(&mut self, bytes: u64) {
        self.bytes_done += bytes;
    }

    /// Replaces an estimated artifact size with the announced one
    pub fn correct_total(&mut self, expected: u64, announced: u64) {
        self.bytes_total = self.bytes_total.saturating_sub(expected) + announced;
    }

    /// Counts transferred bytes and emits if the interval elapsed
    pub fn advance(&mut self, bytes: u64, message: &str) {
        self.bytes_done += bytes;

        let due = self
            .last_emit
            .map(|last| last.elapsed() >= self.interval)
            .unwrap_or(true);
        if due {
            self.emit(message);
        }
    }

    /// Emits unconditionally
    pub fn emit(&mut self, message: &str) {
        self.last_emit = Some(Instant::now());
        let bytes_done = self.bytes_done.min(self.bytes_total);
        debug!(bytes_done, bytes_total = self.bytes_total, "{}", message);

        (self.callback)(DownloadProgress {
            bytes_done,
            bytes_total: self.bytes_total,
            message: message.to_string(),
        });
    }

    /// Emits a final 100% snapshot
    pub fn finish(&mut self, message: &str) {
        self.bytes_done = self.bytes_total;
        self.emit(message);
    }

    /// Bytes accounted for so far
    pub fn bytes_done(&self) -> u64 {
        self.bytes_done
    }
}

/// Downloads one artifact to `dest`, returning the number of bytes written
pub async fn fetch_artifact(
    source: &dyn ArtifactSource,
    spec: &ArtifactSpec,
    dest: &Path,
    tracker: &mut ProgressTracker<'_>,
    cancel: &CancellationToken,
) -> Result<u64> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        response = source.open(&spec.url) => response?,
    };

    if let Some(announced) = response.content_length {
        if announced != spec.expected_size {
            debug!(
                "Server announced {} for {}, catalog expects {}",
                format_bytes(announced),
                spec.file_name,
                format_bytes(spec.expected_size)
            );
            tracker.correct_total(spec.expected_size, announced);
        }
    }

    let temp = temp_path(dest);
    let guard = TempFileGuard::new(temp.clone());
    let mut file = File::create(&temp).await?;

    let message = format!("Downloading {}", spec.file_name);
    let mut body = response.body;
    let mut written = 0u64;

    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            chunk = body.next() => chunk,
        };

        let Some(chunk) = chunk else { break };
        let chunk = chunk?;

        file.write_all(&chunk)
            .await
            .map_err(|e| Error::Download(format!("writing {}: {}", temp.display(), e)))?;

        written += chunk.len() as u64;
        tracker.advance(chunk.len() as u64, &message);
    }

    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    if let Some(announced) = response.content_length {
        if written != announced {
            return Err(Error::Download(format!(
                "{} truncated: received {} of {} bytes",
                spec.file_name, written, announced
            )));
        }
    }

    tokio::fs::rename(&temp, dest).await.map_err(|e| {
        Error::Download(format!("moving {} into place: {}", temp.display(), e))
    })?;
    guard.commit();

    debug!("Downloaded {} ({})", spec.file_name, format_bytes(written));

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::memory::MemoryArtifactSource;
    use parking_lot::Mutex;

    fn spec(size: u64) -> ArtifactSpec {
        ArtifactSpec {
            file_name: "tiny.gguf".to_string(),
            url: "mem://tiny".to_string(),
            expected_size: size,
        }
    }

    #[test]
    fn test_temp_path() {
        assert_eq!(
            temp_path(Path::new("/models/a.gguf")),
            PathBuf::from("/models/a.gguf.download")
        );
    }

    #[tokio::test]
    async fn test_fetch_renames_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("tiny.gguf");
        let source = MemoryArtifactSource::new(16).with_body("mem://tiny", vec![7u8; 100]);
        let events = Mutex::new(Vec::new());
        let callback = |p: DownloadProgress| events.lock().push(p);
        let mut tracker = ProgressTracker::new(100, Duration::from_millis(0), &callback);

        let written = fetch_artifact(&source, &spec(100), &dest, &mut tracker, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(written, 100);
        assert_eq!(std::fs::read(&dest).unwrap(), vec![7u8; 100]);
        assert!(!temp_path(&dest).exists());
        assert_eq!(tracker.bytes_done(), 100);
        assert!(!events.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failed_transfer_removes_temp() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("tiny.gguf");
        let mut source = MemoryArtifactSource::new(10).with_body("mem://tiny", vec![1u8; 100]);
        source.fail_after = Some(40);
        let callback = |_: DownloadProgress| {};
        let mut tracker = ProgressTracker::new(100, Duration::from_millis(250), &callback);

        let err = fetch_artifact(&source, &spec(100), &dest, &mut tracker, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.is_download());
        assert!(!dest.exists());
        assert!(!temp_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_rate_limited_progress() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("tiny.gguf");
        let source = MemoryArtifactSource::new(1).with_body("mem://tiny", vec![0u8; 200]);
        let events = Mutex::new(0usize);
        let callback = |_: DownloadProgress| *events.lock() += 1;
        let mut tracker = ProgressTracker::new(200, Duration::from_secs(60), &callback);

        fetch_artifact(&source, &spec(200), &dest, &mut tracker, &CancellationToken::new())
            .await
            .unwrap();

        // 200 chunks, one emission: the first one
        assert_eq!(*events.lock(), 1);
    }

    #[test]
    fn test_correct_total() {
        let callback = |_: DownloadProgress| {};
        let mut tracker = ProgressTracker::new(1_000, Duration::from_millis(250), &callback);
        tracker.correct_total(800, 900);
        tracker.finish("done");
        assert_eq!(tracker.bytes_done(), 1_100);
    }
}
