// src/models.rs

use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// One contiguous byte range of the remote resource, downloaded into its own file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentSpec {
    pub index: usize,
    /// First byte of the range (inclusive).
    pub start: u64,
    /// Last byte of the range (inclusive), as sent in the `range` header.
    pub end: u64,
    /// Exact size the finished segment file must have.
    pub segment_size: u64,
    pub path: PathBuf,
}

impl SegmentSpec {
    /// Value of the `range` header asking for everything after `offset` bytes
    /// of this segment.
    pub fn range_header(&self, offset: u64) -> String {
        format!("bytes={}-{}", self.start + offset, self.end)
    }
}

/// The plan of a segmented download. Immutable once created; only the
/// segment files on disk grow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentTable {
    pub url: String,
    pub etag: Option<String>,
    pub segment_count: usize,
    pub segments: Vec<SegmentSpec>,
}

impl SegmentTable {
    /// Total number of bytes covered by the plan.
    pub fn total_size(&self) -> u64 {
        self.segments.iter().map(|s| s.segment_size).sum()
    }
}

/// Per-worker progress. Owned by one worker, read by the coordinator.
#[derive(Debug, Default)]
pub struct DownloadState {
    pub worker_id: usize,
    bytes_transferred: AtomicU64,
    completed: AtomicBool,
}

impl DownloadState {
    pub fn new(worker_id: usize) -> Self {
        Self {
            worker_id,
            ..Default::default()
        }
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.load(Ordering::Relaxed)
    }

    pub fn set_bytes_transferred(&self, bytes: u64) {
        self.bytes_transferred.store(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: u64) {
        self.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn mark_completed(&self) {
        self.completed.store(true, Ordering::SeqCst);
    }
}

/// Terminal result of one download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Completed,
    Cancelled,
    Failed,
}

/// The status of a download, as seen from outside the coordinator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DownloadStatus {
    Queued,
    Downloading,
    Completed,
    Cancelled,
    Failed,
}

impl From<Outcome> for DownloadStatus {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Completed => DownloadStatus::Completed,
            Outcome::Cancelled => DownloadStatus::Cancelled,
            Outcome::Failed => DownloadStatus::Failed,
        }
    }
}

/// Returns `path` with `suffix` appended to its final component,
/// e.g. `/tmp/file.zip` + `.json` -> `/tmp/file.zip.json`.
pub fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Temporary file holding segment `index` of `destination`.
pub fn segment_path(destination: &Path, index: usize) -> PathBuf {
    append_suffix(destination, &format!(".{index}.bin"))
}
