// src/downloader.rs

use crate::filename::filename;
use crate::integrity::{self, IntegrityError};
use crate::merger::{self, MergeError};
use crate::models::{DownloadState, DownloadStatus, Outcome};
use crate::options::{DownloadOptions, RequestOptions};
use crate::planner::{self, PlanError};
use crate::session::Session;
use crate::worker::{SegmentWorker, SingleStreamWorker};
use reqwest::header::{HeaderMap, ACCEPT_RANGES, CONTENT_LENGTH, ETAG};
use reqwest::{Client, Url};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Errors that end a download before workers can report an outcome.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error("integrity check failed to run: {0}")]
    Integrity(#[from] IntegrityError),
    #[error("invalid url")]
    InvalidUrl,
}

/// What the server told us about the resource before downloading it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub size: Option<u64>,
    pub accepts_ranges: bool,
    /// Strong validator, without quotes or weak prefix.
    pub etag: Option<String>,
    /// Name suggested by the server or the URL.
    pub filename: String,
}

impl ResourceInfo {
    pub fn from_headers(url: &str, headers: &HeaderMap) -> Self {
        let size = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok());
        let accepts_ranges = headers
            .get_all(ACCEPT_RANGES)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.split(',').any(|unit| unit.trim().eq_ignore_ascii_case("bytes")));
        let etag = headers
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().trim_start_matches("W/").trim_matches('"').to_string())
            .filter(|v| !v.is_empty());
        Self {
            size,
            accepts_ranges,
            etag,
            filename: filename(url, headers),
        }
    }

    /// Size to plan segments over, if the resource can be fetched in ranges.
    pub fn segmented_size(&self) -> Option<u64> {
        match self.size {
            Some(size) if self.accepts_ranges && size > 0 => Some(size),
            _ => None,
        }
    }
}

/// Supervises the download of one URL to one destination.
#[derive(Debug)]
pub struct Downloader {
    client: Client,
    options: DownloadOptions,
    request: Arc<RequestOptions>,
    session: Session,
    status: Mutex<DownloadStatus>,
    total_size: AtomicU64,
    workers: Mutex<Vec<Arc<DownloadState>>>,
}

impl Downloader {
    /// Create a new downloader with provided options.
    pub fn new(options: DownloadOptions) -> Result<Self, DownloadError> {
        Url::parse(&options.url).map_err(|_| DownloadError::InvalidUrl)?;
        let client = options.request.build_client()?;
        Ok(Self {
            client,
            request: Arc::new(options.request.clone()),
            options,
            session: Session::new(),
            status: Mutex::new(DownloadStatus::Queued),
            total_size: AtomicU64::new(0),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Probe the resource and download it.
    pub async fn execute(&self) -> Result<Outcome, DownloadError> {
        self.set_status(DownloadStatus::Downloading).await;
        let info = match self.probe().await {
            Ok(info) => info,
            Err(e) => {
                self.set_status(DownloadStatus::Failed).await;
                return Err(e);
            }
        };
        self.download(&info).await
    }

    /// Asks the server for size, range support and validator.
    pub async fn probe(&self) -> Result<ResourceInfo, DownloadError> {
        let response = self
            .request
            .head(&self.client, &self.options.url)
            .send()
            .await?
            .error_for_status()?;
        let info = ResourceInfo::from_headers(&self.options.url, response.headers());
        info!(
            url = %self.options.url,
            size = ?info.size,
            ranges = info.accepts_ranges,
            etag = ?info.etag,
            "probed resource"
        );
        Ok(info)
    }

    /// Download a resource already described by `info`, retrying failed
    /// attempts up to the configured number of times.
    pub async fn download(&self, info: &ResourceInfo) -> Result<Outcome, DownloadError> {
        self.set_status(DownloadStatus::Downloading).await;
        let result = self.download_with_retries(info).await;
        let status = match &result {
            Ok(outcome) => (*outcome).into(),
            Err(_) => DownloadStatus::Failed,
        };
        self.set_status(status).await;
        result
    }

    async fn download_with_retries(&self, info: &ResourceInfo) -> Result<Outcome, DownloadError> {
        if let Some(parent) = self.options.destination.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut attempts = 0;
        let outcome = loop {
            let outcome = self.download_once(info, &self.session.retry()).await?;
            if outcome == Outcome::Failed && attempts < self.options.retries {
                attempts += 1;
                warn!(
                    url = %self.options.url,
                    attempt = attempts,
                    "download attempt failed, resuming"
                );
                continue;
            }
            break outcome;
        };

        if outcome != Outcome::Completed {
            return Ok(outcome);
        }
        if let Some(expected) = self.options.sha256.as_deref() {
            if !integrity::verify_sha256(&self.options.destination, expected).await? {
                warn!(path = %self.options.destination.display(), "sha256 mismatch");
                return Ok(Outcome::Failed);
            }
        }
        Ok(Outcome::Completed)
    }

    /// Internal method to perform one attempt at downloading.
    async fn download_once(
        &self,
        info: &ResourceInfo,
        session: &Session,
    ) -> Result<Outcome, DownloadError> {
        let url = &self.options.url;
        let destination = &self.options.destination;
        let tracker = TaskTracker::new();

        let Some(size) = info.segmented_size() else {
            self.total_size.store(info.size.unwrap_or(0), Ordering::SeqCst);
            let state = Arc::new(DownloadState::new(0));
            *self.workers.lock().await = vec![state.clone()];
            info!(url = %url, "downloading as a single stream");
            tracker.spawn(
                SingleStreamWorker {
                    url: url.clone(),
                    destination: destination.clone(),
                    client: self.client.clone(),
                    options: self.request.clone(),
                    session: session.clone(),
                    state: state.clone(),
                }
                .run(),
            );
            tracker.close();
            tracker.wait().await;
            return Ok(assess(session, &[state]));
        };

        let table = planner::plan(
            url,
            destination,
            self.options.segments,
            size,
            info.etag.as_deref(),
        )
        .await?;
        self.total_size.store(size, Ordering::SeqCst);

        let states: Vec<_> = (0..table.segment_count)
            .map(|id| Arc::new(DownloadState::new(id)))
            .collect();
        *self.workers.lock().await = states.clone();

        for (spec, state) in table.segments.iter().zip(&states) {
            tracker.spawn(
                SegmentWorker {
                    spec: spec.clone(),
                    url: table.url.clone(),
                    client: self.client.clone(),
                    options: self.request.clone(),
                    session: session.clone(),
                    state: state.clone(),
                }
                .run(),
            );
        }
        tracker.close();
        tracker.wait().await;

        let outcome = assess(session, &states);
        if outcome == Outcome::Completed {
            merger::merge(destination, table.segment_count).await?;
        }
        Ok(outcome)
    }

    /// Request cooperative cancellation of all workers.
    pub fn stop(&self) {
        self.session.stop();
    }

    /// Bytes transferred so far, summed over all workers of the current attempt.
    pub async fn downloaded(&self) -> u64 {
        self.workers
            .lock()
            .await
            .iter()
            .map(|state| state.bytes_transferred())
            .sum()
    }

    /// Size of the resource, 0 while unknown.
    pub fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::SeqCst)
    }

    /// Get the current progress as a fraction in range 0.0..=1.0 if known.
    pub async fn progress(&self) -> Option<f32> {
        let total = self.total_size();
        if total == 0 {
            return None;
        }
        Some(self.downloaded().await as f32 / total as f32)
    }

    /// Get the current status of the download.
    pub async fn status(&self) -> DownloadStatus {
        *self.status.lock().await
    }

    async fn set_status(&self, status: DownloadStatus) {
        *self.status.lock().await = status;
    }
}

/// Decides the outcome of an attempt once all of its workers have exited.
fn assess(session: &Session, states: &[Arc<DownloadState>]) -> Outcome {
    if session.is_failed() {
        Outcome::Failed
    } else if session.is_stopped() {
        Outcome::Cancelled
    } else if states.iter().all(|state| state.is_completed()) {
        Outcome::Completed
    } else {
        let incomplete: Vec<_> = states
            .iter()
            .filter(|state| !state.is_completed())
            .map(|state| state.worker_id)
            .collect();
        warn!(?incomplete, "workers finished without completing");
        Outcome::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{self, manifest_path};
    use crate::models::segment_path;
    use mockito::{Matcher, Server, ServerGuard};
    use reqwest::header::{HeaderValue, CONTENT_DISPOSITION};
    use std::path::{Path, PathBuf};

    fn content(size: usize) -> Vec<u8> {
        (0..size).map(|i| (i % 251) as u8).collect()
    }

    fn ranged(size: u64, etag: Option<&str>) -> ResourceInfo {
        ResourceInfo {
            size: Some(size),
            accepts_ranges: true,
            etag: etag.map(str::to_string),
            filename: "file".to_string(),
        }
    }

    fn downloader(server: &ServerGuard, dest: &Path, segments: usize) -> Downloader {
        Downloader::new(DownloadOptions {
            url: format!("{}/file", server.url()),
            destination: dest.to_path_buf(),
            segments,
            ..Default::default()
        })
        .unwrap()
    }

    async fn mock_range(
        server: &mut ServerGuard,
        data: &[u8],
        start: usize,
        end: usize,
    ) -> mockito::Mock {
        server
            .mock("GET", "/file")
            .match_header("range", format!("bytes={start}-{end}").as_str())
            .with_status(206)
            .with_body(&data[start..=end])
            .create_async()
            .await
    }

    fn leftovers(dest: &Path, segments: usize) -> Vec<PathBuf> {
        (0..segments)
            .map(|i| segment_path(dest, i))
            .chain(std::iter::once(manifest_path(dest)))
            .filter(|p| p.exists())
            .collect()
    }

    #[test]
    fn resource_info_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("1000"));
        headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        headers.insert(ETAG, HeaderValue::from_static("W/\"abc123\""));
        headers.insert(
            CONTENT_DISPOSITION,
            HeaderValue::from_static("attachment; filename=\"data.bin\""),
        );
        let info = ResourceInfo::from_headers("http://h/x", &headers);
        assert_eq!(info.size, Some(1000));
        assert!(info.accepts_ranges);
        assert_eq!(info.etag.as_deref(), Some("abc123"));
        assert_eq!(info.filename, "data.bin");
        assert_eq!(info.segmented_size(), Some(1000));
    }

    #[test]
    fn segmented_only_with_ranges_and_length() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("1000"));
        headers.insert(ACCEPT_RANGES, HeaderValue::from_static("none"));
        assert_eq!(ResourceInfo::from_headers("http://h/x", &headers).segmented_size(), None);

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        assert_eq!(ResourceInfo::from_headers("http://h/x", &headers).segmented_size(), None);

        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
        assert_eq!(ResourceInfo::from_headers("http://h/x", &headers).segmented_size(), None);
    }

    #[test]
    fn invalid_url_is_rejected() {
        let result = Downloader::new(DownloadOptions {
            url: "not a url".to_string(),
            ..Default::default()
        });
        assert!(matches!(result, Err(DownloadError::InvalidUrl)));
    }

    #[tokio::test]
    async fn segmented_download_merges_and_cleans_up() {
        let mut server = Server::new_async().await;
        let data = content(1000);
        let mut mocks = Vec::new();
        for (start, end) in [(0, 249), (250, 499), (500, 749), (750, 999)] {
            mocks.push(mock_range(&mut server, &data, start, end).await);
        }
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("nested").join("out.bin");
        let dl = downloader(&server, &dest, 4);

        let outcome = dl.download(&ranged(1000, Some("v1"))).await.unwrap();

        assert_eq!(outcome, Outcome::Completed);
        for mock in mocks {
            mock.assert_async().await;
        }
        assert_eq!(std::fs::read(&dest).unwrap(), data);
        assert!(leftovers(&dest, 4).is_empty());
        assert_eq!(dl.downloaded().await, 1000);
        assert_eq!(dl.progress().await, Some(1.0));
        assert_eq!(dl.status().await, DownloadStatus::Completed);
    }

    #[tokio::test]
    async fn failed_worker_fails_download_without_merge() {
        let mut server = Server::new_async().await;
        let data = content(100);
        server
            .mock("GET", "/file")
            .match_header("range", "bytes=0-49")
            .with_status(500)
            .create_async()
            .await;
        mock_range(&mut server, &data, 50, 99).await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let dl = downloader(&server, &dest, 2);

        let outcome = dl.download(&ranged(100, Some("v1"))).await.unwrap();

        assert_eq!(outcome, Outcome::Failed);
        assert!(!dest.exists());
        assert!(manifest_path(&dest).exists());
        assert_eq!(dl.status().await, DownloadStatus::Failed);
    }

    #[tokio::test]
    async fn failed_worker_interrupts_stalled_sibling() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/file")
            .match_header("range", "bytes=0-49")
            .with_status(500)
            .create_async()
            .await;
        server
            .mock("GET", "/file")
            .match_header("range", "bytes=50-99")
            .with_status(206)
            .with_chunked_body(|w| {
                w.write_all(&[1u8; 10])?;
                w.flush()?;
                std::thread::sleep(std::time::Duration::from_secs(5));
                w.write_all(&[1u8; 40])
            })
            .create_async()
            .await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let dl = downloader(&server, &dest, 2);

        let started = std::time::Instant::now();
        let outcome = tokio::time::timeout(
            std::time::Duration::from_secs(3),
            dl.download(&ranged(100, Some("v1"))),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(outcome, Outcome::Failed);
        assert!(started.elapsed() < std::time::Duration::from_secs(3));
        assert!(!dest.exists());
        assert!(manifest_path(&dest).exists());
        let partial = std::fs::metadata(segment_path(&dest, 1)).map_or(0, |m| m.len());
        assert!(partial < 50);
    }

    #[tokio::test]
    async fn stopped_download_is_cancelled_and_keeps_state() {
        let mut server = Server::new_async().await;
        let mock = server.mock("GET", "/file").expect(0).create_async().await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let dl = downloader(&server, &dest, 2);
        dl.stop();
        dl.stop();

        let outcome = dl.download(&ranged(100, Some("v1"))).await.unwrap();

        assert_eq!(outcome, Outcome::Cancelled);
        mock.assert_async().await;
        assert!(manifest_path(&dest).exists());
        assert!(!dest.exists());
        assert_eq!(dl.status().await, DownloadStatus::Cancelled);
    }

    #[tokio::test]
    async fn resume_fetches_only_missing_bytes() {
        let mut server = Server::new_async().await;
        let data = content(100);
        let missing = mock_range(&mut server, &data, 70, 99).await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        manifest::save(
            &dest,
            &manifest::Manifest {
                url: format!("{}/file", server.url()),
                etag: Some("v1".into()),
                segments: 2,
            },
        )
        .await
        .unwrap();
        std::fs::write(segment_path(&dest, 0), &data[..50]).unwrap();
        std::fs::write(segment_path(&dest, 1), &data[50..70]).unwrap();
        // Asking for more segments must not change the recorded plan.
        let dl = downloader(&server, &dest, 4);

        let outcome = dl.download(&ranged(100, Some("v1"))).await.unwrap();

        assert_eq!(outcome, Outcome::Completed);
        missing.assert_async().await;
        assert_eq!(std::fs::read(&dest).unwrap(), data);
        assert!(leftovers(&dest, 2).is_empty());
    }

    #[tokio::test]
    async fn short_segment_without_retries_fails() {
        let mut server = Server::new_async().await;
        let data = content(100);
        server
            .mock("GET", "/file")
            .match_header("range", "bytes=0-49")
            .with_status(206)
            .with_body(&data[..20])
            .create_async()
            .await;
        mock_range(&mut server, &data, 50, 99).await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let dl = downloader(&server, &dest, 2);

        let outcome = dl.download(&ranged(100, Some("v1"))).await.unwrap();

        assert_eq!(outcome, Outcome::Failed);
        assert_eq!(std::fs::metadata(segment_path(&dest, 0)).unwrap().len(), 20);
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn retries_resume_short_segments() {
        let mut server = Server::new_async().await;
        let data = content(100);
        server
            .mock("GET", "/file")
            .match_header("range", "bytes=0-49")
            .with_status(206)
            .with_body(&data[..20])
            .create_async()
            .await;
        let rest = mock_range(&mut server, &data, 20, 49).await;
        mock_range(&mut server, &data, 50, 99).await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let dl = Downloader::new(DownloadOptions {
            url: format!("{}/file", server.url()),
            destination: dest.clone(),
            segments: 2,
            retries: 1,
            ..Default::default()
        })
        .unwrap();

        let outcome = dl.download(&ranged(100, Some("v1"))).await.unwrap();

        assert_eq!(outcome, Outcome::Completed);
        rest.assert_async().await;
        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    #[tokio::test]
    async fn single_stream_without_range_support() {
        let mut server = Server::new_async().await;
        let data = content(300);
        let mock = server
            .mock("GET", "/file")
            .match_header("range", Matcher::Missing)
            .with_body(&data)
            .create_async()
            .await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let dl = downloader(&server, &dest, 4);
        let info = ResourceInfo {
            accepts_ranges: false,
            ..ranged(300, None)
        };

        let outcome = dl.download(&info).await.unwrap();

        assert_eq!(outcome, Outcome::Completed);
        mock.assert_async().await;
        assert_eq!(std::fs::read(&dest).unwrap(), data);
        assert!(!manifest_path(&dest).exists());
        assert_eq!(dl.downloaded().await, 300);
    }

    #[tokio::test]
    async fn checksum_mismatch_fails_but_keeps_file() {
        let mut server = Server::new_async().await;
        let data = content(100);
        mock_range(&mut server, &data, 0, 99).await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let dl = Downloader::new(DownloadOptions {
            url: format!("{}/file", server.url()),
            destination: dest.clone(),
            segments: 1,
            sha256: Some("00".repeat(32)),
            ..Default::default()
        })
        .unwrap();

        let outcome = dl.download(&ranged(100, None)).await.unwrap();

        assert_eq!(outcome, Outcome::Failed);
        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    #[tokio::test]
    async fn execute_probes_then_downloads() {
        let mut server = Server::new_async().await;
        let data = content(100);
        server
            .mock("HEAD", "/file")
            .with_header("accept-ranges", "bytes")
            .with_header("etag", "\"v1\"")
            .with_body(&data)
            .create_async()
            .await;
        mock_range(&mut server, &data, 0, 49).await;
        mock_range(&mut server, &data, 50, 99).await;
        server
            .mock("GET", "/file")
            .match_header("range", Matcher::Missing)
            .with_body(&data)
            .create_async()
            .await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let dl = downloader(&server, &dest, 2);

        let outcome = dl.execute().await.unwrap();

        assert_eq!(outcome, Outcome::Completed);
        assert_eq!(std::fs::read(&dest).unwrap(), data);
        assert!(leftovers(&dest, 2).is_empty());
    }

    #[tokio::test]
    async fn failed_probe_is_an_error() {
        let mut server = Server::new_async().await;
        server
            .mock("HEAD", "/file")
            .with_status(404)
            .create_async()
            .await;
        let dir = tempfile::tempdir().unwrap();
        let dl = downloader(&server, &dir.path().join("out.bin"), 2);

        assert!(matches!(dl.execute().await, Err(DownloadError::Network(_))));
        assert_eq!(dl.status().await, DownloadStatus::Failed);
    }
}
