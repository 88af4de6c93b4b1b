// src/worker.rs

//! Workers that move bytes from the network to disk.
//!
//! A [`SegmentWorker`] owns one segment file and fills it from a ranged
//! request, resuming from whatever is already on disk. A [`SingleStreamWorker`]
//! writes the whole body straight to the destination. Neither returns an error:
//! failures raise the session's error signal and leave the worker incomplete.

use crate::models::{DownloadState, SegmentSpec};
use crate::options::RequestOptions;
use crate::session::Session;
use futures_util::{Stream, StreamExt};
use reqwest::{Client, Response};
use std::path::PathBuf;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, error, warn};

/// Size of the write buffer between the network and the file.
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// A failure while transferring data. Never leaves the worker that hit it.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no data received for {0:?}")]
    Timeout(Duration),
}

/// How a body stream stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    /// The server sent everything it was going to send.
    Finished,
    /// The session asked us to stop first.
    Interrupted,
}

/// Copies `response` into `file`, counting bytes into `state`, until the body
/// ends or the session is interrupted. Buffered data is flushed either way.
async fn stream_to_file(
    response: Response,
    file: File,
    session: &Session,
    state: &DownloadState,
    read_timeout: Duration,
) -> Result<StreamEnd, TransferError> {
    let mut stream = pin!(response.bytes_stream());
    let mut writer = BufWriter::with_capacity(CHUNK_SIZE, file);
    let result = pump(&mut stream, &mut writer, session, state, read_timeout).await;
    let flushed = writer.flush().await;
    let end = result?;
    flushed?;
    Ok(end)
}

async fn pump<S, B>(
    stream: &mut S,
    writer: &mut BufWriter<File>,
    session: &Session,
    state: &DownloadState,
    read_timeout: Duration,
) -> Result<StreamEnd, TransferError>
where
    S: Stream<Item = reqwest::Result<B>> + Unpin,
    B: AsRef<[u8]>,
{
    loop {
        if session.is_interrupted() {
            return Ok(StreamEnd::Interrupted);
        }
        let next = tokio::select! {
            biased;
            _ = session.interrupted() => return Ok(StreamEnd::Interrupted),
            next = tokio::time::timeout(read_timeout, stream.next()) => {
                next.map_err(|_| TransferError::Timeout(read_timeout))?
            }
        };
        let Some(chunk) = next else {
            return Ok(StreamEnd::Finished);
        };
        let chunk = chunk?;
        let bytes = chunk.as_ref();
        writer.write_all(bytes).await?;
        state.add_bytes(bytes.len() as u64);
    }
}

/// Downloads one segment of a segmented download.
pub struct SegmentWorker {
    pub spec: SegmentSpec,
    pub url: String,
    pub client: Client,
    pub options: Arc<RequestOptions>,
    pub session: Session,
    pub state: Arc<DownloadState>,
}

impl SegmentWorker {
    pub async fn run(self) {
        let id = self.state.worker_id;
        match self.download().await {
            Ok(()) => {
                let size = self.state.bytes_transferred();
                if size == self.spec.segment_size {
                    self.state.mark_completed();
                    debug!(worker = id, size, "segment complete");
                } else {
                    debug!(
                        worker = id,
                        size,
                        expected = self.spec.segment_size,
                        "segment left incomplete"
                    );
                }
            }
            Err(e) => {
                self.session.fail();
                error!(worker = id, url = %self.url, "segment download failed: {e}");
            }
        }
    }

    async fn download(&self) -> Result<(), TransferError> {
        let spec = &self.spec;
        let mut curr = 0;
        match tokio::fs::metadata(&spec.path).await {
            Ok(meta) if meta.len() > spec.segment_size => {
                warn!(
                    worker = self.state.worker_id,
                    path = %spec.path.display(),
                    size = meta.len(),
                    expected = spec.segment_size,
                    "segment file is larger than its range, restarting it"
                );
                tokio::fs::remove_file(&spec.path).await?;
            }
            Ok(meta) => curr = meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.state.set_bytes_transferred(curr);

        if curr >= spec.segment_size || self.session.is_interrupted() {
            return Ok(());
        }

        let range = spec.range_header(curr);
        debug!(worker = self.state.worker_id, range = %range, "requesting segment");
        let request = self.options.get(&self.client, &self.url, Some(&range)).send();
        let response = tokio::select! {
            biased;
            _ = self.session.interrupted() => return Ok(()),
            response = request => response?.error_for_status()?,
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.path)
            .await?;
        stream_to_file(
            response,
            file,
            &self.session,
            &self.state,
            self.options.timeout,
        )
        .await?;
        Ok(())
    }
}

/// Downloads a whole resource in one request, for servers without range support.
pub struct SingleStreamWorker {
    pub url: String,
    pub destination: PathBuf,
    pub client: Client,
    pub options: Arc<RequestOptions>,
    pub session: Session,
    pub state: Arc<DownloadState>,
}

impl SingleStreamWorker {
    pub async fn run(self) {
        let id = self.state.worker_id;
        match self.download().await {
            Ok(StreamEnd::Finished) => {
                self.state.mark_completed();
                debug!(worker = id, size = self.state.bytes_transferred(), "stream complete");
            }
            Ok(StreamEnd::Interrupted) => {
                debug!(worker = id, "stream interrupted");
            }
            Err(e) => {
                self.session.fail();
                error!(worker = id, url = %self.url, "download failed: {e}");
            }
        }
    }

    async fn download(&self) -> Result<StreamEnd, TransferError> {
        self.state.set_bytes_transferred(0);
        if self.session.is_interrupted() {
            return Ok(StreamEnd::Interrupted);
        }
        let request = self.options.get(&self.client, &self.url, None).send();
        let response = tokio::select! {
            biased;
            _ = self.session.interrupted() => return Ok(StreamEnd::Interrupted),
            response = request => response?.error_for_status()?,
        };
        let file = File::create(&self.destination).await?;
        stream_to_file(
            response,
            file,
            &self.session,
            &self.state,
            self.options.timeout,
        )
        .await
    }
}
