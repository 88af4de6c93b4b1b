// src/merger.rs

use crate::manifest::{self, ManifestError};
use crate::models::segment_path;
use crate::worker::CHUNK_SIZE;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to remove {path}: {source}")]
    Remove {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to remove manifest: {0}")]
    Manifest(#[from] ManifestError),
}

/// Concatenates the segment files of `destination` in index order, deleting
/// each one once its bytes are in the destination, then deletes the manifest.
///
/// On error the manifest and all not yet consumed segment files stay behind.
pub async fn merge(destination: &Path, segment_count: usize) -> Result<(), MergeError> {
    let open_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| MergeError::Open { path, source }
    };
    let write_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| MergeError::Write { path, source }
    };

    let dest = File::create(destination)
        .await
        .map_err(open_err(destination))?;
    let mut writer = BufWriter::with_capacity(CHUNK_SIZE, dest);

    for index in 0..segment_count {
        let path = segment_path(destination, index);
        let segment = File::open(&path).await.map_err(open_err(&path))?;
        let mut reader = BufReader::with_capacity(CHUNK_SIZE, segment);
        let copied = tokio::io::copy_buf(&mut reader, &mut writer)
            .await
            .map_err(write_err(destination))?;
        // Flush before the segment file is gone.
        writer.flush().await.map_err(write_err(destination))?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|source| MergeError::Remove {
                path: path.clone(),
                source,
            })?;
        debug!(segment = index, bytes = copied, "merged segment");
    }

    writer
        .into_inner()
        .sync_all()
        .await
        .map_err(write_err(destination))?;
    manifest::remove(destination).await?;
    info!(path = %destination.display(), segments = segment_count, "merge complete");
    Ok(())
}
