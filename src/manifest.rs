// src/manifest.rs

use crate::models::append_suffix;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("manifest serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The resume record kept next to the destination file as `<dest>.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub url: String,
    pub etag: Option<String>,
    pub segments: usize,
}

impl Manifest {
    /// Whether a plan recorded for this manifest may be reused for `url`/`etag`.
    /// Without a validator nothing is ever reused.
    pub fn matches(&self, url: &str, etag: Option<&str>) -> bool {
        match etag {
            Some(etag) => self.url == url && self.etag.as_deref() == Some(etag),
            None => false,
        }
    }
}

/// Location of the manifest belonging to `destination`.
pub fn manifest_path(destination: &Path) -> PathBuf {
    append_suffix(destination, ".json")
}

/// Loads the manifest for `destination`. Missing, unreadable or malformed
/// manifests all read as `None`.
pub async fn load(destination: &Path) -> Option<Manifest> {
    let path = manifest_path(destination);
    let data = match tokio::fs::read(&path).await {
        Ok(data) => data,
        Err(_) => return None,
    };
    match serde_json::from_slice::<Manifest>(&data) {
        Ok(manifest) if manifest.segments > 0 => Some(manifest),
        Ok(_) => {
            debug!(path = %path.display(), "ignoring manifest with zero segments");
            None
        }
        Err(e) => {
            debug!(path = %path.display(), "ignoring unparsable manifest: {e}");
            None
        }
    }
}

/// Writes the manifest and syncs it to disk before returning.
pub async fn save(destination: &Path, manifest: &Manifest) -> Result<(), ManifestError> {
    let data = serde_json::to_vec_pretty(manifest)?;
    let mut file = tokio::fs::File::create(manifest_path(destination)).await?;
    file.write_all(&data).await?;
    file.sync_all().await?;
    Ok(())
}

/// Deletes the manifest. A manifest that is already gone is not an error.
pub async fn remove(destination: &Path) -> Result<(), ManifestError> {
    match tokio::fs::remove_file(manifest_path(destination)).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
