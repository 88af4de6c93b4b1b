// src/planner.rs

use crate::manifest::{self, Manifest, ManifestError};
use crate::models::{segment_path, SegmentSpec, SegmentTable};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

/// Files below this size never use more than `SMALL_FILE_SEGMENTS` segments.
pub const SMALL_FILE_LIMIT: u64 = 50 * 1024 * 1024;
pub const SMALL_FILE_SEGMENTS: usize = 5;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("cannot plan {segments} segment(s) for a resource of {size} bytes")]
    InvalidPlan { size: u64, segments: usize },
    #[error("failed to persist manifest: {0}")]
    Manifest(#[from] ManifestError),
}

/// Applies the small-file rule to a requested segment count.
pub fn clamp_segments(requested: usize, size: u64) -> usize {
    if requested > SMALL_FILE_SEGMENTS && size < SMALL_FILE_LIMIT {
        SMALL_FILE_SEGMENTS
    } else {
        requested
    }
}

/// Splits `[0, size - 1]` into `segment_count` inclusive ranges.
///
/// Boundaries sit at `floor(size / segment_count * i)`; the last one is pinned
/// to `size` so the final segment always ends on the last byte.
pub fn partition(destination: &Path, size: u64, segment_count: usize) -> Vec<SegmentSpec> {
    let partition_size = size as f64 / segment_count as f64;
    let boundary = |i: usize| -> u64 {
        if i == segment_count {
            size
        } else {
            ((partition_size * i as f64) as u64).min(size)
        }
    };

    (0..segment_count)
        .map(|index| {
            let start = boundary(index);
            let end = boundary(index + 1) - 1;
            SegmentSpec {
                index,
                start,
                end,
                segment_size: end - start + 1,
                path: segment_path(destination, index),
            }
        })
        .collect()
}

/// Computes the segment table for `url`, reusing the segment count of an
/// existing manifest when it was recorded for the same url and validator.
/// The manifest is rewritten before returning.
pub async fn plan(
    url: &str,
    destination: &Path,
    requested_segments: usize,
    size: u64,
    etag: Option<&str>,
) -> Result<SegmentTable, PlanError> {
    if size == 0 || requested_segments < 1 {
        return Err(PlanError::InvalidPlan {
            size,
            segments: requested_segments,
        });
    }

    let mut segment_count = clamp_segments(requested_segments, size);
    if let Some(existing) = manifest::load(destination).await {
        if existing.matches(url, etag) {
            debug!(
                segments = existing.segments,
                "resuming with segment count from manifest"
            );
            segment_count = existing.segments;
        }
    }
    // Segments must each hold at least one byte.
    let segment_count = segment_count.min(usize::try_from(size).unwrap_or(usize::MAX));

    manifest::save(
        destination,
        &Manifest {
            url: url.to_string(),
            etag: etag.map(str::to_string),
            segments: segment_count,
        },
    )
    .await?;

    info!(url, size, segments = segment_count, "planned segmented download");
    Ok(SegmentTable {
        url: url.to_string(),
        etag: etag.map(str::to_string),
        segment_count,
        segments: partition(destination, size, segment_count),
    })
}
