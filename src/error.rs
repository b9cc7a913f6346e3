//! Error taxonomy for the search, gating, mosaic, and animation stages.
//!
//! Almost every variant is recovered somewhere inside the pipeline: a failed
//! chunk becomes an empty chunk, a tile without a CRS is dropped, a rejected
//! capture is excluded, a failed mosaic skips its group, and a failed
//! animation leaves the capture stack without an animation. Only
//! configuration problems travel to the process boundary, as `anyhow`
//! errors from [`crate::config`].

use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid search window: start {start} is not before end {end}")]
    InvalidWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("chunk size must be positive, got {0}")]
    InvalidChunkSize(chrono::Duration),

    #[error("search for period {chunk} failed: {reason}")]
    ChunkSearchFailure { chunk: String, reason: String },

    #[error("tile {tile_id} has no native CRS tag (proj:epsg)")]
    MissingCrs { tile_id: String },

    #[error("tile {tile_id} uses unsupported CRS EPSG:{epsg}")]
    UnsupportedCrs { tile_id: String, epsg: u32 },

    #[error("tile {tile_id} is missing required property '{field}'")]
    MalformedTile { tile_id: String, field: &'static str },

    #[error("capture {outcome_id} rejected: {reason}")]
    CaptureRejected {
        outcome_id: String,
        reason: RejectReason,
    },

    #[error("mosaic for outcome {outcome_id} abandoned, asset {asset} unusable: {reason}")]
    MosaicAssetFailure {
        outcome_id: String,
        asset: String,
        reason: String,
    },

    #[error("animation not created: {0}")]
    AnimationRenderFailure(String),
}

/// Why the quality gate turned a capture away.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    InsufficientCoverage { tile_count: usize, max_tile_count: usize },
    IncompatibleVersion { version: Option<String> },
    ExcessCloudCover { mean_cloud_cover: f64 },
}

impl RejectReason {
    /// Short machine-friendly label, used in logs and exports.
    pub fn label(&self) -> &'static str {
        match self {
            RejectReason::InsufficientCoverage { .. } => "insufficient coverage",
            RejectReason::IncompatibleVersion { .. } => "incompatible version",
            RejectReason::ExcessCloudCover { .. } => "excess cloud cover",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::InsufficientCoverage {
                tile_count,
                max_tile_count,
            } => write!(
                f,
                "insufficient coverage ({}/{} tiles)",
                tile_count, max_tile_count
            ),
            RejectReason::IncompatibleVersion { version } => write!(
                f,
                "incompatible version ({})",
                version.as_deref().unwrap_or("none")
            ),
            RejectReason::ExcessCloudCover { mean_cloud_cover } => {
                if mean_cloud_cover.is_nan() {
                    write!(f, "excess cloud cover (unknown)")
                } else {
                    write!(f, "excess cloud cover ({:.0}%)", mean_cloud_cover)
                }
            }
        }
    }
}
