//! Core data models used throughout tilestack.
//!
//! These types represent the search inputs, the raw catalog items, and the
//! normalized tiles, captures, mosaics, and animations that flow through the
//! search and rendering pipeline.

use chrono::{DateTime, Utc};
use geo::MultiPolygon;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::crs::Crs;
use crate::error::PipelineError;
use crate::geometry::{self, Bounds};
use crate::raster::Raster;

/// Mean kilometres per degree of latitude on a spherical earth.
const KM_PER_DEGREE: f64 = 111.32;

/// Cloud cover assumed for a tile that does not report one; worse than any
/// threshold a caller can configure.
pub const WORST_CLOUD_COVER: f64 = 101.0;

/// Geographic search area (EPSG:4326, x = longitude, y = latitude).
#[derive(Debug, Clone)]
pub struct AreaOfInterest {
    footprint: MultiPolygon<f64>,
    bounds: Bounds,
}

impl AreaOfInterest {
    pub fn from_bbox(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> anyhow::Result<Self> {
        if !(min_lon < max_lon && min_lat < max_lat) {
            anyhow::bail!(
                "invalid bounding box: ({}, {}) .. ({}, {})",
                min_lon,
                min_lat,
                max_lon,
                max_lat
            );
        }
        if min_lon < -180.0 || max_lon > 180.0 || min_lat < -90.0 || max_lat > 90.0 {
            anyhow::bail!("bounding box outside geographic range");
        }
        let bounds = Bounds::new(min_lon, min_lat, max_lon, max_lat);
        Ok(Self {
            footprint: MultiPolygon::new(vec![bounds.to_polygon()]),
            bounds,
        })
    }

    /// Square box `width_km` wide centred on `(lat, lon)`.
    pub fn around(lat: f64, lon: f64, width_km: f64) -> anyhow::Result<Self> {
        if !(width_km > 0.0) {
            anyhow::bail!("AOI width must be positive, got {}", width_km);
        }
        let half_lat = width_km / 2.0 / KM_PER_DEGREE;
        let cos_lat = lat.to_radians().cos().max(1e-6);
        let half_lon = width_km / 2.0 / (KM_PER_DEGREE * cos_lat);
        Self::from_bbox(lon - half_lon, lat - half_lat, lon + half_lon, lat + half_lat)
    }

    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    /// Centre of the bounding box as `(lat, lon)`.
    pub fn center(&self) -> (f64, f64) {
        let (lon, lat) = self.bounds.center();
        (lat, lon)
    }

    pub fn to_geojson(&self) -> serde_json::Value {
        geometry::to_geojson(&self.footprint)
    }
}

/// Half-open search interval `[start, end)` in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl SearchWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, PipelineError> {
        if start >= end {
            return Err(PipelineError::InvalidWindow { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }
}

/// One sub-interval of a [`SearchWindow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DateChunk {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateChunk {
    /// STAC `datetime` interval string, `start/end` in RFC 3339.
    pub fn interval(&self) -> String {
        format!(
            "{}/{}",
            self.start.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            self.end.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        )
    }
}

impl std::fmt::Display for DateChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.interval())
    }
}

/// An item as returned by the catalog, before normalization.
///
/// Every property is optional; the normalizer decides which absences drop
/// the tile and which are tolerated.
#[derive(Debug, Clone, Default)]
pub struct RawItem {
    pub id: String,
    pub datetime: Option<DateTime<Utc>>,
    /// Native CRS as an EPSG code (`proj:epsg`).
    pub epsg: Option<u32>,
    /// Footprint as a GeoJSON geometry in EPSG:4326.
    pub geometry: Option<serde_json::Value>,
    pub cloud_cover: Option<f64>,
    pub valid_pixel_percent: Option<f64>,
    pub product_version: Option<String>,
    pub outcome_id: Option<String>,
    pub grid_cell: Option<String>,
    /// Asset hrefs keyed by role (`analytic`, `preview`, `thumbnail`, ...).
    pub assets: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssetRefs {
    pub analytic: Option<String>,
    pub preview: Option<String>,
    pub thumbnail: Option<String>,
}

/// One normalized archive tile.
#[derive(Debug, Clone)]
pub struct TileRecord {
    pub id: String,
    pub capture_date: DateTime<Utc>,
    pub outcome_id: String,
    pub cloud_cover: Option<f64>,
    pub valid_pixel_percent: Option<f64>,
    pub product_version: Option<String>,
    pub grid_cell: Option<String>,
    /// Footprint in [`TileRecord::crs`], the canonical CRS of the search.
    pub footprint: MultiPolygon<f64>,
    pub crs: Crs,
    pub native_crs: Crs,
    pub assets: AssetRefs,
    /// Whole days between the capture and the normalization time.
    pub age_days: i64,
    /// Number of tiles in the whole batch sharing this tile's grid cell.
    pub image_count: usize,
}

impl TileRecord {
    /// Cloud cover with a missing value counted as the worst possible.
    pub fn cloud_cover_or_worst(&self) -> f64 {
        self.cloud_cover.unwrap_or(WORST_CLOUD_COVER)
    }
}

/// Identity of a capture: the bucketed capture time and the outcome id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CaptureKey {
    pub bucket: DateTime<Utc>,
    pub outcome_id: String,
}

/// Tiles of one physical imaging pass.
#[derive(Debug, Clone)]
pub struct CaptureGroup {
    pub key: CaptureKey,
    pub capture_date: DateTime<Utc>,
    pub mean_cloud_cover: f64,
    pub footprint: MultiPolygon<f64>,
    pub tiles: Vec<TileRecord>,
}

impl CaptureGroup {
    /// Build a group from its members. `tiles` must be non-empty; members
    /// are ordered by capture time then id so the representative tile is
    /// deterministic.
    pub fn new(key: CaptureKey, mut tiles: Vec<TileRecord>) -> Self {
        tiles.sort_by(|a, b| {
            a.capture_date
                .cmp(&b.capture_date)
                .then_with(|| a.id.cmp(&b.id))
        });
        let capture_date = tiles.first().map(|t| t.capture_date).unwrap_or(key.bucket);
        let mean_cloud_cover = if tiles.is_empty() {
            f64::NAN
        } else {
            tiles.iter().map(|t| t.cloud_cover_or_worst()).sum::<f64>() / tiles.len() as f64
        };
        let footprint = geometry::union_all(tiles.iter().map(|t| &t.footprint));
        Self {
            key,
            capture_date,
            mean_cloud_cover,
            footprint,
            tiles,
        }
    }

    pub fn outcome_id(&self) -> &str {
        &self.key.outcome_id
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    /// The earliest member tile.
    pub fn representative(&self) -> Option<&TileRecord> {
        self.tiles.first()
    }

    pub fn product_version(&self) -> Option<&str> {
        self.representative()
            .and_then(|t| t.product_version.as_deref())
    }
}

/// A capture's tiles merged into one georeferenced raster.
#[derive(Debug, Clone)]
pub struct Mosaic {
    pub outcome_id: String,
    pub capture_date: DateTime<Utc>,
    pub raster: Raster,
    pub path: PathBuf,
}

/// The rendered capture-stack animation.
#[derive(Debug, Clone)]
pub struct AnimationOutput {
    pub path: PathBuf,
    /// Mosaic files used, in frame order.
    pub mosaic_paths: Vec<PathBuf>,
    pub frame_count: usize,
    pub bounds: Bounds,
    pub width: u32,
    pub height: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn window_rejects_inverted_range() {
        let a = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(matches!(
            SearchWindow::new(a, b),
            Err(PipelineError::InvalidWindow { .. })
        ));
        assert!(SearchWindow::new(a, a).is_err());
        assert!(SearchWindow::new(b, a).is_ok());
    }

    #[test]
    fn aoi_around_point_has_requested_size() {
        let aoi = AreaOfInterest::around(41.0, 2.0, 3.0).unwrap();
        let b = aoi.bounds();
        let height_km = b.height() * KM_PER_DEGREE;
        let width_km = b.width() * KM_PER_DEGREE * 41.0_f64.to_radians().cos();
        assert!((height_km - 3.0).abs() < 1e-9);
        assert!((width_km - 3.0).abs() < 1e-9);
        let (lat, lon) = aoi.center();
        assert!((lat - 41.0).abs() < 1e-12 && (lon - 2.0).abs() < 1e-12);
    }

    #[test]
    fn aoi_rejects_degenerate_bbox() {
        assert!(AreaOfInterest::from_bbox(1.0, 1.0, 1.0, 2.0).is_err());
        assert!(AreaOfInterest::around(0.0, 0.0, 0.0).is_err());
    }

    #[test]
    fn chunk_interval_format() {
        let chunk = DateChunk {
            start: Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2021, 1, 31, 0, 0, 0).unwrap(),
        };
        assert_eq!(chunk.interval(), "2021-01-01T00:00:00Z/2021-01-31T00:00:00Z");
    }
}
