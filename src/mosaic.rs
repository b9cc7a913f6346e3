//! Per-capture raster mosaics.
//!
//! [`MosaicBuilder::build`] opens the analytic asset of every tile of one
//! accepted capture, merges them onto one grid in the canonical CRS
//! (last tile wins where they overlap), and writes the result as a GeoTIFF.
//! If any asset cannot be opened the whole capture is abandoned; a partial
//! mosaic is never written.
//!
//! [`MosaicBuilder::build_all`] runs one blocking build per capture with a
//! bounded number in flight and collects whatever succeeded.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};

use crate::crs::Crs;
use crate::error::PipelineError;
use crate::geometry::Bounds;
use crate::models::{CaptureGroup, Mosaic};
use crate::raster::{warp, write_geotiff, Grid, Raster, RasterSource, Resampling};

/// File name of a capture's mosaic.
pub fn mosaic_file_name(group: &CaptureGroup) -> String {
    let outcome: String = group
        .outcome_id()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!(
        "CaptureDate_{}_Outcome_{}.tiff",
        group.capture_date.format("%Y%m%dT%H%M%S"),
        outcome
    )
}

#[derive(Clone)]
pub struct MosaicBuilder {
    source: Arc<dyn RasterSource>,
    crs: Crs,
    output_dir: PathBuf,
}

/// Mosaics built across a batch of captures, plus the captures that failed.
#[derive(Debug, Default)]
pub struct MosaicReport {
    /// Successful mosaics, oldest first.
    pub mosaics: Vec<Mosaic>,
    pub failures: Vec<PipelineError>,
}

impl MosaicBuilder {
    pub fn new(source: Arc<dyn RasterSource>, crs: Crs, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            source,
            crs,
            output_dir: output_dir.into(),
        }
    }

    /// Build and write one capture's mosaic. Blocking.
    pub fn build(&self, group: &CaptureGroup) -> Result<Mosaic, PipelineError> {
        let outcome_id = group.outcome_id().to_string();
        let failure = |asset: &str, reason: String| PipelineError::MosaicAssetFailure {
            outcome_id: outcome_id.clone(),
            asset: asset.to_string(),
            reason,
        };

        if group.tiles.is_empty() {
            return Err(failure("-", "capture has no tiles".to_string()));
        }

        // Open every asset before merging anything.
        let mut rasters = Vec::with_capacity(group.tiles.len());
        for tile in &group.tiles {
            let href = tile
                .assets
                .analytic
                .as_deref()
                .ok_or_else(|| failure(&tile.id, "tile has no analytic asset".to_string()))?;
            let raster = self
                .source
                .open(href)
                .map_err(|e| failure(href, format!("{:#}", e)))?;
            rasters.push(raster);
        }

        let grid = self
            .mosaic_grid(&rasters)
            .map_err(|e| failure("-", format!("{:#}", e)))?;
        let mut merged = Raster::empty(&grid);
        for raster in &rasters {
            let (data, mask) = warp(raster, &grid, Resampling::Nearest);
            merged.paint(&data, &mask);
        }

        std::fs::create_dir_all(&self.output_dir)
            .map_err(|e| failure("-", format!("cannot create {}: {}", self.output_dir.display(), e)))?;
        let path = self.output_dir.join(mosaic_file_name(group));
        write_geotiff(&merged, &path).map_err(|e| failure("-", format!("{:#}", e)))?;

        tracing::info!(
            outcome_id = %outcome_id,
            tiles = rasters.len(),
            width = grid.width,
            height = grid.height,
            "mosaic written to {}",
            path.display()
        );

        Ok(Mosaic {
            outcome_id,
            capture_date: group.capture_date,
            raster: merged,
            path,
        })
    }

    /// Grid over the union of the tiles' extents in the canonical CRS, at
    /// the first tile's resolution.
    fn mosaic_grid(&self, rasters: &[Raster]) -> anyhow::Result<Grid> {
        let mut bounds: Option<Bounds> = None;
        let mut pixel: Option<(f64, f64)> = None;
        for raster in rasters {
            let b = raster.bounds().transformed(raster.crs, self.crs);
            if pixel.is_none() {
                pixel = Some((
                    b.width() / raster.width().max(1) as f64,
                    b.height() / raster.height().max(1) as f64,
                ));
            }
            bounds = Some(match bounds {
                Some(acc) => acc.union(&b),
                None => b,
            });
        }
        let (bounds, (pw, ph)) = bounds
            .zip(pixel)
            .ok_or_else(|| anyhow::anyhow!("no rasters to merge"))?;
        Grid::covering(bounds, self.crs, pw, ph)
    }

    /// Build every capture's mosaic, at most `max_workers` at a time.
    pub async fn build_all(&self, groups: Vec<CaptureGroup>, max_workers: usize) -> MosaicReport {
        let mut report = MosaicReport::default();
        if groups.is_empty() {
            return report;
        }

        let permits = Arc::new(Semaphore::new(max_workers.max(1)));
        let mut tasks = JoinSet::new();
        let mut outcomes = HashMap::new();
        for group in groups {
            let builder = self.clone();
            let permits = Arc::clone(&permits);
            let outcome_id = group.outcome_id().to_string();
            let handle = tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let outcome_id = group.outcome_id().to_string();
                tokio::task::spawn_blocking(move || builder.build(&group))
                    .await
                    .unwrap_or_else(|e| Err(task_failure(outcome_id, &e)))
            });
            outcomes.insert(handle.id(), outcome_id);
        }

        while let Some(joined) = tasks.join_next().await {
            let built = joined.unwrap_or_else(|e| {
                let outcome_id = outcomes.get(&e.id()).cloned().unwrap_or_default();
                Err(task_failure(outcome_id, &e))
            });
            match built {
                Ok(mosaic) => report.mosaics.push(mosaic),
                Err(e) => {
                    tracing::warn!("{}; skipping capture", e);
                    report.failures.push(e);
                }
            }
        }

        report.mosaics.sort_by(|a, b| {
            a.capture_date
                .cmp(&b.capture_date)
                .then_with(|| a.outcome_id.cmp(&b.outcome_id))
        });
        report
    }
}

fn task_failure(outcome_id: String, e: &JoinError) -> PipelineError {
    PipelineError::MosaicAssetFailure {
        outcome_id,
        asset: "*".to_string(),
        reason: format!("mosaic task failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::tests::tile;
    use crate::models::CaptureKey;
    use crate::raster::read_geotiff;
    use crate::raster::tests::solid;
    use anyhow::Result;
    use chrono::{TimeZone, Utc};

    struct MapSource(HashMap<String, Raster>);

    impl RasterSource for MapSource {
        fn open(&self, href: &str) -> Result<Raster> {
            self.0
                .get(href)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("404 for {}", href))
        }
    }

    fn group(hrefs: &[&str]) -> CaptureGroup {
        let at = Utc.with_ymd_and_hms(2023, 6, 1, 10, 30, 0).unwrap();
        let tiles = hrefs
            .iter()
            .enumerate()
            .map(|(i, href)| {
                let mut t = tile(&format!("t{}", i), "outcome/1", at, Some(1.0));
                t.assets.analytic = Some(href.to_string());
                t
            })
            .collect();
        CaptureGroup::new(
            CaptureKey {
                bucket: at,
                outcome_id: "outcome/1".to_string(),
            },
            tiles,
        )
    }

    fn source() -> Arc<dyn RasterSource> {
        let mut rasters = HashMap::new();
        rasters.insert(
            "left".to_string(),
            solid(Crs::WebMercator, (0.0, 100.0), 10, 10.0, [10, 10, 10]),
        );
        rasters.insert(
            "right".to_string(),
            solid(Crs::WebMercator, (50.0, 100.0), 10, 10.0, [200, 200, 200]),
        );
        Arc::new(MapSource(rasters))
    }

    #[test]
    fn merges_tiles_last_wins() {
        let dir = tempfile::tempdir().unwrap();
        let builder = MosaicBuilder::new(source(), Crs::WebMercator, dir.path());
        let mosaic = builder.build(&group(&["left", "right"])).unwrap();

        assert_eq!(mosaic.raster.width(), 15);
        assert_eq!(mosaic.raster.height(), 10);
        assert_eq!(mosaic.raster.data[[0, 0, 0]], 10);
        assert_eq!(mosaic.raster.data[[0, 0, 7]], 200);
        assert_eq!(mosaic.raster.data[[0, 0, 14]], 200);
        assert_eq!(
            mosaic.path.file_name().unwrap().to_str().unwrap(),
            "CaptureDate_20230601T103000_Outcome_outcome_1.tiff"
        );

        let on_disk = read_geotiff(&mosaic.path).unwrap();
        assert_eq!(on_disk.data, mosaic.raster.data);
        assert_eq!(on_disk.crs, Crs::WebMercator);
    }

    #[test]
    fn unreadable_asset_abandons_capture() {
        let dir = tempfile::tempdir().unwrap();
        let builder = MosaicBuilder::new(source(), Crs::WebMercator, dir.path());
        let err = builder.build(&group(&["left", "missing"])).unwrap_err();
        assert!(matches!(err, PipelineError::MosaicAssetFailure { .. }));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn build_all_collects_successes() {
        let dir = tempfile::tempdir().unwrap();
        let builder = MosaicBuilder::new(source(), Crs::WebMercator, dir.path());
        let report = builder
            .build_all(vec![group(&["left"]), group(&["missing"]), group(&["right"])], 2)
            .await;
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.mosaics.len(), 2);
    }

    struct PanickingSource;

    impl RasterSource for PanickingSource {
        fn open(&self, href: &str) -> Result<Raster> {
            panic!("decoder crashed on {}", href);
        }
    }

    #[tokio::test]
    async fn panicked_build_counts_as_failure() {
        let dir = tempfile::tempdir().unwrap();
        let builder = MosaicBuilder::new(Arc::new(PanickingSource), Crs::WebMercator, dir.path());
        let report = builder.build_all(vec![group(&["left"])], 1).await;
        assert!(report.mosaics.is_empty());
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(
            &report.failures[0],
            PipelineError::MosaicAssetFailure { outcome_id, .. } if outcome_id == "outcome/1"
        ));
    }
}
