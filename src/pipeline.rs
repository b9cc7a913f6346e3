//! End-to-end capture-stack workflow.
//!
//! ```text
//! window ─▶ chunk ─▶ search (concurrent) ─▶ normalize ─▶ group
//!                                                          │
//!          animation ◀─ render ◀─ mosaics (concurrent) ◀─ gate
//! ```
//!
//! Only configuration problems make these calls fail. Failed chunks,
//! dropped tiles, rejected captures, abandoned mosaics, and a failed
//! animation are all logged and reflected in the returned report.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;

use crate::animate::AnimationRenderer;
use crate::catalog::Catalog;
use crate::config::Config;
use crate::export::write_invalid_outcomes;
use crate::gate::{parse_version, CaptureQualityGate, QualityThresholds, RejectionLedger};
use crate::group::group_captures;
use crate::models::{AnimationOutput, AreaOfInterest, SearchWindow};
use crate::mosaic::{MosaicBuilder, MosaicReport};
use crate::normalize::{assign_image_counts, normalize_chunk};
use crate::progress::{NoProgress, SearchProgressReporter};
use crate::raster::RasterSource;
use crate::search::{search_archive, ArchiveSearchExecutor, SearchOutcome};

/// Everything a capture-stack run produced.
#[derive(Debug, Default)]
pub struct StackReport {
    pub tiles_found: usize,
    pub chunks_total: usize,
    pub chunks_failed: usize,
    pub captures: usize,
    pub accepted: usize,
    pub rejections: RejectionLedger,
    pub invalid_outcomes_file: Option<PathBuf>,
    pub mosaic_paths: Vec<PathBuf>,
    pub mosaic_failures: usize,
    pub animation: Option<AnimationOutput>,
}

pub struct Pipeline {
    config: Config,
    catalog: Arc<dyn Catalog>,
    source: Arc<dyn RasterSource>,
    reporter: Box<dyn Fn() -> Box<dyn SearchProgressReporter> + Send + Sync>,
}

impl Pipeline {
    pub fn new(config: Config, catalog: Arc<dyn Catalog>, source: Arc<dyn RasterSource>) -> Self {
        Self {
            config,
            catalog,
            source,
            reporter: Box::new(|| Box::new(NoProgress) as Box<dyn SearchProgressReporter>),
        }
    }

    pub fn with_progress(
        mut self,
        reporter: impl Fn() -> Box<dyn SearchProgressReporter> + Send + Sync + 'static,
    ) -> Self {
        self.reporter = Box::new(reporter);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn executor(&self) -> ArchiveSearchExecutor {
        ArchiveSearchExecutor::new(Arc::clone(&self.catalog), self.config.search.max_workers)
            .with_reporter((self.reporter)())
    }

    /// Search the archive and normalize the results.
    pub async fn search(&self, aoi: &AreaOfInterest, window: &SearchWindow) -> Result<SearchOutcome> {
        let outcome = search_archive(
            &self.executor(),
            aoi,
            window,
            self.config.chunk_size()?,
            Utc::now(),
        )
        .await?;
        Ok(outcome)
    }

    /// Search, gate, mosaic, and animate every capture over `aoi`.
    pub async fn animate(&self, aoi: &AreaOfInterest, window: &SearchWindow) -> Result<StackReport> {
        let now = Utc::now();
        let thresholds = QualityThresholds::from_config(&self.config.quality)?;
        let renderer = AnimationRenderer::from_config(&self.config.output.dir, &self.config.animation)?;

        let outcome = search_archive(&self.executor(), aoi, window, self.config.chunk_size()?, now).await?;
        let mut report = StackReport {
            tiles_found: outcome.tiles.len(),
            chunks_total: outcome.chunks_total,
            chunks_failed: outcome.chunks_failed,
            ..Default::default()
        };
        let crs = match outcome.crs {
            Some(crs) if !outcome.is_empty() => crs,
            _ => return Ok(report),
        };

        let groups = group_captures(outcome.tiles, self.config.time_bucket()?);
        report.captures = groups.len();
        let gate = CaptureQualityGate::new(thresholds, &groups);
        let mut ledger = RejectionLedger::default();
        let accepted = gate.apply(groups, &mut ledger);
        report.accepted = accepted.len();
        tracing::info!(
            captures = report.captures,
            accepted = report.accepted,
            "quality gate applied"
        );

        report.invalid_outcomes_file = self.audit(&ledger, now);
        report.rejections.merge(ledger);

        let builder = MosaicBuilder::new(Arc::clone(&self.source), crs, &self.config.output.dir);
        let mosaics = builder.build_all(accepted, self.config.mosaic.workers()).await;
        report.mosaic_failures = mosaics.failures.len();
        report.mosaic_paths = mosaics.mosaics.iter().map(|m| m.path.clone()).collect();

        if mosaics.mosaics.is_empty() {
            tracing::warn!("no mosaics were built; nothing to animate");
            return Ok(report);
        }

        let center = aoi.center();
        let frames = mosaics.mosaics;
        let rendered = tokio::task::spawn_blocking(move || renderer.render(&frames, center)).await?;
        match rendered {
            Ok(animation) => report.animation = Some(animation),
            Err(e) => tracing::warn!("Animation not created. Skipping... ({})", e),
        }

        Ok(report)
    }

    /// Fetch every tile of one outcome and build its mosaics, without the
    /// quality gate.
    pub async fn mosaic_outcome(&self, outcome_id: &str) -> Result<MosaicReport> {
        let items = self.catalog.search_outcome(outcome_id).await?;
        let mut normalized = normalize_chunk(items, None, Utc::now());
        assign_image_counts(&mut normalized.tiles);
        let crs = match normalized.crs {
            Some(crs) if !normalized.tiles.is_empty() => crs,
            _ => {
                tracing::warn!(outcome_id, "no tiles found for outcome");
                return Ok(MosaicReport::default());
            }
        };
        let floor = parse_version(&self.config.quality.min_product_version)?;
        let groups = group_captures(normalized.tiles, self.config.time_bucket()?);
        for group in &groups {
            let compatible = group
                .product_version()
                .and_then(|v| parse_version(v).ok())
                .is_some_and(|v| v >= floor);
            if !compatible {
                tracing::warn!(
                    outcome_id,
                    version = group.product_version().unwrap_or("none"),
                    "product version is below {}; building anyway",
                    floor
                );
            }
        }
        let builder = MosaicBuilder::new(Arc::clone(&self.source), crs, &self.config.output.dir);
        Ok(builder.build_all(groups, self.config.mosaic.workers()).await)
    }

    fn audit(&self, ledger: &RejectionLedger, now: DateTime<Utc>) -> Option<PathBuf> {
        match write_invalid_outcomes(&ledger.invalid_outcomes, &self.config.output.audit_dir, now) {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!("could not write invalid outcome ids: {:#}", e);
                None
            }
        }
    }
}
