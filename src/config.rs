//! TOML configuration for tilestack.
//!
//! Every section is optional; a missing field falls back to the default used
//! by the archive search workflow (30-day chunks, 10 search workers, 30%
//! cloud threshold, product version floor `1.0.0`, 2 s per animation frame).
//!
//! ```toml
//! [catalog]
//! url = "https://api.satellogic.com/archive/stac"
//! collections = ["quickview-visual"]
//!
//! [search]
//! chunk_size_days = 30
//! max_workers = 10
//!
//! [quality]
//! cloud_threshold = 30.0
//! min_tile_coverage = 0.01
//! min_product_version = "1.0.0"
//!
//! [animation]
//! frame_duration_secs = 2.0
//! ```

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::gate::parse_version;
use crate::raster::Resampling;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub grouping: GroupingConfig,
    #[serde(default)]
    pub mosaic: MosaicConfig,
    #[serde(default)]
    pub animation: AnimationConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CatalogConfig {
    #[serde(default = "default_catalog_url")]
    pub url: String,
    #[serde(default = "default_collections")]
    pub collections: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_page_limit")]
    pub page_limit: usize,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            url: default_catalog_url(),
            collections: default_collections(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            page_limit: default_page_limit(),
        }
    }
}

fn default_catalog_url() -> String {
    "https://api.satellogic.com/archive/stac".to_string()
}
fn default_collections() -> Vec<String> {
    vec!["quickview-visual".to_string()]
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    3
}
fn default_page_limit() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_chunk_size_days")]
    pub chunk_size_days: i64,
    #[serde(default = "default_search_workers")]
    pub max_workers: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            chunk_size_days: default_chunk_size_days(),
            max_workers: default_search_workers(),
        }
    }
}

fn default_chunk_size_days() -> i64 {
    30
}
fn default_search_workers() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct QualityConfig {
    #[serde(default = "default_cloud_threshold")]
    pub cloud_threshold: f64,
    #[serde(default = "default_min_tile_coverage")]
    pub min_tile_coverage: f64,
    #[serde(default = "default_min_product_version")]
    pub min_product_version: String,
    #[serde(default = "default_valid_pixel_percent")]
    pub valid_pixel_percent_for_basemap: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            cloud_threshold: default_cloud_threshold(),
            min_tile_coverage: default_min_tile_coverage(),
            min_product_version: default_min_product_version(),
            valid_pixel_percent_for_basemap: default_valid_pixel_percent(),
        }
    }
}

fn default_cloud_threshold() -> f64 {
    30.0
}
fn default_min_tile_coverage() -> f64 {
    0.01
}
fn default_min_product_version() -> String {
    "1.0.0".to_string()
}
fn default_valid_pixel_percent() -> f64 {
    100.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct GroupingConfig {
    /// Width of the capture time bucket. Tiles of one outcome whose
    /// timestamps fall within this window of the bucket's first tile are
    /// one capture.
    #[serde(default = "default_time_bucket_secs")]
    pub time_bucket_secs: u64,
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            time_bucket_secs: default_time_bucket_secs(),
        }
    }
}

fn default_time_bucket_secs() -> u64 {
    1
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MosaicConfig {
    /// Concurrent mosaic builds. Defaults to the available parallelism.
    #[serde(default)]
    pub max_workers: Option<usize>,
}

impl MosaicConfig {
    pub fn workers(&self) -> usize {
        self.max_workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        })
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnimationConfig {
    #[serde(default = "default_frame_duration_secs")]
    pub frame_duration_secs: f64,
    #[serde(default = "default_resampling")]
    pub resampling: String,
    #[serde(default = "default_label_scale")]
    pub label_scale: u32,
    #[serde(default = "default_max_dimension")]
    pub max_dimension: u32,
}

impl Default for AnimationConfig {
    fn default() -> Self {
        Self {
            frame_duration_secs: default_frame_duration_secs(),
            resampling: default_resampling(),
            label_scale: default_label_scale(),
            max_dimension: default_max_dimension(),
        }
    }
}

fn default_frame_duration_secs() -> f64 {
    2.0
}
fn default_resampling() -> String {
    "nearest".to_string()
}
fn default_label_scale() -> u32 {
    2
}
fn default_max_dimension() -> u32 {
    2048
}

impl AnimationConfig {
    pub fn resampling(&self) -> Result<Resampling> {
        self.resampling.parse()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_audit_dir")]
    pub audit_dir: PathBuf,
    #[serde(default = "default_maps_dir")]
    pub maps_dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            audit_dir: default_audit_dir(),
            maps_dir: default_maps_dir(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("images")
}
fn default_audit_dir() -> PathBuf {
    PathBuf::from("invalid_outcome_ids")
}
fn default_maps_dir() -> PathBuf {
    PathBuf::from("maps")
}

impl Config {
    /// Check every value that would otherwise surface as a confusing failure
    /// deep inside the pipeline.
    pub fn validate(&self) -> Result<()> {
        if self.catalog.url.trim().is_empty() {
            bail!("catalog.url must not be empty");
        }
        if self.catalog.page_limit == 0 {
            bail!("catalog.page_limit must be > 0");
        }

        if self.search.chunk_size_days <= 0 {
            bail!("search.chunk_size_days must be > 0");
        }
        if chrono::Duration::try_days(self.search.chunk_size_days).is_none() {
            bail!("search.chunk_size_days is out of range");
        }
        if self.search.max_workers == 0 {
            bail!("search.max_workers must be > 0");
        }

        if !(0.0..=1.0).contains(&self.quality.min_tile_coverage) {
            bail!("quality.min_tile_coverage must be in [0.0, 1.0]");
        }
        if !self.quality.cloud_threshold.is_finite() || self.quality.cloud_threshold < 0.0 {
            bail!("quality.cloud_threshold must be >= 0");
        }
        parse_version(&self.quality.min_product_version).with_context(|| {
            format!(
                "quality.min_product_version '{}' is not a version",
                self.quality.min_product_version
            )
        })?;

        if self.grouping.time_bucket_secs == 0 {
            bail!("grouping.time_bucket_secs must be > 0");
        }
        if bucket_seconds(self.grouping.time_bucket_secs).is_none() {
            bail!("grouping.time_bucket_secs is out of range");
        }

        if self.mosaic.max_workers == Some(0) {
            bail!("mosaic.max_workers must be > 0");
        }

        let frame_secs = self.animation.frame_duration_secs;
        if !frame_secs.is_finite() || frame_secs <= 0.0 {
            bail!("animation.frame_duration_secs must be > 0");
        }
        if self.animation.label_scale == 0 {
            bail!("animation.label_scale must be > 0");
        }
        if self.animation.max_dimension < 16 {
            bail!("animation.max_dimension must be >= 16");
        }
        self.animation.resampling()?;

        Ok(())
    }

    pub fn chunk_size(&self) -> Result<chrono::Duration> {
        chunk_days(self.search.chunk_size_days)
    }

    pub fn time_bucket(&self) -> Result<chrono::Duration> {
        bucket_seconds(self.grouping.time_bucket_secs).ok_or_else(|| {
            anyhow!(
                "time bucket of {} seconds is out of range",
                self.grouping.time_bucket_secs
            )
        })
    }
}

/// A chunk length of `days`, rejecting values chrono cannot represent.
pub fn chunk_days(days: i64) -> Result<chrono::Duration> {
    if days <= 0 {
        bail!("chunk size must be > 0 days, got {}", days);
    }
    chrono::Duration::try_days(days)
        .ok_or_else(|| anyhow!("chunk size of {} days is out of range", days))
}

fn bucket_seconds(secs: u64) -> Option<chrono::Duration> {
    i64::try_from(secs).ok().and_then(chrono::Duration::try_seconds)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}

/// Load `path` if it exists, otherwise fall back to the built-in defaults.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        tracing::info!(
            "config file {} not found, using defaults",
            path.display()
        );
        Ok(Config::default())
    }
}
