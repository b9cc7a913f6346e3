//! # tilestack CLI
//!
//! The `tilestack` binary searches a satellite imagery archive over an area
//! and time window, then reports, exports, or animates what it found.
//!
//! ## Usage
//!
//! ```bash
//! tilestack --config ./config/tilestack.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `tilestack chunks` | Show how a window is split into search periods |
//! | `tilestack search` | List the captures found over an area |
//! | `tilestack animate` | Gate, mosaic, and animate every capture |
//! | `tilestack footprints` | Export capture footprints as GeoJSON |
//! | `tilestack basemap` | Select the newest clear tile per grid cell |
//! | `tilestack outcome <id>` | Mosaic every tile of one outcome |
//!
//! ## Examples
//!
//! ```bash
//! # Captures over a 2 km box around Barcelona in 2023
//! tilestack search --point 41.39,2.17 --width-km 2 --start 2023-01-01 --end 2024-01-01
//!
//! # Full capture-stack animation over a bounding box
//! tilestack animate --bbox 2.15,41.38,2.19,41.40 --start 2023-01-01 --end 2023-07-01
//! ```

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tilestack::catalog::StacCatalog;
use tilestack::chunk::chunk_window;
use tilestack::config::{self, Config};
use tilestack::export;
use tilestack::group::{group_captures, summarize};
use tilestack::models::{AreaOfInterest, SearchWindow};
use tilestack::pipeline::Pipeline;
use tilestack::progress::ProgressMode;
use tilestack::raster::HttpRasterSource;

const DEFAULT_CONFIG: &str = "./config/tilestack.toml";

/// tilestack: archive search and capture-stack animation for satellite
/// imagery.
#[derive(Parser)]
#[command(
    name = "tilestack",
    about = "Search a satellite imagery archive and animate the captures over an area",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// When the default path does not exist, built-in defaults are used.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Search progress on stderr: `auto`, `off`, `human`, or `json`.
    #[arg(long, global = true, default_value = "auto")]
    progress: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the search periods a window is split into. No network access.
    Chunks {
        /// Window start (YYYY-MM-DD or RFC 3339).
        #[arg(long, value_parser = parse_date)]
        start: DateTime<Utc>,
        /// Window end, exclusive.
        #[arg(long, value_parser = parse_date)]
        end: DateTime<Utc>,
        /// Override `search.chunk_size_days`.
        #[arg(long)]
        chunk_days: Option<i64>,
    },

    /// Search the archive and list the captures found.
    Search {
        #[command(flatten)]
        target: TargetArgs,
        /// Print a JSON summary per outcome instead of one line per capture.
        #[arg(long)]
        json: bool,
    },

    /// Search, quality-gate, mosaic, and animate every capture.
    Animate {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Export one GeoJSON feature per outcome.
    Footprints {
        #[command(flatten)]
        target: TargetArgs,
        /// Output file; defaults to a timestamped file in `output.maps_dir`.
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Select the newest clear tile for every grid cell.
    Basemap {
        #[command(flatten)]
        target: TargetArgs,
        /// Output file; prints to stdout when omitted.
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Build mosaics for every tile of one outcome, without quality gating.
    Outcome {
        /// Outcome identifier (`satl:outcome_id`).
        outcome_id: String,
    },
}

/// Area of interest and search window.
#[derive(Args)]
struct TargetArgs {
    /// Bounding box as `min_lon,min_lat,max_lon,max_lat`.
    #[arg(long, value_parser = parse_bbox, conflicts_with = "points", allow_hyphen_values = true)]
    bbox: Option<Bbox>,

    /// Centre point as `lat,lon`. Repeat to process several areas in turn.
    #[arg(long = "point", value_parser = parse_point, allow_hyphen_values = true)]
    points: Vec<(f64, f64)>,

    /// Width of the square box around each `--point`, in kilometres.
    #[arg(long, default_value_t = 2.0)]
    width_km: f64,

    /// Window start (YYYY-MM-DD or RFC 3339).
    #[arg(long, value_parser = parse_date)]
    start: DateTime<Utc>,

    /// Window end, exclusive.
    #[arg(long, value_parser = parse_date)]
    end: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug)]
struct Bbox([f64; 4]);

impl TargetArgs {
    fn areas(&self) -> Result<Vec<(String, AreaOfInterest)>> {
        if let Some(Bbox([min_lon, min_lat, max_lon, max_lat])) = self.bbox {
            let aoi = AreaOfInterest::from_bbox(min_lon, min_lat, max_lon, max_lat)?;
            return Ok(vec![(
                format!("bbox {},{},{},{}", min_lon, min_lat, max_lon, max_lat),
                aoi,
            )]);
        }
        if self.points.is_empty() {
            bail!("an area is required: pass --bbox or at least one --point");
        }
        self.points
            .iter()
            .map(|&(lat, lon)| {
                let aoi = AreaOfInterest::around(lat, lon, self.width_km)?;
                Ok((format!("point {:.4},{:.4}", lat, lon), aoi))
            })
            .collect()
    }

    fn window(&self) -> Result<SearchWindow> {
        Ok(SearchWindow::new(self.start, self.end)?)
    }
}

fn parse_date(s: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc())
            .ok_or_else(|| format!("invalid date '{}'", s));
    }
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| format!("invalid date '{}': expected YYYY-MM-DD or RFC 3339", s))
}

fn parse_point(s: &str) -> Result<(f64, f64), String> {
    let (lat, lon) = s
        .split_once(',')
        .ok_or_else(|| format!("invalid point '{}': expected lat,lon", s))?;
    let lat: f64 = lat.trim().parse().map_err(|_| format!("invalid latitude in '{}'", s))?;
    let lon: f64 = lon.trim().parse().map_err(|_| format!("invalid longitude in '{}'", s))?;
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return Err(format!("point '{}' is outside geographic range", s));
    }
    Ok((lat, lon))
}

fn parse_bbox(s: &str) -> Result<Bbox, String> {
    let values: Vec<f64> = s
        .split(',')
        .map(|v| v.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .map_err(|_| format!("invalid bbox '{}': expected four numbers", s))?;
    match values.as_slice() {
        [a, b, c, d] => Ok(Bbox([*a, *b, *c, *d])),
        _ => Err(format!("invalid bbox '{}': expected four numbers", s)),
    }
}

fn progress_mode(raw: &str) -> Result<ProgressMode> {
    Ok(match raw {
        "auto" => ProgressMode::default_for_tty(),
        "off" => ProgressMode::Off,
        "human" => ProgressMode::Human,
        "json" => ProgressMode::Json,
        other => bail!("unknown progress mode '{}'", other),
    })
}

fn load(path: &Path) -> Result<Config> {
    if path == Path::new(DEFAULT_CONFIG) {
        config::load_or_default(path)
    } else {
        config::load_config(path)
    }
}

fn build_pipeline(cfg: &Config, mode: ProgressMode) -> Result<Pipeline> {
    let catalog = StacCatalog::from_config(&cfg.catalog)?;
    let mut source = HttpRasterSource::new(Duration::from_secs(cfg.catalog.timeout_secs));
    if let Some(token) = catalog.auth_token() {
        source = source.with_header("authorizationToken", token);
    }
    Ok(
        Pipeline::new(cfg.clone(), Arc::new(catalog), Arc::new(source))
            .with_progress(move || mode.reporter()),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let cfg = load(&cli.config)?;
    let mode = progress_mode(&cli.progress)?;

    match cli.command {
        Commands::Chunks {
            start,
            end,
            chunk_days,
        } => {
            let window = SearchWindow::new(start, end)?;
            let size = config::chunk_days(chunk_days.unwrap_or(cfg.search.chunk_size_days))?;
            for chunk in chunk_window(&window, size)? {
                println!("{}", chunk.interval());
            }
        }
        Commands::Search { target, json } => {
            let pipeline = build_pipeline(&cfg, mode)?;
            let window = target.window()?;
            for (label, aoi) in target.areas()? {
                let outcome = pipeline.search(&aoi, &window).await?;
                if json {
                    export::write_json(&serde_json::to_value(summarize(&outcome.tiles))?, None)?;
                    continue;
                }
                println!("{}", label);
                let groups = group_captures(outcome.tiles, cfg.time_bucket()?);
                for group in &groups {
                    println!(
                        "  {}  {}  {:>4} tiles  cloud {:>5.1}%  version {}",
                        group.capture_date.format("%Y-%m-%dT%H:%M:%S"),
                        group.outcome_id(),
                        group.tile_count(),
                        group.mean_cloud_cover,
                        group.product_version().unwrap_or("-")
                    );
                }
                println!(
                    "  {} captures, {} tiles, {}/{} periods with tiles, {} failed",
                    groups.len(),
                    groups.iter().map(|g| g.tile_count()).sum::<usize>(),
                    outcome.chunks_with_items,
                    outcome.chunks_total,
                    outcome.chunks_failed
                );
            }
        }
        Commands::Animate { target } => {
            let pipeline = build_pipeline(&cfg, mode)?;
            let window = target.window()?;
            for (label, aoi) in target.areas()? {
                let report = pipeline.animate(&aoi, &window).await?;
                println!("{}", label);
                println!(
                    "  {} tiles, {} captures, {} accepted, {} rejected",
                    report.tiles_found,
                    report.captures,
                    report.accepted,
                    report.rejections.rejections.len()
                );
                for path in &report.mosaic_paths {
                    println!("  mosaic     {}", path.display());
                }
                match &report.animation {
                    Some(animation) => println!(
                        "  animation  {} ({} frames, {}x{})",
                        animation.path.display(),
                        animation.frame_count,
                        animation.width,
                        animation.height
                    ),
                    None => println!("  animation not created"),
                }
                if let Some(path) = &report.invalid_outcomes_file {
                    println!("  invalid outcome ids  {}", path.display());
                }
            }
        }
        Commands::Footprints { target, out } => {
            let pipeline = build_pipeline(&cfg, mode)?;
            let window = target.window()?;
            for (label, aoi) in target.areas()? {
                let outcome = pipeline.search(&aoi, &window).await?;
                let Some(crs) = outcome.crs else {
                    println!("{}: no tiles found", label);
                    continue;
                };
                match &out {
                    Some(path) => {
                        export::write_json(&export::footprints_geojson(&outcome.tiles, crs), Some(path.as_path()))?
                    }
                    None => {
                        let path = export::write_footprints(
                            &outcome.tiles,
                            crs,
                            &cfg.output.maps_dir,
                            Utc::now(),
                        )?;
                        println!("{}: footprints written to {}", label, path.display());
                    }
                }
            }
        }
        Commands::Basemap { target, out } => {
            let pipeline = build_pipeline(&cfg, mode)?;
            let window = target.window()?;
            for (label, aoi) in target.areas()? {
                let outcome = pipeline.search(&aoi, &window).await?;
                let Some(crs) = outcome.crs else {
                    eprintln!("{}: no tiles found", label);
                    continue;
                };
                let selected = export::select_basemap_tiles(
                    &outcome.tiles,
                    cfg.quality.cloud_threshold,
                    cfg.quality.valid_pixel_percent_for_basemap,
                );
                eprintln!("{}: {} tiles selected", label, selected.len());
                export::write_json(&export::basemap_geojson(&selected, crs), out.as_deref())?;
            }
        }
        Commands::Outcome { outcome_id } => {
            let pipeline = build_pipeline(&cfg, mode)?;
            let report = pipeline
                .mosaic_outcome(&outcome_id)
                .await
                .with_context(|| format!("searching outcome {}", outcome_id))?;
            for mosaic in &report.mosaics {
                println!("{}", mosaic.path.display());
            }
            if report.mosaics.is_empty() {
                println!("no mosaic built for {}", outcome_id);
            }
        }
    }

    Ok(())
}
