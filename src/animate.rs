//! Capture-stack animation.
//!
//! All frames share one pixel grid: the union of the mosaics' bounds,
//! sized to the largest mosaic's pixel dimensions (coarsened when
//! that exceeds the configured maximum). Every mosaic is resampled onto that
//! grid with the same method, labelled with its capture date and the AOI
//! centre, and the frames are encoded oldest first into a looping GIF.
//!
//! The render is all-or-nothing: any failure abandons the whole animation.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use image::codecs::gif::{GifEncoder, Repeat};
use image::{Delay, Frame, Rgba, RgbaImage};
use std::path::{Path, PathBuf};

use crate::config::AnimationConfig;
use crate::error::PipelineError;
use crate::font;
use crate::geometry::Bounds;
use crate::models::{AnimationOutput, Mosaic};
use crate::raster::{warp, Grid, Resampling};

const LABEL_COLOR: Rgba<u8> = Rgba([255, 255, 0, 255]);
const LABEL_TOP: i64 = 10;
const BACKGROUND: Rgba<u8> = Rgba([0, 0, 0, 255]);

/// Text drawn at the top of each frame.
pub fn frame_label(capture_date: DateTime<Utc>, center_lat: f64, center_lon: f64) -> String {
    format!(
        "Date: {} | Lat: {:.4}, Long: {:.4}",
        capture_date.format("%Y-%m-%dT%H%M%S"),
        center_lat,
        center_lon
    )
}

#[derive(Debug, Clone)]
pub struct AnimationRenderer {
    output_dir: PathBuf,
    frame_duration_ms: u32,
    resampling: Resampling,
    label_scale: u32,
    max_dimension: usize,
}

impl AnimationRenderer {
    pub fn new(output_dir: impl Into<PathBuf>, frame_duration_secs: f64) -> Self {
        Self {
            output_dir: output_dir.into(),
            frame_duration_ms: (frame_duration_secs * 1000.0).round().max(1.0) as u32,
            resampling: Resampling::Nearest,
            label_scale: 2,
            max_dimension: 2048,
        }
    }

    pub fn from_config(output_dir: impl Into<PathBuf>, config: &AnimationConfig) -> Result<Self> {
        Ok(Self::new(output_dir, config.frame_duration_secs)
            .with_resampling(config.resampling()?)
            .with_label_scale(config.label_scale)
            .with_max_dimension(config.max_dimension as usize))
    }

    pub fn with_resampling(mut self, resampling: Resampling) -> Self {
        self.resampling = resampling;
        self
    }

    pub fn with_label_scale(mut self, scale: u32) -> Self {
        self.label_scale = scale.max(1);
        self
    }

    pub fn with_max_dimension(mut self, max_dimension: usize) -> Self {
        self.max_dimension = max_dimension.max(1);
        self
    }

    /// Render `mosaics` into one animation. `center` is the AOI centre as
    /// `(lat, lon)`, shown on every frame.
    pub fn render(&self, mosaics: &[Mosaic], center: (f64, f64)) -> Result<AnimationOutput, PipelineError> {
        self.try_render(mosaics, center)
            .map_err(|e| PipelineError::AnimationRenderFailure(format!("{:#}", e)))
    }

    fn try_render(&self, mosaics: &[Mosaic], center: (f64, f64)) -> Result<AnimationOutput> {
        let mut ordered: Vec<&Mosaic> = mosaics.iter().collect();
        ordered.sort_by_key(|m| m.capture_date);
        let (first, last) = match (ordered.first(), ordered.last()) {
            (Some(first), Some(last)) => (*first, *last),
            _ => bail!("no mosaics to animate"),
        };

        let grid = common_grid(&ordered)?.fit_within(self.max_dimension);
        let (width, height) = (
            u32::try_from(grid.width).context("frame too wide")?,
            u32::try_from(grid.height).context("frame too tall")?,
        );

        let mut frames = Vec::with_capacity(ordered.len());
        for mosaic in &ordered {
            let mut frame = self.frame(mosaic, &grid, width, height);
            let label = frame_label(mosaic.capture_date, center.0, center.1);
            let label_x = (width as i64 - font::text_width(&label, self.label_scale) as i64) / 2;
            font::draw_text(&mut frame, &label, label_x, LABEL_TOP, self.label_scale, LABEL_COLOR);
            frames.push(frame);
        }

        std::fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("cannot create {}", self.output_dir.display()))?;
        let path = self.output_dir.join(format!(
            "Stack_Animation_{}.gif",
            last.capture_date.format("%Y%m%dT%H%M%S")
        ));
        self.encode(&path, frames)?;

        tracing::info!(
            frames = ordered.len(),
            width,
            height,
            "animation written to {} ({} .. {})",
            path.display(),
            first.capture_date.format("%Y-%m-%d"),
            last.capture_date.format("%Y-%m-%d")
        );

        Ok(AnimationOutput {
            path,
            mosaic_paths: ordered.iter().map(|m| m.path.clone()).collect(),
            frame_count: ordered.len(),
            bounds: grid.bounds(),
            width,
            height,
        })
    }

    fn frame(&self, mosaic: &Mosaic, grid: &Grid, width: u32, height: u32) -> RgbaImage {
        let (data, mask) = warp(&mosaic.raster, grid, self.resampling);
        RgbaImage::from_fn(width, height, |x, y| {
            let (row, col) = (y as usize, x as usize);
            if mask[[row, col]] {
                Rgba([
                    data[[0, row, col]],
                    data[[1, row, col]],
                    data[[2, row, col]],
                    255,
                ])
            } else {
                BACKGROUND
            }
        })
    }

    fn encode(&self, path: &Path, frames: Vec<RgbaImage>) -> Result<()> {
        let file = std::fs::File::create(path)
            .with_context(|| format!("cannot create {}", path.display()))?;
        let delay = Delay::from_numer_denom_ms(self.frame_duration_ms, 1);
        let mut encoder = GifEncoder::new(std::io::BufWriter::new(file));
        encoder.set_repeat(Repeat::Infinite)?;
        encoder
            .encode_frames(frames.into_iter().map(|f| Frame::from_parts(f, 0, 0, delay)))
            .context("GIF encoding failed")?;
        Ok(())
    }
}

/// Union of the mosaics' bounds in the first mosaic's CRS, sized to the
/// largest mosaic width and height.
fn common_grid(mosaics: &[&Mosaic]) -> Result<Grid> {
    let crs = mosaics
        .first()
        .map(|m| m.raster.crs)
        .ok_or_else(|| anyhow::anyhow!("no mosaics to animate"))?;
    let mut bounds: Option<Bounds> = None;
    let (mut width, mut height) = (0, 0);
    for mosaic in mosaics {
        let b = mosaic.raster.bounds().transformed(mosaic.raster.crs, crs);
        bounds = Some(match bounds {
            Some(acc) => acc.union(&b),
            None => b,
        });
        width = width.max(mosaic.raster.width());
        height = height.max(mosaic.raster.height());
    }
    let bounds = bounds.ok_or_else(|| anyhow::anyhow!("no mosaics to animate"))?;
    Grid::with_size(bounds, crs, width, height)
}
