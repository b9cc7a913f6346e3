//! Georeferenced RGB rasters: GeoTIFF I/O, resampling, and reprojection.
//!
//! A [`Raster`] is a band-major `u8` cube (`band, row, col`) plus a north-up
//! [`GeoTransform`] and a [`Crs`]. All-zero pixels are nodata; mosaicking and
//! animation never paint them over real pixels.
//!
//! GeoTIFF georeferencing uses the three baseline tags:
//! `ModelPixelScale` (33550), `ModelTiepoint` (33922), and
//! `GeoKeyDirectory` (34735) with `GeographicTypeGeoKey` (2048) or
//! `ProjectedCSTypeGeoKey` (3072).

use anyhow::{bail, Context, Result};
use ndarray::{Array2, Array3};
use std::io::{Cursor, Seek, Write};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;
use tiff::ColorType;

use crate::crs::{transform, Crs};
use crate::geometry::Bounds;

const GT_MODEL_TYPE: u16 = 1024;
const GT_RASTER_TYPE: u16 = 1025;
const GEOGRAPHIC_TYPE: u16 = 2048;
const PROJECTED_CS_TYPE: u16 = 3072;

/// Number of colour bands every raster is normalized to.
pub const BANDS: usize = 3;

/// North-up affine transform. `y` decreases as rows increase.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub origin_y: f64,
    pub pixel_width: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    pub fn pixel_to_world(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.origin_x + col * self.pixel_width,
            self.origin_y - row * self.pixel_height,
        )
    }

    pub fn world_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (x - self.origin_x) / self.pixel_width,
            (self.origin_y - y) / self.pixel_height,
        )
    }
}

/// Pixel grid in a CRS, without data.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Grid {
    pub transform: GeoTransform,
    pub width: usize,
    pub height: usize,
    pub crs: Crs,
}

impl Grid {
    /// Smallest grid with the given pixel size that covers `bounds`.
    pub fn covering(bounds: Bounds, crs: Crs, pixel_width: f64, pixel_height: f64) -> Result<Grid> {
        if !(pixel_width > 0.0 && pixel_height > 0.0) {
            bail!("pixel size must be positive ({} x {})", pixel_width, pixel_height);
        }
        if !(bounds.width() > 0.0 && bounds.height() > 0.0) {
            bail!("grid bounds are empty");
        }
        let width = (bounds.width() / pixel_width).ceil().max(1.0) as usize;
        let height = (bounds.height() / pixel_height).ceil().max(1.0) as usize;
        Ok(Grid {
            transform: GeoTransform {
                origin_x: bounds.min_x,
                origin_y: bounds.max_y,
                pixel_width,
                pixel_height,
            },
            width,
            height,
            crs,
        })
    }

    /// Grid of exactly `width` x `height` pixels stretched over `bounds`.
    pub fn with_size(bounds: Bounds, crs: Crs, width: usize, height: usize) -> Result<Grid> {
        if width == 0 || height == 0 {
            bail!("grid size must be positive ({} x {})", width, height);
        }
        if !(bounds.width() > 0.0 && bounds.height() > 0.0) {
            bail!("grid bounds are empty");
        }
        Ok(Grid {
            transform: GeoTransform {
                origin_x: bounds.min_x,
                origin_y: bounds.max_y,
                pixel_width: bounds.width() / width as f64,
                pixel_height: bounds.height() / height as f64,
            },
            width,
            height,
            crs,
        })
    }

    /// Coarsen the grid until neither side exceeds `max_dimension`. The
    /// bounds are kept exactly; pixel sizes absorb the rounding.
    pub fn fit_within(self, max_dimension: usize) -> Grid {
        let largest = self.width.max(self.height);
        if largest <= max_dimension || max_dimension == 0 {
            return self;
        }
        let factor = largest as f64 / max_dimension as f64;
        let width = ((self.width as f64 / factor).round() as usize).clamp(1, max_dimension);
        let height = ((self.height as f64 / factor).round() as usize).clamp(1, max_dimension);
        let bounds = self.bounds();
        Grid {
            transform: GeoTransform {
                pixel_width: bounds.width() / width as f64,
                pixel_height: bounds.height() / height as f64,
                ..self.transform
            },
            width,
            height,
            crs: self.crs,
        }
    }

    pub fn bounds(&self) -> Bounds {
        let (min_x, max_y) = self.transform.pixel_to_world(0.0, 0.0);
        let (max_x, min_y) = self
            .transform
            .pixel_to_world(self.width as f64, self.height as f64);
        Bounds::new(min_x, min_y, max_x, max_y)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    pub data: Array3<u8>,
    pub transform: GeoTransform,
    pub crs: Crs,
}

impl Raster {
    pub fn new(data: Array3<u8>, transform: GeoTransform, crs: Crs) -> Self {
        Self { data, transform, crs }
    }

    /// An all-nodata raster on `grid`.
    pub fn empty(grid: &Grid) -> Self {
        Self {
            data: Array3::zeros((BANDS, grid.height, grid.width)),
            transform: grid.transform,
            crs: grid.crs,
        }
    }

    pub fn width(&self) -> usize {
        self.data.dim().2
    }

    pub fn height(&self) -> usize {
        self.data.dim().1
    }

    pub fn grid(&self) -> Grid {
        Grid {
            transform: self.transform,
            width: self.width(),
            height: self.height(),
            crs: self.crs,
        }
    }

    pub fn bounds(&self) -> Bounds {
        self.grid().bounds()
    }

    pub fn has_data(&self, row: usize, col: usize) -> bool {
        (0..self.data.dim().0).any(|b| self.data[[b, row, col]] != 0)
    }

    /// Paint every data pixel of `other` (already on this raster's grid)
    /// over this raster.
    pub fn paint(&mut self, other: &Array3<u8>, mask: &Array2<bool>) {
        for ((row, col), &valid) in mask.indexed_iter() {
            if valid {
                for b in 0..BANDS {
                    self.data[[b, row, col]] = other[[b, row, col]];
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Resampling {
    #[default]
    Nearest,
    Bilinear,
}

impl FromStr for Resampling {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "nearest" => Ok(Resampling::Nearest),
            "bilinear" => Ok(Resampling::Bilinear),
            other => bail!("unknown resampling '{}' (expected nearest or bilinear)", other),
        }
    }
}

/// Resample `src` onto `dst`, transforming coordinates between CRSs.
///
/// Returns the band cube on the destination grid and a mask of the pixels
/// that received data.
pub fn warp(src: &Raster, dst: &Grid, resampling: Resampling) -> (Array3<u8>, Array2<bool>) {
    let mut out = Array3::<u8>::zeros((BANDS, dst.height, dst.width));
    let mut mask = Array2::<bool>::from_elem((dst.height, dst.width), false);
    let (src_w, src_h) = (src.width() as f64, src.height() as f64);

    for row in 0..dst.height {
        for col in 0..dst.width {
            let (x, y) = dst
                .transform
                .pixel_to_world(col as f64 + 0.5, row as f64 + 0.5);
            let (sx, sy) = transform(dst.crs, src.crs, x, y);
            let (fc, fr) = src.transform.world_to_pixel(sx, sy);
            if !(fc >= 0.0 && fr >= 0.0 && fc < src_w && fr < src_h) {
                continue;
            }

            let sampled = match resampling {
                Resampling::Bilinear => bilinear(src, fc, fr),
                Resampling::Nearest => None,
            }
            .or_else(|| nearest(src, fc, fr));

            if let Some(pixel) = sampled {
                for (b, value) in pixel.iter().enumerate() {
                    out[[b, row, col]] = *value;
                }
                mask[[row, col]] = true;
            }
        }
    }

    (out, mask)
}

fn nearest(src: &Raster, fc: f64, fr: f64) -> Option<[u8; BANDS]> {
    let (c, r) = (fc.floor() as usize, fr.floor() as usize);
    if !src.has_data(r, c) {
        return None;
    }
    let mut pixel = [0u8; BANDS];
    for (b, value) in pixel.iter_mut().enumerate() {
        *value = src.data[[b, r, c]];
    }
    Some(pixel)
}

fn bilinear(src: &Raster, fc: f64, fr: f64) -> Option<[u8; BANDS]> {
    let (u, v) = (fc - 0.5, fr - 0.5);
    if u < 0.0 || v < 0.0 {
        return None;
    }
    let (c0, r0) = (u.floor() as usize, v.floor() as usize);
    if c0 + 1 >= src.width() || r0 + 1 >= src.height() {
        return None;
    }
    let corners = [(r0, c0), (r0, c0 + 1), (r0 + 1, c0), (r0 + 1, c0 + 1)];
    if !corners.iter().all(|&(r, c)| src.has_data(r, c)) {
        return None;
    }
    let (du, dv) = (u - c0 as f64, v - r0 as f64);
    let weights = [
        (1.0 - du) * (1.0 - dv),
        du * (1.0 - dv),
        (1.0 - du) * dv,
        du * dv,
    ];
    let mut pixel = [0u8; BANDS];
    for (b, value) in pixel.iter_mut().enumerate() {
        let sum: f64 = corners
            .iter()
            .zip(weights.iter())
            .map(|(&(r, c), w)| src.data[[b, r, c]] as f64 * w)
            .sum();
        *value = sum.round().clamp(0.0, 255.0) as u8;
    }
    Some(pixel)
}

/// Decode a GeoTIFF into a 3-band raster.
///
/// Gray images are expanded to RGB; an alpha band is applied as a nodata
/// mask and dropped.
pub fn decode_geotiff(bytes: &[u8]) -> Result<Raster> {
    let mut decoder = Decoder::new(Cursor::new(bytes)).context("not a TIFF file")?;
    let (width, height) = decoder.dimensions()?;
    let (width, height) = (width as usize, height as usize);
    let color = decoder.colortype()?;

    let samples = match color {
        ColorType::Gray(8) => 1,
        ColorType::GrayA(8) => 2,
        ColorType::RGB(8) => 3,
        ColorType::RGBA(8) => 4,
        other => bail!("unsupported TIFF colour type {:?}", other),
    };

    let scale = decoder
        .get_tag_f64_vec(Tag::ModelPixelScaleTag)
        .context("missing ModelPixelScale tag")?;
    let tiepoint = decoder
        .get_tag_f64_vec(Tag::ModelTiepointTag)
        .context("missing ModelTiepoint tag")?;
    let geokeys = decoder
        .get_tag_u16_vec(Tag::GeoKeyDirectoryTag)
        .context("missing GeoKeyDirectory tag")?;
    if scale.len() < 2 || tiepoint.len() < 6 {
        bail!("malformed GeoTIFF georeferencing tags");
    }
    let epsg = epsg_from_geokeys(&geokeys)?;
    let crs = Crs::from_epsg(epsg).ok_or_else(|| anyhow::anyhow!("unsupported CRS EPSG:{}", epsg))?;

    let transform = GeoTransform {
        origin_x: tiepoint[3] - tiepoint[0] * scale[0],
        origin_y: tiepoint[4] + tiepoint[1] * scale[1],
        pixel_width: scale[0],
        pixel_height: scale[1],
    };

    let buf = match decoder.read_image()? {
        DecodingResult::U8(buf) => buf,
        _ => bail!("only 8-bit rasters are supported"),
    };
    if buf.len() != width * height * samples {
        bail!("TIFF data size does not match dimensions");
    }

    let mut data = Array3::<u8>::zeros((BANDS, height, width));
    for row in 0..height {
        for col in 0..width {
            let px = &buf[(row * width + col) * samples..][..samples];
            let (rgb, alpha) = match samples {
                1 => ([px[0]; 3], 255),
                2 => ([px[0]; 3], px[1]),
                3 => ([px[0], px[1], px[2]], 255),
                _ => ([px[0], px[1], px[2]], px[3]),
            };
            if alpha == 0 {
                continue;
            }
            for (b, value) in rgb.iter().enumerate() {
                data[[b, row, col]] = *value;
            }
        }
    }

    Ok(Raster::new(data, transform, crs))
}

fn epsg_from_geokeys(keys: &[u16]) -> Result<u32> {
    if keys.len() < 4 {
        bail!("GeoKeyDirectory is truncated");
    }
    let count = keys[3] as usize;
    let entries = keys[4..].chunks_exact(4).take(count);
    let mut geographic = None;
    let mut projected = None;
    for entry in entries {
        // Only keys stored inline (location 0) carry an EPSG code directly.
        if entry[1] != 0 {
            continue;
        }
        match entry[0] {
            PROJECTED_CS_TYPE => projected = Some(entry[3] as u32),
            GEOGRAPHIC_TYPE => geographic = Some(entry[3] as u32),
            _ => {}
        }
    }
    projected
        .or(geographic)
        .ok_or_else(|| anyhow::anyhow!("GeoKeyDirectory has no EPSG code"))
}

/// Encode a raster as an RGB8 GeoTIFF.
pub fn encode_geotiff<W: Write + Seek>(raster: &Raster, writer: W) -> Result<()> {
    let (bands, height, width) = raster.data.dim();
    if bands != BANDS {
        bail!("expected {} bands, got {}", BANDS, bands);
    }
    let mut interleaved = Vec::with_capacity(width * height * BANDS);
    for row in 0..height {
        for col in 0..width {
            for b in 0..BANDS {
                interleaved.push(raster.data[[b, row, col]]);
            }
        }
    }

    let epsg = raster.crs.epsg();
    let epsg = u16::try_from(epsg).with_context(|| format!("EPSG:{} does not fit a GeoKey", epsg))?;
    let (model_type, crs_key) = if raster.crs.is_geographic() {
        (2, GEOGRAPHIC_TYPE)
    } else {
        (1, PROJECTED_CS_TYPE)
    };
    let geokeys: [u16; 16] = [
        1, 1, 0, 3, //
        GT_MODEL_TYPE, 0, 1, model_type, //
        GT_RASTER_TYPE, 0, 1, 1, //
        crs_key, 0, 1, epsg,
    ];
    let t = raster.transform;
    let scale = [t.pixel_width, t.pixel_height, 0.0];
    let tiepoint = [0.0, 0.0, 0.0, t.origin_x, t.origin_y, 0.0];

    let mut encoder = TiffEncoder::new(writer)?;
    let mut image = encoder.new_image::<colortype::RGB8>(width as u32, height as u32)?;
    image
        .encoder()
        .write_tag(Tag::ModelPixelScaleTag, &scale[..])?;
    image
        .encoder()
        .write_tag(Tag::ModelTiepointTag, &tiepoint[..])?;
    image
        .encoder()
        .write_tag(Tag::GeoKeyDirectoryTag, &geokeys[..])?;
    image.write_data(&interleaved)?;
    Ok(())
}

pub fn write_geotiff(raster: &Raster, path: &Path) -> Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    encode_geotiff(raster, std::io::BufWriter::new(file))
        .with_context(|| format!("Failed to write GeoTIFF {}", path.display()))
}

pub fn read_geotiff(path: &Path) -> Result<Raster> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    decode_geotiff(&bytes).with_context(|| format!("Failed to decode {}", path.display()))
}

/// Opens tile assets by href.
///
/// Called from blocking worker threads, never from async code.
pub trait RasterSource: Send + Sync {
    fn open(&self, href: &str) -> Result<Raster>;
}

/// Fetches assets over HTTP(S), or reads them from disk for `file://` and
/// plain paths.
pub struct HttpRasterSource {
    timeout: Duration,
    headers: Vec<(String, String)>,
}

impl HttpRasterSource {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    fn fetch(&self, href: &str) -> Result<Vec<u8>> {
        if let Some(path) = href.strip_prefix("file://") {
            return std::fs::read(path).with_context(|| format!("Failed to read {}", path));
        }
        if !(href.starts_with("http://") || href.starts_with("https://")) {
            return std::fs::read(href).with_context(|| format!("Failed to read {}", href));
        }

        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()?;
        let mut request = client.get(href);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request.send()?;
        let status = response.status();
        if !status.is_success() {
            bail!("asset request returned {}", status);
        }
        Ok(response.bytes()?.to_vec())
    }
}

impl RasterSource for HttpRasterSource {
    fn open(&self, href: &str) -> Result<Raster> {
        let bytes = self.fetch(href)?;
        decode_geotiff(&bytes)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn solid(crs: Crs, origin: (f64, f64), size: usize, pixel: f64, rgb: [u8; 3]) -> Raster {
        let mut data = Array3::<u8>::zeros((BANDS, size, size));
        for b in 0..BANDS {
            data.index_axis_mut(ndarray::Axis(0), b).fill(rgb[b]);
        }
        Raster::new(
            data,
            GeoTransform {
                origin_x: origin.0,
                origin_y: origin.1,
                pixel_width: pixel,
                pixel_height: pixel,
            },
            crs,
        )
    }

    #[test]
    fn geotiff_preserves_georeferencing() {
        let utm = Crs::Utm { zone: 31, north: true };
        let mut raster = solid(utm, (430_000.0, 4_583_000.0), 4, 10.0, [10, 20, 30]);
        raster.data[[0, 1, 2]] = 200;
        let mut buf = Cursor::new(Vec::new());
        encode_geotiff(&raster, &mut buf).unwrap();
        let back = decode_geotiff(buf.get_ref()).unwrap();
        assert_eq!(back.crs, utm);
        assert_eq!(back.transform, raster.transform);
        assert_eq!(back.data, raster.data);
    }

    #[test]
    fn geographic_crs_uses_geographic_key() {
        let raster = solid(Crs::Wgs84, (2.0, 41.0), 2, 0.001, [1, 1, 1]);
        let mut buf = Cursor::new(Vec::new());
        encode_geotiff(&raster, &mut buf).unwrap();
        assert_eq!(decode_geotiff(buf.get_ref()).unwrap().crs, Crs::Wgs84);
    }

    #[test]
    fn rejects_plain_tiff() {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut encoder = TiffEncoder::new(&mut buf).unwrap();
            encoder
                .write_image::<colortype::RGB8>(1, 1, &[1, 2, 3])
                .unwrap();
        }
        assert!(decode_geotiff(buf.get_ref()).is_err());
    }

    #[test]
    fn grid_covers_bounds_and_fits() {
        let grid = Grid::covering(Bounds::new(0.0, 0.0, 1000.0, 500.0), Crs::WebMercator, 1.0, 1.0).unwrap();
        assert_eq!((grid.width, grid.height), (1000, 500));
        let small = grid.fit_within(100);
        assert_eq!((small.width, small.height), (100, 50));
        assert_eq!(small.transform.pixel_width, 10.0);
        let b = small.bounds();
        assert!((b.max_x - 1000.0).abs() < 1e-9 && (b.min_y - 0.0).abs() < 1e-9);
    }

    #[test]
    fn fitted_grid_keeps_uneven_bounds() {
        let bounds = Bounds::new(0.0, 0.0, 1000.0, 333.0);
        let grid = Grid::with_size(bounds, Crs::WebMercator, 1000, 333).unwrap();
        let small = grid.fit_within(100);
        assert_eq!((small.width, small.height), (100, 33));
        let b = small.bounds();
        assert!((b.min_x - 0.0).abs() < 1e-9);
        assert!((b.min_y - 0.0).abs() < 1e-9);
        assert!((b.max_x - 1000.0).abs() < 1e-9);
        assert!((b.max_y - 333.0).abs() < 1e-9);
    }

    #[test]
    fn warp_same_grid_is_identity() {
        let src = solid(Crs::WebMercator, (0.0, 40.0), 4, 10.0, [5, 6, 7]);
        for resampling in [Resampling::Nearest, Resampling::Bilinear] {
            let (out, mask) = warp(&src, &src.grid(), resampling);
            assert_eq!(out, src.data);
            assert!(mask.iter().all(|m| *m));
        }
    }

    #[test]
    fn warp_outside_source_is_nodata() {
        let src = solid(Crs::WebMercator, (0.0, 10.0), 1, 10.0, [9, 9, 9]);
        let dst = Grid::covering(Bounds::new(0.0, 0.0, 20.0, 10.0), Crs::WebMercator, 10.0, 10.0).unwrap();
        let (out, mask) = warp(&src, &dst, Resampling::Nearest);
        assert!(mask[[0, 0]]);
        assert!(!mask[[0, 1]]);
        assert_eq!(out[[0, 0, 1]], 0);
    }

    #[test]
    fn warp_between_crs_keeps_pixels() {
        let utm = Crs::Utm { zone: 31, north: true };
        let src = solid(utm, (430_000.0, 4_583_000.0), 100, 10.0, [50, 60, 70]);
        let dst_bounds = Bounds::new(430_200.0, 4_582_200.0, 430_800.0, 4_582_800.0)
            .transformed(utm, Crs::Wgs84);
        let dst = Grid::covering(dst_bounds, Crs::Wgs84, dst_bounds.width() / 10.0, dst_bounds.height() / 10.0)
            .unwrap();
        let (out, mask) = warp(&src, &dst, Resampling::Nearest);
        assert!(mask.iter().all(|m| *m));
        assert!(out.index_axis(ndarray::Axis(0), 2).iter().all(|v| *v == 70));
    }

    #[test]
    fn resampling_from_str() {
        assert_eq!("Nearest".parse::<Resampling>().unwrap(), Resampling::Nearest);
        assert_eq!("bilinear".parse::<Resampling>().unwrap(), Resampling::Bilinear);
        assert!("cubic".parse::<Resampling>().is_err());
    }
}
