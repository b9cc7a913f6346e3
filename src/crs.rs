//! Coordinate reference systems used by archive tiles.
//!
//! Tiles arrive either in geographic WGS84 (EPSG:4326), web mercator
//! (EPSG:3857), or one of the WGS84 UTM zones (EPSG:326xx north, 327xx
//! south). Transforms go through geographic longitude/latitude; the UTM
//! projection uses the standard transverse Mercator series on the WGS84
//! ellipsoid, accurate to well below a pixel inside a zone.

use anyhow::{bail, Result};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

const WGS84_A: f64 = 6_378_137.0;
const WGS84_F: f64 = 1.0 / 298.257_223_563;
const UTM_K0: f64 = 0.9996;
const UTM_FALSE_EASTING: f64 = 500_000.0;
const UTM_FALSE_NORTHING_SOUTH: f64 = 10_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Crs {
    /// EPSG:4326, x = longitude, y = latitude (degrees).
    Wgs84,
    /// EPSG:3857 spherical web mercator (metres).
    WebMercator,
    /// WGS84 / UTM zone `zone`, northern or southern hemisphere (metres).
    Utm { zone: u8, north: bool },
}

impl Crs {
    pub fn from_epsg(code: u32) -> Option<Crs> {
        match code {
            4326 => Some(Crs::Wgs84),
            3857 | 900913 => Some(Crs::WebMercator),
            32601..=32660 => Some(Crs::Utm {
                zone: (code - 32600) as u8,
                north: true,
            }),
            32701..=32760 => Some(Crs::Utm {
                zone: (code - 32700) as u8,
                north: false,
            }),
            _ => None,
        }
    }

    pub fn epsg(&self) -> u32 {
        match self {
            Crs::Wgs84 => 4326,
            Crs::WebMercator => 3857,
            Crs::Utm { zone, north: true } => 32600 + *zone as u32,
            Crs::Utm { zone, north: false } => 32700 + *zone as u32,
        }
    }

    pub fn is_geographic(&self) -> bool {
        matches!(self, Crs::Wgs84)
    }

    /// Project geographic `(lon, lat)` into this CRS.
    pub fn from_geographic(&self, lon: f64, lat: f64) -> (f64, f64) {
        match self {
            Crs::Wgs84 => (lon, lat),
            Crs::WebMercator => {
                let x = WGS84_A * lon.to_radians();
                let y = WGS84_A * (std::f64::consts::FRAC_PI_4 + lat.to_radians() / 2.0).tan().ln();
                (x, y)
            }
            Crs::Utm { zone, north } => utm_forward(*zone, *north, lon, lat),
        }
    }

    /// Unproject `(x, y)` in this CRS into geographic `(lon, lat)`.
    pub fn to_geographic(&self, x: f64, y: f64) -> (f64, f64) {
        match self {
            Crs::Wgs84 => (x, y),
            Crs::WebMercator => {
                let lon = (x / WGS84_A).to_degrees();
                let lat = (2.0 * (y / WGS84_A).exp().atan() - std::f64::consts::FRAC_PI_2)
                    .to_degrees();
                (lon, lat)
            }
            Crs::Utm { zone, north } => utm_inverse(*zone, *north, x, y),
        }
    }
}

/// Transform a point between two reference systems.
pub fn transform(from: Crs, to: Crs, x: f64, y: f64) -> (f64, f64) {
    if from == to {
        return (x, y);
    }
    let (lon, lat) = from.to_geographic(x, y);
    to.from_geographic(lon, lat)
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.epsg())
    }
}

impl FromStr for Crs {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix("EPSG:")
            .or_else(|| trimmed.strip_prefix("epsg:"))
            .unwrap_or(trimmed);
        let code: u32 = match digits.parse() {
            Ok(code) => code,
            Err(_) => bail!("not an EPSG code: '{}'", s),
        };
        match Crs::from_epsg(code) {
            Some(crs) => Ok(crs),
            None => bail!("unsupported CRS EPSG:{}", code),
        }
    }
}

fn central_meridian(zone: u8) -> f64 {
    (zone as f64 - 1.0) * 6.0 - 180.0 + 3.0
}

fn ellipsoid() -> (f64, f64) {
    let e2 = WGS84_F * (2.0 - WGS84_F);
    let ep2 = e2 / (1.0 - e2);
    (e2, ep2)
}

fn meridian_arc(phi: f64, e2: f64) -> f64 {
    let e4 = e2 * e2;
    let e6 = e4 * e2;
    WGS84_A
        * ((1.0 - e2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0) * phi
            - (3.0 * e2 / 8.0 + 3.0 * e4 / 32.0 + 45.0 * e6 / 1024.0) * (2.0 * phi).sin()
            + (15.0 * e4 / 256.0 + 45.0 * e6 / 1024.0) * (4.0 * phi).sin()
            - (35.0 * e6 / 3072.0) * (6.0 * phi).sin())
}

fn utm_forward(zone: u8, north: bool, lon: f64, lat: f64) -> (f64, f64) {
    let (e2, ep2) = ellipsoid();
    let phi = lat.to_radians();
    let lambda = (lon - central_meridian(zone)).to_radians();

    let sin_phi = phi.sin();
    let cos_phi = phi.cos();
    let tan_phi = phi.tan();

    let n = WGS84_A / (1.0 - e2 * sin_phi * sin_phi).sqrt();
    let t = tan_phi * tan_phi;
    let c = ep2 * cos_phi * cos_phi;
    let a = lambda * cos_phi;
    let m = meridian_arc(phi, e2);

    let a2 = a * a;
    let a3 = a2 * a;
    let a4 = a3 * a;
    let a5 = a4 * a;
    let a6 = a5 * a;

    let x = UTM_K0
        * n
        * (a + (1.0 - t + c) * a3 / 6.0 + (5.0 - 18.0 * t + t * t + 72.0 * c - 58.0 * ep2) * a5 / 120.0)
        + UTM_FALSE_EASTING;

    let mut y = UTM_K0
        * (m + n
            * tan_phi
            * (a2 / 2.0
                + (5.0 - t + 9.0 * c + 4.0 * c * c) * a4 / 24.0
                + (61.0 - 58.0 * t + t * t + 600.0 * c - 330.0 * ep2) * a6 / 720.0));

    if !north {
        y += UTM_FALSE_NORTHING_SOUTH;
    }
    (x, y)
}

fn utm_inverse(zone: u8, north: bool, x: f64, y: f64) -> (f64, f64) {
    let (e2, ep2) = ellipsoid();
    let e4 = e2 * e2;
    let e6 = e4 * e2;

    let x = x - UTM_FALSE_EASTING;
    let y = if north { y } else { y - UTM_FALSE_NORTHING_SOUTH };

    let m = y / UTM_K0;
    let mu = m / (WGS84_A * (1.0 - e2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0));

    let sqrt_1me2 = (1.0 - e2).sqrt();
    let e1 = (1.0 - sqrt_1me2) / (1.0 + sqrt_1me2);
    let e1_2 = e1 * e1;
    let e1_3 = e1_2 * e1;
    let e1_4 = e1_3 * e1;

    let phi1 = mu
        + (3.0 * e1 / 2.0 - 27.0 * e1_3 / 32.0) * (2.0 * mu).sin()
        + (21.0 * e1_2 / 16.0 - 55.0 * e1_4 / 32.0) * (4.0 * mu).sin()
        + (151.0 * e1_3 / 96.0) * (6.0 * mu).sin()
        + (1097.0 * e1_4 / 512.0) * (8.0 * mu).sin();

    let sin_phi1 = phi1.sin();
    let cos_phi1 = phi1.cos();
    let tan_phi1 = phi1.tan();

    let n1 = WGS84_A / (1.0 - e2 * sin_phi1 * sin_phi1).sqrt();
    let t1 = tan_phi1 * tan_phi1;
    let c1 = ep2 * cos_phi1 * cos_phi1;
    let r1 = WGS84_A * (1.0 - e2) / (1.0 - e2 * sin_phi1 * sin_phi1).powf(1.5);
    let d = x / (n1 * UTM_K0);

    let d2 = d * d;
    let d3 = d2 * d;
    let d4 = d3 * d;
    let d5 = d4 * d;
    let d6 = d5 * d;

    let phi = phi1
        - (n1 * tan_phi1 / r1)
            * (d2 / 2.0
                - (5.0 + 3.0 * t1 + 10.0 * c1 - 4.0 * c1 * c1 - 9.0 * ep2) * d4 / 24.0
                + (61.0 + 90.0 * t1 + 298.0 * c1 + 45.0 * t1 * t1 - 252.0 * ep2 - 3.0 * c1 * c1)
                    * d6
                    / 720.0);

    let lambda = (d - (1.0 + 2.0 * t1 + c1) * d3 / 6.0
        + (5.0 - 2.0 * c1 + 28.0 * t1 - 3.0 * c1 * c1 + 8.0 * ep2 + 24.0 * t1 * t1) * d5 / 120.0)
        / cos_phi1;

    (central_meridian(zone) + lambda.to_degrees(), phi.to_degrees())
}
