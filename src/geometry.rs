//! Footprint geometry helpers built on the `geo` crate.
//!
//! Footprints are kept as `MultiPolygon<f64>` so that a repaired
//! self-intersecting polygon (which may split into pieces) and the union of
//! a capture's tiles share one representation.

use geo::{BooleanOps, BoundingRect, Coord, LineString, MapCoords, MultiPolygon, Polygon};
use serde::Serialize;
use serde_json::{json, Value};

use crate::crs::{transform, Crs};

/// Axis-aligned extent in some CRS.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Bounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bounds {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_x + self.max_x) / 2.0,
            (self.min_y + self.max_y) / 2.0,
        )
    }

    pub fn union(&self, other: &Bounds) -> Bounds {
        Bounds {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    /// Bounds of this extent after transforming it into `to`.
    ///
    /// Samples the edges, not only the corners, since projected edges bow.
    pub fn transformed(&self, from: Crs, to: Crs) -> Bounds {
        if from == to {
            return *self;
        }
        const STEPS: usize = 8;
        let mut out: Option<Bounds> = None;
        for i in 0..=STEPS {
            let t = i as f64 / STEPS as f64;
            let x = self.min_x + t * self.width();
            let y = self.min_y + t * self.height();
            for (px, py) in [
                (x, self.min_y),
                (x, self.max_y),
                (self.min_x, y),
                (self.max_x, y),
            ] {
                let (tx, ty) = transform(from, to, px, py);
                let point = Bounds::new(tx, ty, tx, ty);
                out = Some(match out {
                    Some(b) => b.union(&point),
                    None => point,
                });
            }
        }
        out.unwrap_or(*self)
    }

    pub fn to_polygon(&self) -> Polygon<f64> {
        Polygon::new(
            LineString::from(vec![
                (self.min_x, self.min_y),
                (self.max_x, self.min_y),
                (self.max_x, self.max_y),
                (self.min_x, self.max_y),
                (self.min_x, self.min_y),
            ]),
            vec![],
        )
    }
}

/// Bounds of a footprint, or `None` when it is empty.
pub fn bounds_of(footprint: &MultiPolygon<f64>) -> Option<Bounds> {
    footprint
        .bounding_rect()
        .map(|r| Bounds::new(r.min().x, r.min().y, r.max().x, r.max().y))
}

/// Repair a footprint the way a zero-width buffer does: self-intersections
/// are resolved, duplicate rings merged, and non-finite vertices rejected.
pub fn repair(footprint: &MultiPolygon<f64>) -> MultiPolygon<f64> {
    let finite = footprint.0.iter().all(|polygon| {
        polygon
            .exterior()
            .coords()
            .chain(polygon.interiors().iter().flat_map(|ring| ring.coords()))
            .all(|c| c.x.is_finite() && c.y.is_finite())
    });
    if !finite {
        return MultiPolygon::new(vec![]);
    }
    footprint.union(&MultiPolygon::new(vec![]))
}

/// Transform every vertex of a footprint into another CRS.
pub fn reproject(footprint: &MultiPolygon<f64>, from: Crs, to: Crs) -> MultiPolygon<f64> {
    if from == to {
        return footprint.clone();
    }
    footprint.map_coords(move |c: Coord<f64>| {
        let (x, y) = transform(from, to, c.x, c.y);
        Coord { x, y }
    })
}

/// Union of a set of footprints.
pub fn union_all<'a>(footprints: impl IntoIterator<Item = &'a MultiPolygon<f64>>) -> MultiPolygon<f64> {
    footprints
        .into_iter()
        .fold(MultiPolygon::new(vec![]), |acc, next| acc.union(next))
}

/// Parse a GeoJSON `Polygon` or `MultiPolygon` geometry object.
pub fn from_geojson(value: &Value) -> Option<MultiPolygon<f64>> {
    let kind = value.get("type")?.as_str()?;
    let coordinates = value.get("coordinates")?;
    match kind {
        "Polygon" => Some(MultiPolygon::new(vec![parse_polygon(coordinates)?])),
        "MultiPolygon" => {
            let polygons = coordinates
                .as_array()?
                .iter()
                .map(parse_polygon)
                .collect::<Option<Vec<_>>>()?;
            Some(MultiPolygon::new(polygons))
        }
        _ => None,
    }
}

fn parse_polygon(value: &Value) -> Option<Polygon<f64>> {
    let mut rings = value
        .as_array()?
        .iter()
        .map(parse_ring)
        .collect::<Option<Vec<_>>>()?
        .into_iter();
    let exterior = rings.next()?;
    Some(Polygon::new(exterior, rings.collect()))
}

fn parse_ring(value: &Value) -> Option<LineString<f64>> {
    let coords = value
        .as_array()?
        .iter()
        .map(|pos| {
            let pos = pos.as_array()?;
            Some(Coord {
                x: pos.first()?.as_f64()?,
                y: pos.get(1)?.as_f64()?,
            })
        })
        .collect::<Option<Vec<_>>>()?;
    if coords.len() < 3 {
        return None;
    }
    Some(LineString::new(coords))
}

/// Serialize a footprint as a GeoJSON `MultiPolygon` geometry object.
pub fn to_geojson(footprint: &MultiPolygon<f64>) -> Value {
    let ring = |ls: &LineString<f64>| -> Vec<[f64; 2]> { ls.coords().map(|c| [c.x, c.y]).collect() };
    let polygons: Vec<Vec<Vec<[f64; 2]>>> = footprint
        .0
        .iter()
        .map(|polygon| {
            std::iter::once(polygon.exterior())
                .chain(polygon.interiors().iter())
                .map(ring)
                .collect()
        })
        .collect();
    json!({ "type": "MultiPolygon", "coordinates": polygons })
}
