//! Tile record normalization.
//!
//! Converts raw catalog items into [`TileRecord`]s: parses the footprint,
//! reprojects it into the search's canonical CRS, repairs it, and computes
//! the tile age. The canonical CRS is the native CRS of the first usable
//! item of the first non-empty chunk; it is threaded through later chunks so
//! that every tile of a search shares one CRS.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::crs::Crs;
use crate::error::PipelineError;
use crate::geometry;
use crate::models::{AssetRefs, RawItem, TileRecord};

/// Tiles of one chunk together with the canonical CRS they were placed in.
#[derive(Debug, Clone)]
pub struct NormalizedChunk {
    pub crs: Option<Crs>,
    pub tiles: Vec<TileRecord>,
}

/// Normalize one chunk's items.
///
/// `canonical` is the CRS chosen by an earlier chunk, if any. Items that
/// cannot be normalized are dropped with a warning; one bad item never fails
/// the chunk.
pub fn normalize_chunk(items: Vec<RawItem>, canonical: Option<Crs>, now: DateTime<Utc>) -> NormalizedChunk {
    let mut crs = canonical;
    let mut tiles = Vec::with_capacity(items.len());

    for item in items {
        match normalize_item(item, &mut crs, now) {
            Ok(tile) => tiles.push(tile),
            Err(e) => tracing::warn!("dropping tile: {}", e),
        }
    }

    NormalizedChunk { crs, tiles }
}

fn normalize_item(item: RawItem, canonical: &mut Option<Crs>, now: DateTime<Utc>) -> Result<TileRecord, PipelineError> {
    let epsg = item.epsg.ok_or_else(|| PipelineError::MissingCrs {
        tile_id: item.id.clone(),
    })?;
    let native_crs = Crs::from_epsg(epsg).ok_or_else(|| PipelineError::UnsupportedCrs {
        tile_id: item.id.clone(),
        epsg,
    })?;
    let capture_date = item.datetime.ok_or_else(|| malformed(&item, "datetime"))?;
    let outcome_id = item
        .outcome_id
        .clone()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| malformed(&item, "satl:outcome_id"))?;
    let footprint = item
        .geometry
        .as_ref()
        .and_then(geometry::from_geojson)
        .ok_or_else(|| malformed(&item, "geometry"))?;

    let crs = *canonical.get_or_insert(native_crs);
    let footprint = geometry::repair(&geometry::reproject(&footprint, Crs::Wgs84, crs));
    if footprint.0.is_empty() {
        return Err(malformed(&item, "geometry"));
    }

    let age_days = (now - capture_date).num_seconds().div_euclid(86_400);
    let mut assets = item.assets;

    Ok(TileRecord {
        id: item.id,
        capture_date,
        outcome_id,
        cloud_cover: item.cloud_cover.filter(|c| c.is_finite()),
        valid_pixel_percent: item.valid_pixel_percent,
        product_version: item.product_version,
        grid_cell: item.grid_cell,
        footprint,
        crs,
        native_crs,
        assets: AssetRefs {
            analytic: assets.remove("analytic"),
            preview: assets.remove("preview"),
            thumbnail: assets.remove("thumbnail"),
        },
        age_days,
        image_count: 0,
    })
}

fn malformed(item: &RawItem, field: &'static str) -> PipelineError {
    PipelineError::MalformedTile {
        tile_id: item.id.clone(),
        field,
    }
}

/// Set each tile's `image_count` to the number of tiles in the batch that
/// share its grid cell. Tiles without a grid cell count only themselves.
pub fn assign_image_counts(tiles: &mut [TileRecord]) {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for tile in tiles.iter() {
        if let Some(cell) = &tile.grid_cell {
            *counts.entry(cell.clone()).or_default() += 1;
        }
    }
    for tile in tiles.iter_mut() {
        tile.image_count = tile
            .grid_cell
            .as_ref()
            .and_then(|cell| counts.get(cell).copied())
            .unwrap_or(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn item(id: &str, epsg: Option<u32>, lon: f64) -> RawItem {
        RawItem {
            id: id.to_string(),
            datetime: Some(Utc.with_ymd_and_hms(2023, 6, 1, 10, 30, 0).unwrap()),
            epsg,
            geometry: Some(json!({
                "type": "Polygon",
                "coordinates": [[[lon, 41.0], [lon + 0.01, 41.0], [lon + 0.01, 41.01], [lon, 41.01], [lon, 41.0]]]
            })),
            cloud_cover: Some(5.0),
            outcome_id: Some("o1".to_string()),
            grid_cell: Some("cell".to_string()),
            product_version: Some("1.0.0".to_string()),
            ..Default::default()
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 6, 11, 10, 29, 0).unwrap()
    }

    #[test]
    fn first_crs_becomes_canonical() {
        let items = vec![
            item("a", Some(32631), 2.0),
            item("b", Some(32632), 6.5),
            item("c", Some(4326), 2.1),
        ];
        let chunk = normalize_chunk(items, None, now());
        let utm31 = Crs::Utm { zone: 31, north: true };
        assert_eq!(chunk.crs, Some(utm31));
        assert_eq!(chunk.tiles.len(), 3);
        assert!(chunk.tiles.iter().all(|t| t.crs == utm31));
        assert_eq!(chunk.tiles[1].native_crs, Crs::Utm { zone: 32, north: true });
        let b = geometry::bounds_of(&chunk.tiles[0].footprint).unwrap();
        assert!(b.min_x > 400_000.0 && b.max_x < 500_000.0);
    }

    #[test]
    fn earlier_canonical_crs_is_kept() {
        let chunk = normalize_chunk(vec![item("a", Some(32631), 2.0)], Some(Crs::WebMercator), now());
        assert_eq!(chunk.crs, Some(Crs::WebMercator));
        assert_eq!(chunk.tiles[0].crs, Crs::WebMercator);
        assert_eq!(chunk.tiles[0].native_crs, Crs::Utm { zone: 31, north: true });
    }

    #[test]
    fn drops_tiles_without_usable_crs() {
        let items = vec![
            item("no-crs", None, 2.0),
            item("odd-crs", Some(2154), 2.0),
            item("ok", Some(32631), 2.0),
        ];
        let chunk = normalize_chunk(items, None, now());
        assert_eq!(chunk.tiles.len(), 1);
        assert_eq!(chunk.tiles[0].id, "ok");
    }

    #[test]
    fn drops_tiles_missing_required_fields() {
        let mut no_outcome = item("x", Some(32631), 2.0);
        no_outcome.outcome_id = None;
        let mut no_geometry = item("y", Some(32631), 2.0);
        no_geometry.geometry = None;
        let chunk = normalize_chunk(vec![no_outcome, no_geometry], None, now());
        assert!(chunk.tiles.is_empty());
        assert_eq!(chunk.crs, None);
    }

    #[test]
    fn age_is_whole_days() {
        let chunk = normalize_chunk(vec![item("a", Some(4326), 2.0)], None, now());
        assert_eq!(chunk.tiles[0].age_days, 9);
        let later = now() + Duration::minutes(2);
        let chunk = normalize_chunk(vec![item("a", Some(4326), 2.0)], None, later);
        assert_eq!(chunk.tiles[0].age_days, 10);
    }

    #[test]
    fn image_counts_per_grid_cell() {
        let mut chunk = normalize_chunk(
            vec![
                item("a", Some(4326), 2.0),
                item("b", Some(4326), 2.0),
                item("c", Some(4326), 2.0),
            ],
            None,
            now(),
        );
        chunk.tiles[2].grid_cell = Some("other".to_string());
        assign_image_counts(&mut chunk.tiles);
        let counts: Vec<usize> = chunk.tiles.iter().map(|t| t.image_count).collect();
        assert_eq!(counts, vec![2, 2, 1]);
    }
}
