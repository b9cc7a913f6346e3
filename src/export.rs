//! File exports: footprint GeoJSON, basemap tile selection, and the audit
//! list of outcomes rejected for an incompatible product version.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use crate::crs::Crs;
use crate::geometry;
use crate::group::group_by_outcome;
use crate::models::TileRecord;

fn stamp(now: DateTime<Utc>) -> String {
    now.format("%Y%m%dT%H%M%S").to_string()
}

/// One GeoJSON feature per outcome: the union of its tile footprints in
/// EPSG:4326 with summary properties.
pub fn footprints_geojson(tiles: &[TileRecord], crs: Crs) -> Value {
    let features: Vec<Value> = group_by_outcome(tiles)
        .into_iter()
        .map(|(outcome_id, members)| {
            let footprint = geometry::union_all(members.iter().map(|t| &t.footprint));
            let footprint = geometry::reproject(&footprint, crs, Crs::Wgs84);
            let capture_date = members.iter().map(|t| t.capture_date).min();
            let covers: Vec<f64> = members.iter().filter_map(|t| t.cloud_cover).collect();
            let mean_cloud_cover = if covers.is_empty() {
                None
            } else {
                Some((covers.iter().sum::<f64>() / covers.len() as f64).round())
            };
            json!({
                "type": "Feature",
                "geometry": geometry::to_geojson(&footprint),
                "properties": {
                    "outcome_id": outcome_id,
                    "capture_date": capture_date.map(|d| d.to_rfc3339()),
                    "tile_count": members.len(),
                    "cloud_cover": mean_cloud_cover,
                    "product_version": members.first().and_then(|t| t.product_version.clone()),
                }
            })
        })
        .collect();

    json!({ "type": "FeatureCollection", "features": features })
}

/// Write [`footprints_geojson`] to `dir/footprints_<timestamp>.geojson`.
pub fn write_footprints(tiles: &[TileRecord], crs: Crs, dir: &Path, now: DateTime<Utc>) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("footprints_{}.geojson", stamp(now)));
    let json = serde_json::to_string_pretty(&footprints_geojson(tiles, crs))?;
    std::fs::write(&path, json)?;
    Ok(path)
}

/// Pick the newest clear tile for every grid cell.
///
/// A tile qualifies when its cloud cover is known and at most
/// `cloud_threshold`, and its valid-pixel percentage is at least
/// `min_valid_pixel`.
pub fn select_basemap_tiles(tiles: &[TileRecord], cloud_threshold: f64, min_valid_pixel: f64) -> Vec<&TileRecord> {
    let mut candidates: Vec<&TileRecord> = tiles
        .iter()
        .filter(|t| t.cloud_cover.is_some_and(|c| c <= cloud_threshold))
        .filter(|t| t.valid_pixel_percent.is_some_and(|v| v >= min_valid_pixel))
        .collect();
    candidates.sort_by(|a, b| {
        b.capture_date
            .cmp(&a.capture_date)
            .then_with(|| a.id.cmp(&b.id))
    });

    let mut seen: HashSet<&str> = HashSet::new();
    candidates
        .into_iter()
        .filter(|&t| seen.insert(t.grid_cell.as_deref().unwrap_or(t.id.as_str())))
        .collect()
}

/// GeoJSON of a basemap selection: one feature per tile, footprint in
/// EPSG:4326.
pub fn basemap_geojson(tiles: &[&TileRecord], crs: Crs) -> Value {
    let features: Vec<Value> = tiles
        .iter()
        .map(|t| {
            json!({
                "type": "Feature",
                "id": t.id,
                "geometry": geometry::to_geojson(&geometry::reproject(&t.footprint, crs, Crs::Wgs84)),
                "properties": {
                    "outcome_id": t.outcome_id,
                    "grid_cell": t.grid_cell,
                    "capture_date": t.capture_date.to_rfc3339(),
                    "cloud_cover": t.cloud_cover,
                    "valid_pixel_percent": t.valid_pixel_percent,
                    "age_days": t.age_days,
                    "analytic": t.assets.analytic,
                }
            })
        })
        .collect();
    json!({ "type": "FeatureCollection", "features": features })
}

/// Write rejected outcome ids, one per line, to
/// `dir/invalid_outcome_ids_<timestamp>.txt`. Nothing is written for an
/// empty set.
pub fn write_invalid_outcomes(ids: &BTreeSet<String>, dir: &Path, now: DateTime<Utc>) -> Result<Option<PathBuf>> {
    if ids.is_empty() {
        return Ok(None);
    }
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("invalid_outcome_ids_{}.txt", stamp(now)));
    let mut body = String::new();
    for id in ids {
        body.push_str(id);
        body.push('\n');
    }
    std::fs::write(&path, body)?;
    tracing::info!(count = ids.len(), "invalid outcome ids written to {}", path.display());
    Ok(Some(path))
}

/// Write pretty JSON to `output`, or to stdout when `output` is `None`.
pub fn write_json(value: &Value, output: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, &json)?;
            eprintln!("Wrote {}", path.display());
        }
        None => {
            println!("{}", json);
        }
    }
    Ok(())
}
