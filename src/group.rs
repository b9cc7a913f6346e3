//! Capture grouping.
//!
//! Tiles of one imaging pass share an outcome id and were recorded within a
//! fraction of a second of each other. Grouping clusters each outcome's tiles
//! in time order: a tile joins the current cluster while it lies less than
//! one time bucket after the cluster's first tile (its anchor), otherwise it
//! opens a new cluster. The capture key is the anchor truncated to whole
//! seconds plus the outcome id.

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::models::{CaptureGroup, CaptureKey, TileRecord};

/// Partition tiles into capture groups.
///
/// Every input tile lands in exactly one group. Groups come back ordered by
/// capture date, then outcome id.
pub fn group_captures(tiles: Vec<TileRecord>, bucket: Duration) -> Vec<CaptureGroup> {
    let mut by_outcome: BTreeMap<String, Vec<TileRecord>> = BTreeMap::new();
    for tile in tiles {
        by_outcome.entry(tile.outcome_id.clone()).or_default().push(tile);
    }

    let mut groups = Vec::new();
    for (outcome_id, mut members) in by_outcome {
        members.sort_by(|a, b| {
            a.capture_date
                .cmp(&b.capture_date)
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut anchor: Option<DateTime<Utc>> = None;
        let mut current: Vec<TileRecord> = Vec::new();
        for tile in members {
            match anchor {
                Some(a) if tile.capture_date - a < bucket => current.push(tile),
                _ => {
                    if let Some(a) = anchor {
                        groups.push(finish(a, &outcome_id, std::mem::take(&mut current)));
                    }
                    anchor = Some(tile.capture_date);
                    current.push(tile);
                }
            }
        }
        if let Some(a) = anchor {
            groups.push(finish(a, &outcome_id, current));
        }
    }

    groups.sort_by(|a, b| {
        a.capture_date
            .cmp(&b.capture_date)
            .then_with(|| a.key.cmp(&b.key))
    });
    groups
}

fn finish(anchor: DateTime<Utc>, outcome_id: &str, tiles: Vec<TileRecord>) -> CaptureGroup {
    let bucket = anchor
        .duration_trunc(Duration::seconds(1))
        .unwrap_or(anchor);
    CaptureGroup::new(
        CaptureKey {
            bucket,
            outcome_id: outcome_id.to_string(),
        },
        tiles,
    )
}

/// Group tiles by outcome id alone, ignoring capture time.
///
/// Used for per-outcome summaries and footprint export, where every tile of
/// an outcome belongs together regardless of how many passes produced it.
pub fn group_by_outcome(tiles: &[TileRecord]) -> BTreeMap<String, Vec<&TileRecord>> {
    let mut out: BTreeMap<String, Vec<&TileRecord>> = BTreeMap::new();
    for tile in tiles {
        out.entry(tile.outcome_id.clone()).or_default().push(tile);
    }
    out
}

/// Largest group size in a batch; 0 for an empty batch.
pub fn max_tile_count(groups: &[CaptureGroup]) -> usize {
    groups.iter().map(|g| g.tile_count()).max().unwrap_or(0)
}

/// Per-outcome overview of a search result.
#[derive(Debug, Clone, Serialize)]
pub struct OutcomeSummary {
    pub outcome_id: String,
    pub capture_date: DateTime<Utc>,
    pub tile_count: usize,
    pub mean_cloud_cover: Option<f64>,
    pub product_version: Option<String>,
    pub age_days: i64,
}

/// Summaries of every outcome, newest first.
pub fn summarize(tiles: &[TileRecord]) -> Vec<OutcomeSummary> {
    let mut out: Vec<OutcomeSummary> = group_by_outcome(tiles)
        .into_iter()
        .filter_map(|(outcome_id, members)| {
            let first = members.iter().copied().min_by(|a, b| {
                a.capture_date
                    .cmp(&b.capture_date)
                    .then_with(|| a.id.cmp(&b.id))
            })?;
            let covers: Vec<f64> = members.iter().filter_map(|t| t.cloud_cover).collect();
            let mean_cloud_cover = if covers.is_empty() {
                None
            } else {
                Some(covers.iter().sum::<f64>() / covers.len() as f64)
            };
            Some(OutcomeSummary {
                outcome_id,
                capture_date: first.capture_date,
                tile_count: members.len(),
                mean_cloud_cover,
                product_version: first.product_version.clone(),
                age_days: first.age_days,
            })
        })
        .collect();
    out.sort_by(|a, b| {
        b.capture_date
            .cmp(&a.capture_date)
            .then_with(|| a.outcome_id.cmp(&b.outcome_id))
    });
    out
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::crs::Crs;
    use crate::geometry::Bounds;
    use crate::models::AssetRefs;
    use chrono::TimeZone;
    use geo::MultiPolygon;

    pub(crate) fn tile(id: &str, outcome: &str, at: DateTime<Utc>, cloud: Option<f64>) -> TileRecord {
        TileRecord {
            id: id.to_string(),
            capture_date: at,
            outcome_id: outcome.to_string(),
            cloud_cover: cloud,
            valid_pixel_percent: Some(100.0),
            product_version: Some("1.2.0".to_string()),
            grid_cell: Some(format!("cell-{}", id)),
            footprint: MultiPolygon::new(vec![Bounds::new(0.0, 0.0, 1.0, 1.0).to_polygon()]),
            crs: Crs::Wgs84,
            native_crs: Crs::Wgs84,
            assets: AssetRefs::default(),
            age_days: 0,
            image_count: 1,
        }
    }

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 6, 1, 10, 30, 0).unwrap()
    }

    #[test]
    fn sub_second_tiles_share_a_group() {
        let t0 = base() + Duration::milliseconds(100);
        let tiles = vec![
            tile("a", "X", t0, Some(10.0)),
            tile("b", "X", t0 + Duration::milliseconds(400), Some(20.0)),
        ];
        let groups = group_captures(tiles, Duration::seconds(1));
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].tile_count(), 2);
        assert_eq!(groups[0].key.bucket, base());
        assert_eq!(groups[0].capture_date, t0);
        assert!((groups[0].mean_cloud_cover - 15.0).abs() < 1e-9);
    }

    #[test]
    fn jitter_across_a_second_boundary_still_merges() {
        let t0 = base() + Duration::milliseconds(800);
        let tiles = vec![
            tile("a", "X", t0, Some(10.0)),
            tile("b", "X", t0 + Duration::milliseconds(400), Some(10.0)),
        ];
        let groups = group_captures(tiles, Duration::seconds(1));
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].tile_count(), 2);
        assert_eq!(groups[0].key.bucket, base());
    }

    #[test]
    fn tiles_far_apart_split() {
        let t0 = base();
        let tiles = vec![
            tile("a", "X", t0, Some(10.0)),
            tile("b", "X", t0 + Duration::milliseconds(1600), Some(10.0)),
        ];
        let groups = group_captures(tiles, Duration::seconds(1));
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn same_time_different_outcomes_split() {
        let t0 = base();
        let tiles = vec![tile("a", "X", t0, None), tile("b", "Y", t0, None)];
        let groups = group_captures(tiles, Duration::seconds(1));
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].outcome_id(), "X");
        assert_eq!(groups[1].outcome_id(), "Y");
    }

    #[test]
    fn every_tile_in_exactly_one_group() {
        let t0 = base();
        let tiles: Vec<_> = (0..20)
            .map(|i| {
                tile(
                    &format!("t{}", i),
                    if i % 3 == 0 { "X" } else { "Y" },
                    t0 + Duration::milliseconds(i * 350),
                    Some(5.0),
                )
            })
            .collect();
        let groups = group_captures(tiles, Duration::seconds(1));
        let mut ids: Vec<String> = groups
            .iter()
            .flat_map(|g| g.tiles.iter().map(|t| t.id.clone()))
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 20);
        let total: usize = groups.iter().map(|g| g.tile_count()).sum();
        assert_eq!(total, 20);
    }

    #[test]
    fn missing_cloud_cover_counts_as_worst() {
        let t0 = base();
        let tiles = vec![tile("a", "X", t0, Some(0.0)), tile("b", "X", t0, None)];
        let groups = group_captures(tiles, Duration::seconds(1));
        assert!((groups[0].mean_cloud_cover - 50.5).abs() < 1e-9);
    }

    #[test]
    fn summary_is_newest_first() {
        let t0 = base();
        let tiles = vec![
            tile("a", "old", t0, Some(10.0)),
            tile("b", "new", t0 + Duration::days(3), Some(30.0)),
            tile("c", "new", t0 + Duration::days(3), None),
        ];
        let summary = summarize(&tiles);
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].outcome_id, "new");
        assert_eq!(summary[0].tile_count, 2);
        assert_eq!(summary[0].mean_cloud_cover, Some(30.0));
        assert_eq!(summary[1].outcome_id, "old");
    }
}
