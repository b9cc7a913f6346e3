//! Capture quality gate.
//!
//! Decides which capture groups may be mosaicked and animated. Rules run in
//! a fixed order and the first failing rule is reported:
//!
//! 1. **Coverage**: a group must hold at least `min_tile_coverage` of the
//!    batch's largest group (by tile count).
//! 2. **Version**: the group's product version must be at least
//!    `min_product_version`. Failing groups are also recorded in the
//!    [`RejectionLedger`] so their outcome ids can be audited.
//! 3. **Cloud**: the group's mean cloud cover must not exceed
//!    `cloud_threshold`. An unknown (NaN) mean fails.

use anyhow::{bail, Context, Result};
use semver::Version;
use std::collections::BTreeSet;

use crate::config::QualityConfig;
use crate::error::{PipelineError, RejectReason};
use crate::group::max_tile_count;
use crate::models::CaptureGroup;

/// Parse a product version leniently: `"1"` and `"1.2"` are padded to three
/// components, and a leading `v` is ignored.
pub fn parse_version(raw: &str) -> Result<Version> {
    let trimmed = raw.trim().trim_start_matches(['v', 'V']);
    if trimmed.is_empty() {
        bail!("empty version string");
    }
    let (core, suffix) = match trimmed.find(['-', '+']) {
        Some(idx) => trimmed.split_at(idx),
        None => (trimmed, ""),
    };
    let mut parts: Vec<&str> = core.split('.').collect();
    if parts.len() > 3 {
        bail!("version '{}' has more than three components", raw);
    }
    while parts.len() < 3 {
        parts.push("0");
    }
    let normalized = format!("{}{}", parts.join("."), suffix);
    Version::parse(&normalized).with_context(|| format!("invalid version '{}'", raw))
}

#[derive(Debug, Clone)]
pub struct QualityThresholds {
    pub cloud_threshold: f64,
    pub min_tile_coverage: f64,
    pub min_product_version: Version,
}

impl QualityThresholds {
    pub fn from_config(config: &QualityConfig) -> Result<Self> {
        Ok(Self {
            cloud_threshold: config.cloud_threshold,
            min_tile_coverage: config.min_tile_coverage,
            min_product_version: parse_version(&config.min_product_version)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Accept,
    Reject(RejectReason),
}

impl GateDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, GateDecision::Accept)
    }
}

/// Outcome ids turned away for an incompatible product version, plus every
/// rejection with its reason.
#[derive(Debug, Clone, Default)]
pub struct RejectionLedger {
    pub invalid_outcomes: BTreeSet<String>,
    pub rejections: Vec<(String, RejectReason)>,
}

impl RejectionLedger {
    pub fn record(&mut self, outcome_id: &str, reason: RejectReason) {
        if matches!(reason, RejectReason::IncompatibleVersion { .. }) {
            self.invalid_outcomes.insert(outcome_id.to_string());
        }
        self.rejections.push((outcome_id.to_string(), reason));
    }

    pub fn merge(&mut self, other: RejectionLedger) {
        self.invalid_outcomes.extend(other.invalid_outcomes);
        self.rejections.extend(other.rejections);
    }
}

/// Quality gate bound to one batch of capture groups.
///
/// The coverage rule is relative to the largest group in the batch, so the
/// gate captures that maximum when it is built.
#[derive(Debug, Clone)]
pub struct CaptureQualityGate {
    thresholds: QualityThresholds,
    max_tile_count: usize,
}

impl CaptureQualityGate {
    pub fn new(thresholds: QualityThresholds, batch: &[CaptureGroup]) -> Self {
        Self {
            thresholds,
            max_tile_count: max_tile_count(batch),
        }
    }

    pub fn max_tile_count(&self) -> usize {
        self.max_tile_count
    }

    pub fn evaluate(&self, group: &CaptureGroup) -> GateDecision {
        let required = self.max_tile_count as f64 * self.thresholds.min_tile_coverage;
        if (group.tile_count() as f64) < required {
            return GateDecision::Reject(RejectReason::InsufficientCoverage {
                tile_count: group.tile_count(),
                max_tile_count: self.max_tile_count,
            });
        }

        let version = group.product_version();
        let compatible = version
            .and_then(|v| parse_version(v).ok())
            .map(|v| v >= self.thresholds.min_product_version)
            .unwrap_or(false);
        if !compatible {
            return GateDecision::Reject(RejectReason::IncompatibleVersion {
                version: version.map(str::to_string),
            });
        }

        let cloud = group.mean_cloud_cover;
        if cloud.is_nan() || cloud > self.thresholds.cloud_threshold {
            return GateDecision::Reject(RejectReason::ExcessCloudCover {
                mean_cloud_cover: cloud,
            });
        }

        GateDecision::Accept
    }

    /// Keep accepted groups in their original order; record the rest.
    pub fn apply(&self, groups: Vec<CaptureGroup>, ledger: &mut RejectionLedger) -> Vec<CaptureGroup> {
        let mut accepted = Vec::with_capacity(groups.len());
        for group in groups {
            match self.evaluate(&group) {
                GateDecision::Accept => accepted.push(group),
                GateDecision::Reject(reason) => {
                    let rejection = PipelineError::CaptureRejected {
                        outcome_id: group.outcome_id().to_string(),
                        reason: reason.clone(),
                    };
                    tracing::warn!(capture = %group.capture_date, "{}", rejection);
                    ledger.record(group.outcome_id(), reason);
                }
            }
        }
        accepted
    }
}
