use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::entity::Category;
use super::metrics::FactorKey;

/// Median and MAD of one factor within one category.
///
/// A single-member category reports `(value, 0)`; callers detect "no real
/// peer group" via `count < 2`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CategorySpread {
    pub median: f64,
    pub mad: f64,
    pub count: usize,
}

/// Population statistics of one factor at one snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorStats {
    /// Entities with a value for this factor.
    pub count: usize,
    pub mean: f64,
    /// Population standard deviation.
    pub std: f64,
    pub median: f64,
    /// Median absolute deviation (unscaled).
    pub mad: f64,
    /// Capped z-score per netuid.
    pub zscores: BTreeMap<u32, f64>,
    /// MAD-based robust z-score per netuid.
    pub robust_zscores: BTreeMap<u32, f64>,
    /// Percentile rank (0-100) per netuid.
    pub percentiles: BTreeMap<u32, f64>,
    pub by_category: BTreeMap<Category, CategorySpread>,
}

/// Cross-sectional statistics over every record sharing one snapshot
/// timestamp. Recomputed in full each cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossSectionalStats {
    pub snapshot_ts: i64,
    pub population: usize,
    pub factors: BTreeMap<FactorKey, FactorStats>,
}
