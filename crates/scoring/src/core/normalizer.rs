//! Cross-sectional normalizer.
//!
//! Population statistics over every entity's derived metrics at one
//! snapshot timestamp: z-scores (plain, capped, MAD-based), winsorization,
//! percentile ranks and per-category median/MAD.
//!
//! Conventions shared by every function here:
//! - Inputs are columns of `Option<f64>`, one slot per entity. `None` and
//!   non-finite values are excluded from the population statistics and
//!   receive `None` in the output, so a missing entity never shifts the
//!   statistics of the others.
//! - Degenerate populations (one member, zero spread) produce `0`, never
//!   `NaN` or an infinity.
//! - Standard deviation is the population form (divide by `n`).

use std::collections::BTreeMap;

use crate::config::NormalizerConfig;
use crate::constants::MAD_CONSISTENCY;
use crate::errors::ScoringError;
use crate::types::{
    Category, CategorySpread, CrossSectionalStats, DerivedMetricRecord, FactorKey, FactorSpec,
    FactorStats, Normalization, Scope, Transform,
};

// ═══════════════════════════════════════════════════════════════════════════
// Scalar statistics
// ═══════════════════════════════════════════════════════════════════════════

/// Quantile of an ascending-sorted slice with linear interpolation between
/// closest ranks. `q` in `[0, 1]`.
pub fn quantile(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

pub fn median(values: &[f64]) -> Option<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    quantile(&sorted, 0.5)
}

/// Median absolute deviation from the median (unscaled).
pub fn mad(values: &[f64]) -> Option<f64> {
    let med = median(values)?;
    let deviations: Vec<f64> = values.iter().map(|v| (v - med).abs()).collect();
    median(&deviations)
}

/// Mean and population standard deviation.
pub fn mean_std(values: &[f64]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Some((mean, var.sqrt()))
}

/// Sign-preserving `ln(1 + |x|)`.
pub fn signed_log1p(x: f64) -> f64 {
    x.signum() * x.abs().ln_1p()
}

/// Zero spread, or every member equal. The second check catches the
/// rounding residue a mean-based std leaves on identical values.
fn is_degenerate(population: &[f64], spread: f64) -> bool {
    spread <= 0.0 || population.windows(2).all(|w| w[0] == w[1])
}

fn present(values: &[Option<f64>]) -> Vec<f64> {
    values.iter().flatten().copied().filter(|v| v.is_finite()).collect()
}

fn clean(v: Option<f64>) -> Option<f64> {
    v.filter(|x| x.is_finite())
}

// ═══════════════════════════════════════════════════════════════════════════
// Column operations
// ═══════════════════════════════════════════════════════════════════════════

pub fn apply_transform(values: &[Option<f64>], transform: Transform) -> Vec<Option<f64>> {
    values
        .iter()
        .map(|v| {
            clean(*v).map(|x| match transform {
                Transform::Identity => x,
                Transform::Log1p => signed_log1p(x),
            })
        })
        .collect()
}

/// `(x - mean) / std` after the optional transform.
pub fn zscore(values: &[Option<f64>], transform: Transform) -> Vec<Option<f64>> {
    let transformed = apply_transform(values, transform);
    let population = present(&transformed);
    let Some((mean, std)) = mean_std(&population) else {
        return vec![None; values.len()];
    };
    let degenerate = is_degenerate(&population, std);
    transformed
        .iter()
        .map(|v| v.map(|x| if degenerate { 0.0 } else { (x - mean) / std }))
        .collect()
}

/// [`zscore`] clamped to `[-cap, +cap]`.
///
/// 8σ covers effectively all of a normal distribution while still bounding
/// the influence of a single pathological value.
pub fn robust_zscore_capped(values: &[Option<f64>], cap: f64) -> Vec<Option<f64>> {
    zscore(values, Transform::Identity)
        .into_iter()
        .map(|z| z.map(|z| z.clamp(-cap, cap)))
        .collect()
}

/// MAD-based robust z-score `0.6745 * (x - median) / MAD`, clamped to
/// `[-cap, +cap]`. Zero MAD yields `0` for every member.
pub fn mad_zscore(values: &[Option<f64>], cap: f64) -> Vec<Option<f64>> {
    let population = present(values);
    let (Some(med), Some(spread)) = (median(&population), mad(&population)) else {
        return vec![None; values.len()];
    };
    let degenerate = is_degenerate(&population, spread);
    values
        .iter()
        .map(|v| {
            clean(*v).map(|x| {
                if degenerate {
                    0.0
                } else {
                    (MAD_CONSISTENCY * (x - med) / spread).clamp(-cap, cap)
                }
            })
        })
        .collect()
}

/// Clip values to the `low_pct` / `high_pct` population quantiles.
pub fn winsorize(values: &[Option<f64>], low_pct: f64, high_pct: f64) -> Vec<Option<f64>> {
    let mut sorted = present(values);
    sorted.sort_by(f64::total_cmp);
    let (Some(lo), Some(hi)) = (quantile(&sorted, low_pct), quantile(&sorted, high_pct)) else {
        return vec![None; values.len()];
    };
    values
        .iter()
        .map(|v| clean(*v).map(|x| x.clamp(lo, hi)))
        .collect()
}

/// Percentile rank in `[0, 100]` with ties sharing their average rank.
///
/// `100 * (below + 0.5 * (equal - 1)) / (n - 1)`; a single member ranks 50.
pub fn percentile_rank(values: &[Option<f64>]) -> Vec<Option<f64>> {
    let mut sorted = present(values);
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len();
    values
        .iter()
        .map(|v| {
            clean(*v).map(|x| {
                if n < 2 {
                    return 50.0;
                }
                let below = sorted.partition_point(|s| *s < x);
                let upto = sorted.partition_point(|s| *s <= x);
                let equal = upto - below;
                100.0 * (below as f64 + 0.5 * (equal as f64 - 1.0)) / (n - 1) as f64
            })
        })
        .collect()
}

/// Median and MAD of each category's values.
///
/// Uncategorized entities and missing values are skipped. A category with a
/// single member reports `(value, 0)`.
pub fn category_median_and_spread(
    values: &[(Option<Category>, Option<f64>)],
) -> BTreeMap<Category, CategorySpread> {
    let mut groups: BTreeMap<Category, Vec<f64>> = BTreeMap::new();
    for (category, value) in values {
        if let (Some(c), Some(v)) = (category, clean(*value)) {
            groups.entry(*c).or_default().push(v);
        }
    }
    groups
        .into_iter()
        .filter_map(|(category, members)| {
            let median = median(&members)?;
            let mad = if members.len() < 2 { 0.0 } else { mad(&members)? };
            Some((
                category,
                CategorySpread {
                    median,
                    mad,
                    count: members.len(),
                },
            ))
        })
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════════
// Factor normalization
// ═══════════════════════════════════════════════════════════════════════════

/// Normalized column for one factor of a score or risk formula, in record
/// order: transform, optional winsorization, then the configured
/// normalization over the factor's scope.
pub fn normalize_factor(
    records: &[DerivedMetricRecord],
    spec: &FactorSpec,
    config: &NormalizerConfig,
) -> Vec<Option<f64>> {
    let raw: Vec<Option<f64>> = records.iter().map(|r| r.factor(spec.factor)).collect();
    let transformed = apply_transform(&raw, spec.transform);
    let mut out = normalize_column(&transformed, spec, config);

    if spec.scope == Scope::Category {
        let mut groups: BTreeMap<Category, Vec<usize>> = BTreeMap::new();
        for (i, record) in records.iter().enumerate() {
            if let Some(c) = record.category {
                groups.entry(c).or_default().push(i);
            }
        }
        for indices in groups.values() {
            let column: Vec<Option<f64>> = indices.iter().map(|&i| transformed[i]).collect();
            let normalized = normalize_column(&column, spec, config);
            for (&i, value) in indices.iter().zip(normalized) {
                out[i] = value;
            }
        }
    }
    out
}

fn normalize_column(
    values: &[Option<f64>],
    spec: &FactorSpec,
    config: &NormalizerConfig,
) -> Vec<Option<f64>> {
    let count = values.iter().flatten().count();
    let values = if spec.winsorize && count >= config.min_sample_size {
        winsorize(values, config.winsor_low_pct, config.winsor_high_pct)
    } else {
        values.to_vec()
    };
    match spec.normalization {
        Normalization::Raw => values,
        Normalization::ZScore => zscore(&values, Transform::Identity),
        Normalization::CappedZScore => robust_zscore_capped(&values, config.robust_cap),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Snapshot statistics
// ═══════════════════════════════════════════════════════════════════════════

/// Fail if any record belongs to a different snapshot than `snapshot_ts`.
pub fn ensure_same_snapshot(
    snapshot_ts: i64,
    records: &[DerivedMetricRecord],
) -> Result<(), ScoringError> {
    match records.iter().find(|r| r.snapshot_ts != snapshot_ts) {
        Some(r) => Err(ScoringError::MixedSnapshot {
            expected: snapshot_ts,
            found: r.snapshot_ts,
            netuid: r.netuid,
        }),
        None => Ok(()),
    }
}

/// Full cross-sectional statistics for one snapshot's population.
///
/// Factors with no values in the population are omitted.
pub fn compute_cross_sectional_stats(
    snapshot_ts: i64,
    records: &[DerivedMetricRecord],
    config: &NormalizerConfig,
) -> Result<CrossSectionalStats, ScoringError> {
    ensure_same_snapshot(snapshot_ts, records)?;

    let mut factors = BTreeMap::new();
    for key in FactorKey::ALL {
        if let Some(stats) = factor_stats(records, key, config) {
            factors.insert(key, stats);
        }
    }

    Ok(CrossSectionalStats {
        snapshot_ts,
        population: records.len(),
        factors,
    })
}

fn factor_stats(
    records: &[DerivedMetricRecord],
    key: FactorKey,
    config: &NormalizerConfig,
) -> Option<FactorStats> {
    let column: Vec<Option<f64>> = records.iter().map(|r| clean(r.factor(key))).collect();
    let population = present(&column);
    let (mean, std) = mean_std(&population)?;

    let by_netuid = |values: Vec<Option<f64>>| -> BTreeMap<u32, f64> {
        records
            .iter()
            .zip(values)
            .filter_map(|(r, v)| v.map(|v| (r.netuid, v)))
            .collect()
    };

    let grouped: Vec<(Option<Category>, Option<f64>)> =
        records.iter().zip(&column).map(|(r, v)| (r.category, *v)).collect();

    Some(FactorStats {
        count: population.len(),
        mean,
        std,
        median: median(&population)?,
        mad: mad(&population)?,
        zscores: by_netuid(robust_zscore_capped(&column, config.robust_cap)),
        robust_zscores: by_netuid(mad_zscore(&column, config.robust_cap)),
        percentiles: by_netuid(percentile_rank(&column)),
        by_category: category_median_and_spread(&grouped),
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════
