//! Outlier and alert detection.
//!
//! Two independent outputs per snapshot:
//! - Risk tiers: a small weighted risk formula over normalized factors,
//!   classified against the watchlist and red-flag thresholds. Missing
//!   factors contribute nothing and are not renormalized away, so partial
//!   evidence can only lower a risk score, never inflate it.
//! - Factor outliers: MAD-based robust z-scores above the outlier threshold,
//!   listed per factor for populations large enough to make them meaningful.

use std::cmp::Ordering;

use tracing::info;

use super::normalizer::{ensure_same_snapshot, normalize_factor};
use crate::config::NormalizerConfig;
use crate::errors::ScoringError;
use crate::types::{
    AlertFlag, AlertTier, CrossSectionalStats, DerivedMetricRecord, FactorContribution,
    FactorSpec, OutlierFlag, QualityIssue, QualityLog, RiskDefinition,
};

/// Tier for a risk score. No score (no well-defined factor) is `None` tier.
pub fn classify_tier(risk_score: Option<f64>, definition: &RiskDefinition) -> AlertTier {
    match risk_score {
        Some(r) if r >= definition.red_flag_threshold => AlertTier::RedFlag,
        Some(r) if r >= definition.watchlist_threshold => AlertTier::Watchlist,
        _ => AlertTier::None,
    }
}

/// Risk score `sum(weight * sign * normalized)` over well-defined factors.
///
/// Returns the score (or `None` if no factor was usable) and contributions
/// ordered largest first, unusable factors last in definition order.
pub fn compute_risk(
    record: &DerivedMetricRecord,
    specs: &[FactorSpec],
    normalized: &[Option<f64>],
    quality: &mut QualityLog,
) -> (Option<f64>, Vec<FactorContribution>) {
    let mut contributions: Vec<FactorContribution> = specs
        .iter()
        .zip(normalized)
        .map(|(spec, n)| {
            let n = match n {
                Some(v) if !v.is_finite() => {
                    quality.record(
                        Some(record.netuid),
                        spec.factor.as_str(),
                        QualityIssue::NonFiniteTransform,
                    );
                    None
                }
                other => *other,
            };
            let effective_weight = if n.is_some() { spec.weight } else { 0.0 };
            FactorContribution {
                factor: spec.factor,
                raw: record.factor(spec.factor),
                normalized: n,
                sign: spec.sign,
                weight: spec.weight,
                effective_weight,
                contribution: n.map_or(0.0, |v| spec.weight * spec.sign.value() * v),
            }
        })
        .collect();

    let defined = contributions.iter().any(|c| c.normalized.is_some());
    let score = defined.then(|| contributions.iter().map(|c| c.contribution).sum::<f64>());

    contributions.sort_by(|a, b| match (a.normalized.is_some(), b.normalized.is_some()) {
        (true, true) => b.contribution.total_cmp(&a.contribution),
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => Ordering::Equal,
    });

    (score, contributions)
}

/// Risk tier for every record of one snapshot, in record order.
pub fn evaluate_risk(
    snapshot_ts: i64,
    records: &[DerivedMetricRecord],
    definition: &RiskDefinition,
    config: &NormalizerConfig,
    quality: &mut QualityLog,
) -> Result<Vec<AlertFlag>, ScoringError> {
    definition.validate()?;
    ensure_same_snapshot(snapshot_ts, records)?;

    let columns: Vec<Vec<Option<f64>>> = definition
        .factors
        .iter()
        .map(|spec| normalize_factor(records, spec, config))
        .collect();

    let flags: Vec<AlertFlag> = records
        .iter()
        .enumerate()
        .map(|(i, record)| {
            let normalized: Vec<Option<f64>> = columns.iter().map(|c| c[i]).collect();
            let (risk_score, contributions) =
                compute_risk(record, &definition.factors, &normalized, quality);
            AlertFlag {
                netuid: record.netuid,
                snapshot_ts,
                name: definition.name.clone(),
                version: definition.version.clone(),
                tier: classify_tier(risk_score, definition),
                risk_score,
                contributions,
            }
        })
        .collect();

    info!(
        risk = %definition.name,
        version = %definition.version,
        red_flags = flags.iter().filter(|f| f.tier == AlertTier::RedFlag).count(),
        watchlist = flags.iter().filter(|f| f.tier == AlertTier::Watchlist).count(),
        "risk tiers computed"
    );
    Ok(flags)
}

/// Entities whose MAD z-score on any factor exceeds the outlier threshold in
/// absolute value. Factors with fewer than `min_sample_size` values are
/// skipped. Sorted by factor, then by |z| descending.
pub fn detect_outliers(stats: &CrossSectionalStats, config: &NormalizerConfig) -> Vec<OutlierFlag> {
    let mut outliers = Vec::new();
    for (factor, factor_stats) in &stats.factors {
        if factor_stats.count < config.min_sample_size {
            continue;
        }
        let mut flagged: Vec<OutlierFlag> = factor_stats
            .robust_zscores
            .iter()
            .filter(|(_, z)| z.abs() > config.outlier_threshold)
            .map(|(netuid, z)| OutlierFlag {
                netuid: *netuid,
                factor: *factor,
                robust_z: *z,
            })
            .collect();
        flagged.sort_by(|a, b| b.robust_z.abs().total_cmp(&a.robust_z.abs()));
        outliers.extend(flagged);
    }
    outliers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::normalizer::compute_cross_sectional_stats;
    use crate::types::{FactorKey, Normalization, Scope, Sign, Transform};

    fn spec(factor: FactorKey, weight: f64, sign: Sign) -> FactorSpec {
        FactorSpec {
            factor,
            weight,
            sign,
            transform: Transform::Identity,
            normalization: Normalization::CappedZScore,
            winsorize: false,
            scope: Scope::Population,
        }
    }

    fn risk() -> RiskDefinition {
        RiskDefinition {
            name: "emission_farming".into(),
            version: "1.0.0".into(),
            watchlist_threshold: 1.0,
            red_flag_threshold: 1.3,
            factors: vec![
                spec(FactorKey::EmissionRoi, 0.4, Sign::Positive),
                spec(FactorKey::StakeHhi, 0.4, Sign::Positive),
                spec(FactorKey::ValidatorUtilization, 0.2, Sign::Negative),
            ],
        }
    }

    fn record(netuid: u32, roi: Option<f64>, hhi: Option<f64>, util: Option<f64>) -> DerivedMetricRecord {
        let mut r = DerivedMetricRecord::new(netuid, 50, None);
        r.emission_roi = roi;
        r.stake_hhi = hhi;
        r.validator_utilization = util;
        r
    }

    fn population(extreme_roi: f64) -> Vec<DerivedMetricRecord> {
        vec![
            record(1, Some(0.01), Some(1000.0), Some(0.8)),
            record(2, Some(0.02), Some(1500.0), Some(0.7)),
            record(3, Some(0.01), Some(1200.0), Some(0.9)),
            record(4, Some(0.03), Some(2000.0), Some(0.6)),
            record(5, Some(extreme_roi), Some(9000.0), Some(0.05)),
        ]
    }

    #[test]
    fn tier_thresholds() {
        let def = risk();
        assert_eq!(classify_tier(None, &def), AlertTier::None);
        assert_eq!(classify_tier(Some(0.99), &def), AlertTier::None);
        assert_eq!(classify_tier(Some(1.0), &def), AlertTier::Watchlist);
        assert_eq!(classify_tier(Some(1.3), &def), AlertTier::RedFlag);
    }

    #[test]
    fn extractive_entity_is_red_flagged() {
        let mut quality = QualityLog::new();
        let flags = evaluate_risk(50, &population(0.5), &risk(), &NormalizerConfig::default(), &mut quality)
            .unwrap();
        assert_eq!(flags[4].tier, AlertTier::RedFlag);
        assert_eq!(flags[0].tier, AlertTier::None);
        let c = &flags[4].contributions;
        assert!(c.windows(2).all(|w| w[0].contribution >= w[1].contribution));
    }

    #[test]
    fn risk_is_monotone_in_risk_factor() {
        let def = risk();
        let config = NormalizerConfig::default();
        let mut previous = f64::MIN;
        let mut previous_tier = AlertTier::None;
        for roi in [0.0, 0.02, 0.05, 0.1, 0.5, 2.0, 50.0] {
            let mut quality = QualityLog::new();
            let flags = evaluate_risk(50, &population(roi), &def, &config, &mut quality).unwrap();
            let score = flags[4].risk_score.unwrap();
            assert!(score >= previous - 1e-12, "roi={roi}: {score} < {previous}");
            assert!(flags[4].tier >= previous_tier);
            previous = score;
            previous_tier = flags[4].tier;
        }
    }

    #[test]
    fn missing_factors_contribute_nothing() {
        let mut records = population(0.5);
        records.push(record(6, None, None, None));
        records.push(record(7, None, Some(5000.0), None));
        let mut quality = QualityLog::new();
        let flags = evaluate_risk(50, &records, &risk(), &NormalizerConfig::default(), &mut quality)
            .unwrap();

        assert_eq!(flags[5].risk_score, None);
        assert_eq!(flags[5].tier, AlertTier::None);

        let partial = &flags[6];
        assert!(partial.risk_score.is_some());
        assert_eq!(partial.contributions[0].factor, FactorKey::StakeHhi);
        assert!(partial.contributions[1..].iter().all(|c| c.normalized.is_none()));
        assert!(partial.contributions[1..].iter().all(|c| c.contribution == 0.0));
    }

    #[test]
    fn non_finite_normalized_value_is_dropped() {
        let def = risk();
        let mut quality = QualityLog::new();
        let r = record(1, Some(1.0), Some(1.0), Some(1.0));
        let (score, _) = compute_risk(
            &r,
            &def.factors,
            &[Some(f64::INFINITY), Some(1.0), None],
            &mut quality,
        );
        assert_eq!(score, Some(0.4));
        assert_eq!(quality.len(), 1);
    }

    #[test]
    fn outliers_need_minimum_sample() {
        let config = NormalizerConfig::default();
        let small = population(0.5);
        let stats = compute_cross_sectional_stats(50, &small, &config).unwrap();
        assert!(detect_outliers(&stats, &config).is_empty());

        let mut large: Vec<DerivedMetricRecord> = (1..=9)
            .map(|i| record(i, Some(0.01 + i as f64 * 0.001), None, None))
            .collect();
        large.push(record(10, Some(1.0), None, None));
        let stats = compute_cross_sectional_stats(50, &large, &config).unwrap();
        let outliers = detect_outliers(&stats, &config);
        assert_eq!(outliers.len(), 1);
        assert_eq!(outliers[0].netuid, 10);
        assert_eq!(outliers[0].factor, FactorKey::EmissionRoi);
    }
}
