//! Factor redundancy analysis.
//!
//! Two factors that move together carry the same information twice and
//! silently double their combined weight. Each cycle correlates every pair
//! of a score's factors across the snapshot and reports pairs at or above
//! the redundancy threshold.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::constants::MIN_CORRELATION_POINTS;
use crate::types::{DerivedMetricRecord, FactorKey, ScoreDefinition};

/// A pair of factors whose values are nearly collinear across entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedundantPair {
    pub a: FactorKey,
    pub b: FactorKey,
    /// Pearson correlation coefficient.
    pub r: f64,
    /// Entities with both values present.
    pub n: usize,
}

/// Pearson correlation over paired observations.
///
/// Pairs with a missing or non-finite side are dropped. `None` with fewer
/// than three pairs or zero variance on either side.
pub fn pearson(xs: &[Option<f64>], ys: &[Option<f64>]) -> Option<f64> {
    let pairs: Vec<(f64, f64)> = xs
        .iter()
        .zip(ys)
        .filter_map(|(x, y)| match (x, y) {
            (Some(x), Some(y)) if x.is_finite() && y.is_finite() => Some((*x, *y)),
            _ => None,
        })
        .collect();
    if pairs.len() < MIN_CORRELATION_POINTS {
        return None;
    }

    let n = pairs.len() as f64;
    let mean_x = pairs.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = pairs.iter().map(|p| p.1).sum::<f64>() / n;

    let (mut cov, mut var_x, mut var_y) = (0.0, 0.0, 0.0);
    for (x, y) in &pairs {
        let dx = x - mean_x;
        let dy = y - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    if var_x <= 0.0 || var_y <= 0.0 {
        return None;
    }
    Some((cov / (var_x.sqrt() * var_y.sqrt())).clamp(-1.0, 1.0))
}

/// Factor pairs of `definition` with |r| at or above `threshold`.
pub fn redundant_pairs(
    records: &[DerivedMetricRecord],
    definition: &ScoreDefinition,
    threshold: f64,
) -> Vec<RedundantPair> {
    let columns: Vec<(FactorKey, Vec<Option<f64>>)> = definition
        .factors
        .iter()
        .map(|s| (s.factor, records.iter().map(|r| r.factor(s.factor)).collect()))
        .collect();

    let mut pairs = Vec::new();
    for (i, (a, xs)) in columns.iter().enumerate() {
        for (b, ys) in &columns[i + 1..] {
            let Some(r) = pearson(xs, ys) else {
                continue;
            };
            if r.abs() >= threshold {
                let n = xs
                    .iter()
                    .zip(ys)
                    .filter(|(x, y)| x.is_some() && y.is_some())
                    .count();
                warn!(
                    score = %definition.name,
                    version = %definition.version,
                    a = a.as_str(),
                    b = b.as_str(),
                    r,
                    n,
                    "redundant factor pair"
                );
                pairs.push(RedundantPair { a: *a, b: *b, r, n });
            }
        }
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FactorSpec, Normalization, Scope, Sign, Strictness, Transform};

    fn some(values: &[f64]) -> Vec<Option<f64>> {
        values.iter().copied().map(Some).collect()
    }

    #[test]
    fn pearson_perfect_correlation() {
        let r = pearson(&some(&[1.0, 2.0, 3.0]), &some(&[2.0, 4.0, 6.0])).unwrap();
        assert!((r - 1.0).abs() < 1e-12);
        let r = pearson(&some(&[1.0, 2.0, 3.0]), &some(&[3.0, 2.0, 1.0])).unwrap();
        assert!((r + 1.0).abs() < 1e-12);
    }

    #[test]
    fn pearson_needs_three_points_and_variance() {
        assert_eq!(pearson(&some(&[1.0, 2.0]), &some(&[1.0, 2.0])), None);
        assert_eq!(pearson(&some(&[1.0, 1.0, 1.0]), &some(&[1.0, 2.0, 3.0])), None);
        assert_eq!(
            pearson(&[Some(1.0), None, Some(3.0), Some(4.0)], &some(&[1.0, 2.0, 3.0, 4.0]))
                .map(|r| r > 0.99),
            Some(true)
        );
    }

    #[test]
    fn redundant_pairs_flags_collinear_factors() {
        let records: Vec<DerivedMetricRecord> = (0..6)
            .map(|i| {
                let mut r = DerivedMetricRecord::new(i, 0, None);
                r.stake_quality = Some(10.0 * i as f64);
                r.trust_score = Some(0.1 * i as f64 + 0.05);
                r.emission_roi = Some(if i % 2 == 0 { 1.0 } else { 0.0 });
                r
            })
            .collect();
        let spec = |factor, weight| FactorSpec {
            factor,
            weight,
            sign: Sign::Positive,
            transform: Transform::Identity,
            normalization: Normalization::CappedZScore,
            winsorize: false,
            scope: Scope::Population,
        };
        let definition = ScoreDefinition {
            name: "health".into(),
            version: "1.0.0".into(),
            strictness: Strictness::Lenient,
            description: String::new(),
            factors: vec![
                spec(FactorKey::StakeQuality, 0.4),
                spec(FactorKey::TrustScore, 0.3),
                spec(FactorKey::EmissionRoi, 0.3),
            ],
        };
        let pairs = redundant_pairs(&records, &definition, 0.95);
        assert_eq!(pairs.len(), 1);
        assert_eq!((pairs[0].a, pairs[0].b), (FactorKey::StakeQuality, FactorKey::TrustScore));
        assert_eq!(pairs[0].n, 6);
    }
}
