//! Composite scorer.
//!
//! A score definition is an ordered list of weighted factors. For each
//! entity the scorer builds a per-factor breakdown, sums the signed weighted
//! contributions into a raw composite, clips it at zero and publishes its
//! percentile rank among the snapshot's scored entities (0-100).
//!
//! The percentile stage makes a published value mean the same thing on every
//! snapshot date ("better than X% of today's peers") even as the factor
//! distributions drift.

use std::collections::BTreeMap;

use tracing::{debug, info};

use super::normalizer::{ensure_same_snapshot, normalize_factor, percentile_rank};
use crate::config::NormalizerConfig;
use crate::errors::ScoringError;
use crate::types::{
    CompositeScore, DerivedMetricRecord, FactorContribution, FactorSpec, QualityIssue, QualityLog,
    ScoreDefinition, Strictness,
};

/// Score every record of one snapshot under `definition`.
///
/// Output is in record order. The definition is validated first: a bad
/// weight vector is a caller bug and fails the whole call.
pub fn score_population(
    snapshot_ts: i64,
    records: &[DerivedMetricRecord],
    definition: &ScoreDefinition,
    config: &NormalizerConfig,
    quality: &mut QualityLog,
) -> Result<Vec<CompositeScore>, ScoringError> {
    definition.validate()?;
    ensure_same_snapshot(snapshot_ts, records)?;

    let columns: Vec<Vec<Option<f64>>> = definition
        .factors
        .iter()
        .map(|spec| normalize_factor(records, spec, config))
        .collect();

    let mut scores: Vec<CompositeScore> = records
        .iter()
        .enumerate()
        .map(|(i, record)| {
            let normalized: Vec<Option<f64>> = columns.iter().map(|c| c[i]).collect();
            let (raw_composite, breakdown) = compose(
                record,
                &definition.factors,
                &normalized,
                definition.strictness,
                quality,
            );
            CompositeScore {
                netuid: record.netuid,
                snapshot_ts,
                name: definition.name.clone(),
                version: definition.version.clone(),
                value: None,
                raw_composite,
                breakdown,
            }
        })
        .collect();

    // Clip, then rank across the scored population.
    let clipped: Vec<Option<f64>> = scores
        .iter()
        .map(|s| s.raw_composite.map(|c| c.max(0.0)))
        .collect();
    for (score, pct) in scores.iter_mut().zip(percentile_rank(&clipped)) {
        score.value = pct;
    }

    info!(
        score = %definition.name,
        version = %definition.version,
        scored = scores.iter().filter(|s| s.value.is_some()).count(),
        population = records.len(),
        "composite scores computed"
    );
    Ok(scores)
}

/// Weighted composite and breakdown for one entity.
///
/// Returns `None` for the composite when strict and any factor is missing,
/// or when no weight remains after excluding missing factors.
fn compose(
    record: &DerivedMetricRecord,
    specs: &[FactorSpec],
    normalized: &[Option<f64>],
    strictness: Strictness,
    quality: &mut QualityLog,
) -> (Option<f64>, Vec<FactorContribution>) {
    let usable: Vec<Option<f64>> = specs
        .iter()
        .zip(normalized)
        .map(|(spec, n)| match n {
            Some(v) if !v.is_finite() => {
                quality.record(
                    Some(record.netuid),
                    spec.factor.as_str(),
                    QualityIssue::NonFiniteTransform,
                );
                None
            }
            other => *other,
        })
        .collect();

    let missing = usable.iter().filter(|n| n.is_none()).count();
    let present_weight: f64 = specs
        .iter()
        .zip(&usable)
        .filter(|(_, n)| n.is_some())
        .map(|(s, _)| s.weight)
        .sum();

    let complete = match strictness {
        Strictness::Strict => missing == 0,
        Strictness::Lenient => missing < specs.len(),
    };
    let defined = complete && present_weight > 0.0;

    let breakdown: Vec<FactorContribution> = specs
        .iter()
        .zip(&usable)
        .map(|(spec, n)| {
            let effective_weight = match n {
                Some(_) if defined => spec.weight / present_weight,
                _ => 0.0,
            };
            let contribution = n.map_or(0.0, |v| effective_weight * spec.sign.value() * v);
            FactorContribution {
                factor: spec.factor,
                raw: record.factor(spec.factor),
                normalized: *n,
                sign: spec.sign,
                weight: spec.weight,
                effective_weight,
                contribution,
            }
        })
        .collect();

    if !defined {
        debug!(netuid = record.netuid, missing, "composite unavailable");
        return (None, breakdown);
    }
    let composite = breakdown.iter().map(|c| c.contribution).sum();
    (Some(composite), breakdown)
}

// ═══════════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════════

/// Score definitions keyed by `(name, version)`.
///
/// A version tag is bound to exactly one definition: registering different
/// content under an existing tag fails, so consumers requesting a version
/// never receive a silently redefined score.
#[derive(Debug, Default, Clone)]
pub struct ScoreRegistry {
    definitions: BTreeMap<(String, String), ScoreDefinition>,
}

impl ScoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register. Re-registering identical content is a no-op.
    pub fn register(&mut self, definition: ScoreDefinition) -> Result<(), ScoringError> {
        definition.validate()?;
        let key = (definition.name.clone(), definition.version.clone());
        match self.definitions.get(&key) {
            Some(existing) if *existing == definition => Ok(()),
            Some(_) => Err(ScoringError::VersionConflict {
                name: key.0,
                version: key.1,
            }),
            None => {
                self.definitions.insert(key, definition);
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str, version: &str) -> Option<&ScoreDefinition> {
        self.definitions.get(&(name.to_string(), version.to_string()))
    }

    /// Registered versions of `name`, in lexical order.
    pub fn versions(&self, name: &str) -> Vec<&str> {
        self.definitions
            .keys()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScoreDefinition> {
        self.definitions.values()
    }
}
