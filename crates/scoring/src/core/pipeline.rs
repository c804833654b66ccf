//! One snapshot cycle: Calculator → barrier → Normalizer → Scorer → Detector.
//!
//! The per-entity calculator pass is the only cancellable stage. Once every
//! record exists (the barrier) the remaining stages run to completion over
//! the full in-memory population and the caller commits the result as one
//! unit. Entities are processed in `netuid` order so identical input always
//! yields identical output.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::calculator::{self, RecordInputs};
use super::correlation::{self, RedundantPair};
use super::detector;
use super::normalizer;
use super::scorer::{self, ScoreRegistry};
use crate::config::ScoringConfig;
use crate::errors::ScoringError;
use crate::types::{
    AlertFlag, CompositeScore, CrossSectionalStats, DataQualityEvent, DerivedMetricRecord, Entity,
    OutlierFlag, QualityLog, RawSnapshot,
};

/// Latest raw snapshots for one entity as of the cycle timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityInput {
    pub entity: Entity,
    pub market: Option<RawSnapshot>,
    pub on_chain: Option<RawSnapshot>,
}

/// Everything one cycle reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleInput {
    pub snapshot_ts: i64,
    pub entities: Vec<EntityInput>,
    /// Network-wide price feed snapshot.
    pub price: Option<RawSnapshot>,
}

/// Everything one cycle produces. Committed as a single unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleOutput {
    pub snapshot_ts: i64,
    pub records: Vec<DerivedMetricRecord>,
    pub stats: CrossSectionalStats,
    pub scores: Vec<CompositeScore>,
    pub alerts: Vec<AlertFlag>,
    pub outliers: Vec<OutlierFlag>,
    pub redundancies: Vec<RedundantPair>,
    pub quality_events: Vec<DataQualityEvent>,
}

/// Run one full cycle.
///
/// Fails fast on invalid score or risk definitions, or on one version tag
/// bound to two different definitions, before any work is done.
/// Cancellation is honoured up to the barrier and surfaces as
/// [`ScoringError::Cancelled`]; nothing has been written at that point.
pub fn run_cycle(
    input: &CycleInput,
    config: &ScoringConfig,
    cancel: &CancellationToken,
) -> Result<CycleOutput, ScoringError> {
    let mut registry = ScoreRegistry::new();
    for definition in &config.scores.definitions {
        registry.register(definition.clone())?;
    }
    config.alerts.risk.validate()?;

    let snapshot_ts = input.snapshot_ts;
    let mut quality = QualityLog::new();

    let global_price_usd = input
        .price
        .as_ref()
        .and_then(|p| calculator::global_price_usd(&p.payload, &mut quality));

    // -- Per-entity derivation --------------------------------------------
    let mut entities: Vec<&EntityInput> = input.entities.iter().collect();
    entities.sort_by_key(|e| e.entity.netuid);
    entities.dedup_by_key(|e| e.entity.netuid);

    let mut records = Vec::with_capacity(entities.len());
    for item in entities {
        if cancel.is_cancelled() {
            info!(snapshot_ts, derived = records.len(), "cycle cancelled before barrier");
            return Err(ScoringError::Cancelled { snapshot_ts });
        }
        let inputs = RecordInputs {
            netuid: item.entity.netuid,
            snapshot_ts,
            category: item.entity.category,
            on_chain: item.on_chain.as_ref().map(|s| &s.payload),
            market: item.market.as_ref().map(|s| &s.payload),
            global_price_usd,
        };
        records.push(calculator::compute_record(inputs, &config.calculator, &mut quality));
    }

    // -- Barrier: full population available from here on ------------------
    debug!(snapshot_ts, population = records.len(), "calculator barrier reached");

    let stats =
        normalizer::compute_cross_sectional_stats(snapshot_ts, &records, &config.normalizer)?;

    let mut scores = Vec::new();
    for definition in registry.iter() {
        scores.extend(scorer::score_population(
            snapshot_ts,
            &records,
            definition,
            &config.normalizer,
            &mut quality,
        )?);
    }

    let alerts = detector::evaluate_risk(
        snapshot_ts,
        &records,
        &config.alerts.risk,
        &config.normalizer,
        &mut quality,
    )?;
    let outliers = detector::detect_outliers(&stats, &config.normalizer);

    // Redundancy is judged on the headline score only.
    let redundancies = config
        .scores
        .primary_definition()
        .map(|d| correlation::redundant_pairs(&records, d, config.normalizer.redundancy_threshold))
        .unwrap_or_default();

    info!(
        snapshot_ts,
        population = records.len(),
        scores = scores.len(),
        outliers = outliers.len(),
        quality_events = quality.len(),
        "cycle computed"
    );

    Ok(CycleOutput {
        snapshot_ts,
        records,
        stats,
        scores,
        alerts,
        outliers,
        redundancies,
        quality_events: quality.into_events(),
    })
}
