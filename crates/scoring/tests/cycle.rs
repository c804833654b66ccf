//! End-to-end cycle tests against the shipped configuration.

use std::path::PathBuf;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use subnet_scoring::config::{self, ScoringConfig};
use subnet_scoring::core::detector::evaluate_risk;
use subnet_scoring::core::pipeline::{run_cycle, CycleInput, EntityInput};
use subnet_scoring::errors::ScoringError;
use subnet_scoring::store::SnapshotStore;
use subnet_scoring::types::{
    AlertTier, DerivedMetricRecord, Entity, QualityLog, RawSnapshot, SourceKind,
};

const TS: i64 = 1_767_225_600;

fn shipped_config() -> ScoringConfig {
    let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../config");
    config::load_config(&dir).expect("shipped config should load")
}

fn on_chain(netuid: u32, payload: serde_json::Value) -> EntityInput {
    EntityInput {
        entity: Entity {
            netuid,
            name: format!("SN{netuid}"),
            category: None,
        },
        market: None,
        on_chain: Some(RawSnapshot {
            netuid: Some(netuid),
            source: SourceKind::OnChain,
            payload,
            fetched_at: TS - 60,
        }),
    }
}

/// A: two equal stakes, B: four equal stakes, C: a single staker.
fn stake_only_input() -> CycleInput {
    CycleInput {
        snapshot_ts: TS,
        entities: vec![
            on_chain(1, json!({ "stakes": [100.0, 100.0] })),
            on_chain(2, json!({ "stakes": [50.0, 50.0, 50.0, 50.0] })),
            on_chain(3, json!({ "stakes": [200.0] })),
        ],
        price: None,
    }
}

fn health_value(output: &subnet_scoring::core::pipeline::CycleOutput, netuid: u32) -> Option<f64> {
    output
        .scores
        .iter()
        .find(|s| s.netuid == netuid && s.name == "health")
        .and_then(|s| s.value)
}

#[test]
fn stake_only_population_ranks_by_decentralization() {
    let config = shipped_config();
    let output = run_cycle(&stake_only_input(), &config, &CancellationToken::new()).unwrap();

    let quality: Vec<Option<f64>> = output.records.iter().map(|r| r.stake_quality).collect();
    assert_eq!(quality, vec![Some(50.0), Some(75.0), Some(0.0)]);

    let a = health_value(&output, 1).unwrap();
    let b = health_value(&output, 2).unwrap();
    let c = health_value(&output, 3).unwrap();
    assert!(b > a && a > c, "expected B > A > C, got {b} {a} {c}");
    assert_eq!((a, b, c), (50.0, 100.0, 0.0));

    // Strict investability needs market data that is absent here.
    assert!(output
        .scores
        .iter()
        .filter(|s| s.name == "investability")
        .all(|s| s.value.is_none()));
}

#[test]
fn identical_input_gives_identical_output() {
    let config = shipped_config();
    let first = run_cycle(&stake_only_input(), &config, &CancellationToken::new()).unwrap();
    let second = run_cycle(&stake_only_input(), &config, &CancellationToken::new()).unwrap();
    assert_eq!(first, second);

    let mut shuffled = stake_only_input();
    shuffled.entities.reverse();
    let third = run_cycle(&shuffled, &config, &CancellationToken::new()).unwrap();
    assert_eq!(first, third);
}

#[test]
fn scores_stay_within_bounds() {
    let config = shipped_config();
    let mut input = stake_only_input();
    for netuid in 4..20u32 {
        let stakes: Vec<f64> = (0..netuid).map(|i| f64::from(i * i + 1)).collect();
        input.entities.push(on_chain(
            netuid,
            json!({
                "stakes": stakes,
                "trust": vec![0.5; netuid as usize],
                "consensus": vec![0.2; netuid as usize],
                "validator_permit": vec![true; netuid as usize],
                "emission_per_block_rao": 1_000_000_000u64 * u64::from(netuid),
            }),
        ));
    }
    let output = run_cycle(&input, &config, &CancellationToken::new()).unwrap();

    for score in &output.scores {
        if let Some(v) = score.value {
            assert!((0.0..=100.0).contains(&v), "{} out of bounds: {v}", score.netuid);
        }
    }
    for record in &output.records {
        if let Some(q) = record.stake_quality {
            assert!((0.0..=100.0).contains(&q));
        }
        if let Some(u) = record.validator_utilization {
            assert!((0.0..=1.0).contains(&u));
        }
    }
    assert_eq!(output.alerts.len(), output.records.len());
}

fn risk_population(extreme_roi: f64) -> Vec<DerivedMetricRecord> {
    (0..10u32)
        .map(|i| {
            let mut r = DerivedMetricRecord::new(i, TS, None);
            r.emission_roi = Some(if i == 0 { extreme_roi } else { 0.01 + 0.001 * f64::from(i) });
            r.stake_hhi = Some(if i == 0 { 9000.0 } else { 1000.0 + 50.0 * f64::from(i) });
            r.validator_utilization = Some(if i == 0 { 0.05 } else { 0.6 });
            r.flow_turnover = Some(0.02 * f64::from(i));
            r.price_30d_change = Some(if i == 0 { -40.0 } else { 2.0 });
            r
        })
        .collect()
}

#[test]
fn raising_a_risk_factor_never_lowers_the_tier() {
    let config = shipped_config();
    let risk = &config.alerts.risk;

    let mut previous: Option<(f64, AlertTier)> = None;
    for roi in [0.02, 0.05, 0.2, 1.0, 5.0] {
        let records = risk_population(roi);
        let mut quality = QualityLog::new();
        let flags = evaluate_risk(TS, &records, risk, &config.normalizer, &mut quality).unwrap();
        let score = flags[0].risk_score.unwrap();
        let tier = flags[0].tier;
        if let Some((prev_score, prev_tier)) = previous {
            assert!(score >= prev_score - 1e-12, "risk fell from {prev_score} to {score}");
            assert!(tier >= prev_tier, "tier fell from {prev_tier:?} to {tier:?}");
        }
        previous = Some((score, tier));
    }
    assert_eq!(previous.map(|p| p.1), Some(AlertTier::RedFlag));
}

/// Stake quality and trust move in lockstep: `n` equal holders give quality
/// `100 - 100/n` and every participant trusts at `1 - 1/n`.
fn collinear_health_input() -> CycleInput {
    CycleInput {
        snapshot_ts: TS,
        entities: (2..=6u32)
            .map(|n| {
                let t = 1.0 - 1.0 / f64::from(n);
                on_chain(n, json!({ "stakes": vec![10.0; n as usize], "trust": vec![t; n as usize] }))
            })
            .collect(),
        price: None,
    }
}

#[test]
fn redundancy_is_reported_for_the_primary_score_only() {
    let mut config = shipped_config();
    let output = run_cycle(&collinear_health_input(), &config, &CancellationToken::new()).unwrap();
    assert_eq!(output.redundancies.len(), 1);
    let pair = &output.redundancies[0];
    assert_eq!(
        (pair.a.as_str(), pair.b.as_str()),
        ("stake_quality", "trust_score")
    );

    config.scores.primary = "investability".into();
    let output = run_cycle(&collinear_health_input(), &config, &CancellationToken::new()).unwrap();
    assert!(output.redundancies.is_empty());
}

#[test]
fn cancelled_cycle_produces_nothing() {
    let config = shipped_config();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = run_cycle(&stake_only_input(), &config, &cancel).unwrap_err();
    assert!(matches!(err, ScoringError::Cancelled { snapshot_ts: TS }));
}

#[tokio::test]
async fn stored_cycle_rerun_is_idempotent() {
    let config = shipped_config();
    let store = SnapshotStore::in_memory().await.unwrap();

    for item in stake_only_input().entities {
        if let Some(snapshot) = &item.on_chain {
            store.append_snapshot(snapshot).await.unwrap();
        }
    }

    let input = store
        .load_cycle_input(TS, config.app.cycle.input_window_seconds)
        .await
        .unwrap();
    assert_eq!(input.entities.len(), 3);

    let cancel = CancellationToken::new();
    let output = run_cycle(&input, &config, &cancel).unwrap();
    store
        .commit_cycle(&output, &config.scores.definitions, &config.alerts.risk)
        .await
        .unwrap();
    let first = store.scores_at(TS, "health", "1.0.0").await.unwrap();

    let output = run_cycle(&input, &config, &cancel).unwrap();
    store
        .commit_cycle(&output, &config.scores.definitions, &config.alerts.risk)
        .await
        .unwrap();
    let second = store.scores_at(TS, "health", "1.0.0").await.unwrap();

    assert_eq!(first.len(), 3);
    assert_eq!(first, second);
    assert_eq!(store.latest_snapshot_ts().await.unwrap(), Some(TS));
    assert_eq!(store.records_at(TS).await.unwrap().len(), 3);
    assert_eq!(store.alerts_at(TS).await.unwrap().len(), 3);
}
