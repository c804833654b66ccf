//! On-chain metrics calculator.
//!
//! Pure per-entity derivation: takes one entity's raw on-chain and market
//! payloads and produces a [`DerivedMetricRecord`]. No I/O and no shared
//! state, so entities can be processed independently of each other.
//!
//! Every operation is total over its documented domain. Inputs outside the
//! domain (empty arrays, zero totals, negative stake, NaN) yield `None`
//! rather than a misleading zero. When deriving a full record, invalid
//! inputs are additionally recorded as data-quality events.
//!
//! Units: stake, market cap and flows are in the native unit (TAO).
//! On-chain emission and reserve amounts arrive in RAO and are converted
//! exactly with `Decimal` before entering the `f64` statistics domain.

use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::{debug, warn};

use super::normalizer::quantile;
use crate::config::{CalculatorConfig, StakeQualityMapping};
use crate::constants::{HHI_MAX, RAO_PER_TAO};
use crate::errors::ScoringError;
use crate::types::{
    Category, ClampEvent, DerivedMetricRecord, EmissionSplit, FactorKey, Payload, QualityIssue,
    QualityLog,
};

// -- On-chain payload keys ---------------------------------------------------

const STAKES: &[&str] = &["stakes", "stake"];
const CONSENSUS: &[&str] = &["consensus"];
const TRUST: &[&str] = &["trust"];
const INCENTIVE: &[&str] = &["incentive", "incentives"];
const VALIDATOR_PERMIT: &[&str] = &["validator_permit", "validator_permits"];
const MAX_VALIDATORS: &[&str] = &["max_validators", "max_allowed_validators"];
const EMISSION_WINDOW: &[&str] = &["emission_window"];
const OWNER_EMISSION: &[&str] = &["owner_emission_rao"];
const MINER_EMISSION: &[&str] = &["miner_emission_rao"];
const VALIDATOR_EMISSION: &[&str] = &["validator_emission_rao"];
const WINDOW_OWNER: &[&str] = &["owner", "owner_rao"];
const WINDOW_MINER: &[&str] = &["miner", "miners", "miner_rao"];
const WINDOW_VALIDATOR: &[&str] = &["validator", "validators", "validator_rao"];
const EMISSION_PER_BLOCK: &[&str] = &["emission_per_block_rao", "tao_emission_per_block_rao"];
const TAO_IN: &[&str] = &["tao_in_rao"];
const TAO_IN_PREV: &[&str] = &["tao_in_prev_rao", "tao_in_yesterday_rao"];
const ONCHAIN_MARKET_CAP: &[&str] = &["market_cap_tao"];

// -- Market payload keys -----------------------------------------------------

const MARKET_CAP: &[&str] = &["market_cap", "marketcap"];
const MARKET_TOTAL_STAKE: &[&str] = &["total_stake"];
const PRICE_1D: &[&str] = &["price_1d_change", "price_change_1_day"];
const PRICE_7D: &[&str] = &["price_7d_change", "price_change_1_week"];
const PRICE_30D: &[&str] = &["price_30d_change", "price_change_1_month"];
const PRICE_HISTORY: &[&str] = &["price_history"];
const BUY_VOLUME: &[&str] = &["buy_volume_tao_1d", "buy_vol_tao_1d"];
const SELL_VOLUME: &[&str] = &["sell_volume_tao_1d", "sell_vol_tao_1d"];
const TOTAL_VOLUME: &[&str] = &["total_volume_tao_1d", "tao_volume_24_hr"];
const NET_FLOW: &[&str] = &["net_volume_tao_24h", "net_flow_24h", "flow_24h"];

// -- Price feed keys ---------------------------------------------------------

const GLOBAL_PRICE_USD: &[&str] = &["price_usd", "usd"];

/// Relative gap between two sources above which the disagreement is logged.
const SOURCE_DISAGREEMENT: f64 = 0.01;

// ═══════════════════════════════════════════════════════════════════════════
// Stake
// ═══════════════════════════════════════════════════════════════════════════

/// Herfindahl-Hirschman index of stake shares and the derived stake quality.
///
/// HHI is the sum of squared percentage shares, in `[0, 10000]` up to float
/// rounding; [`compute_record`] clamps and records any residue. Quality is
/// the linear `max(0, 100 - hhi / 100)`. Returns `(None, None)` for an empty
/// list, zero total stake, or any negative or non-finite entry.
pub fn compute_stake_concentration(stakes: &[f64]) -> (Option<f64>, Option<f64>) {
    compute_stake_concentration_with(stakes, StakeQualityMapping::Linear)
}

/// [`compute_stake_concentration`] with a configurable HHI-to-quality mapping.
pub fn compute_stake_concentration_with(
    stakes: &[f64],
    mapping: StakeQualityMapping,
) -> (Option<f64>, Option<f64>) {
    if stakes.is_empty() || stakes.iter().any(|s| !s.is_finite() || *s < 0.0) {
        return (None, None);
    }
    let total: f64 = stakes.iter().sum();
    if total <= 0.0 {
        return (None, None);
    }

    let hhi: f64 = stakes
        .iter()
        .map(|s| {
            let share = s / total * 100.0;
            share * share
        })
        .sum();

    (Some(hhi), Some(stake_quality(hhi, mapping)))
}

/// Map an HHI in `[0, 10000]` to a quality score in `[0, 100]`.
pub fn stake_quality(hhi: f64, mapping: StakeQualityMapping) -> f64 {
    match mapping {
        StakeQualityMapping::Linear => (100.0 - hhi / 100.0).max(0.0),
        StakeQualityMapping::Power { exponent } => {
            let evenness = (1.0 - hhi / HHI_MAX).clamp(0.0, 1.0);
            100.0 * evenness.powf(exponent)
        }
    }
}

/// Fraction of total stake held by permitted validators, in `[0, 1]`.
pub fn compute_active_stake_ratio(
    stakes: &[f64],
    permits: &[bool],
) -> Result<Option<f64>, ScoringError> {
    if stakes.len() != permits.len() {
        return Err(ScoringError::LengthMismatch {
            left_name: "stakes",
            left: stakes.len(),
            right_name: "validator_permit",
            right: permits.len(),
        });
    }
    if stakes.iter().any(|s| !s.is_finite() || *s < 0.0) {
        return Ok(None);
    }
    let total: f64 = stakes.iter().sum();
    if total <= 0.0 {
        return Ok(None);
    }
    let active: f64 = stakes
        .iter()
        .zip(permits)
        .filter(|(_, permitted)| **permitted)
        .map(|(s, _)| s)
        .sum();
    Ok(Some(active / total))
}

/// Active validators over capacity. `None` when capacity is zero.
///
/// Values above 1 (capacity under-reported upstream) are returned unclamped;
/// the caller clamps and records it.
pub fn compute_validator_utilization(active: u32, capacity: u32) -> Option<f64> {
    if capacity == 0 {
        return None;
    }
    Some(f64::from(active) / f64::from(capacity))
}

// ═══════════════════════════════════════════════════════════════════════════
// Consensus and trust
// ═══════════════════════════════════════════════════════════════════════════

/// Percentage (0-100) of consensus scores within `±tolerance` of their mean.
///
/// Undefined (`None`) for fewer than two scores or any non-finite score.
pub fn compute_consensus_alignment(consensus_scores: &[f64], tolerance: f64) -> Option<f64> {
    if consensus_scores.len() < 2 || consensus_scores.iter().any(|c| !c.is_finite()) {
        return None;
    }
    let n = consensus_scores.len() as f64;
    let mean = consensus_scores.iter().sum::<f64>() / n;
    let aligned = consensus_scores
        .iter()
        .filter(|c| (**c - mean).abs() <= tolerance)
        .count();
    Some(aligned as f64 / n * 100.0)
}

/// Mean trust, optionally weighted by stake.
///
/// Weights are normalized to sum to one. Returns `Ok(None)` for empty input,
/// non-finite trust, negative or non-finite weights, or zero total weight.
/// Mismatched lengths are a caller bug and fail with
/// [`ScoringError::LengthMismatch`].
pub fn compute_trust_score(
    trust_values: &[f64],
    stake_weights: Option<&[f64]>,
) -> Result<Option<f64>, ScoringError> {
    if trust_values.is_empty() || trust_values.iter().any(|t| !t.is_finite()) {
        return Ok(None);
    }

    let Some(weights) = stake_weights else {
        let mean = trust_values.iter().sum::<f64>() / trust_values.len() as f64;
        return Ok(Some(mean));
    };

    if weights.len() != trust_values.len() {
        return Err(ScoringError::LengthMismatch {
            left_name: "trust",
            left: trust_values.len(),
            right_name: "stake_weights",
            right: weights.len(),
        });
    }
    if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
        return Ok(None);
    }
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return Ok(None);
    }
    let weighted = trust_values
        .iter()
        .zip(weights)
        .map(|(t, w)| t * (w / total))
        .sum();
    Ok(Some(weighted))
}

/// Mean and 95th-percentile incentive. `(None, None)` for an empty list.
pub fn compute_incentive_stats(incentives: &[f64]) -> (Option<f64>, Option<f64>) {
    if incentives.is_empty() {
        return (None, None);
    }
    let mean = incentives.iter().sum::<f64>() / incentives.len() as f64;
    let mut sorted = incentives.to_vec();
    sorted.sort_by(f64::total_cmp);
    (Some(mean), quantile(&sorted, 0.95))
}

// ═══════════════════════════════════════════════════════════════════════════
// Emission
// ═══════════════════════════════════════════════════════════════════════════

/// Owner / miner / validator proportions of a total.
///
/// `None` when the sum is zero or any input is negative or non-finite, so a
/// zero-sum split is never reported.
pub fn compute_emission_split(
    owner_emission: f64,
    miner_emission: f64,
    validator_emission: f64,
) -> Option<(f64, f64, f64)> {
    let parts = [owner_emission, miner_emission, validator_emission];
    if parts.iter().any(|p| !p.is_finite() || *p < 0.0) {
        return None;
    }
    let sum: f64 = parts.iter().sum();
    if sum <= 0.0 {
        return None;
    }
    Some((owner_emission / sum, miner_emission / sum, validator_emission / sum))
}

/// Emission split averaged over the trailing `window_blocks` blocks.
///
/// Each block is an `(owner, miner, validator)` triple. Proportions are taken
/// from the window totals so that blocks with larger emission weigh more.
pub fn compute_rolling_emission_split(
    blocks: &[(f64, f64, f64)],
    window_blocks: u32,
) -> Option<EmissionSplit> {
    let take = (window_blocks as usize).min(blocks.len());
    if take == 0 {
        return None;
    }
    let window = &blocks[blocks.len() - take..];
    let (owner, miners, validators) = window.iter().fold((0.0, 0.0, 0.0), |acc, b| {
        (acc.0 + b.0, acc.1 + b.1, acc.2 + b.2)
    });
    compute_emission_split(owner, miners, validators).map(|(o, m, v)| EmissionSplit {
        owner: o,
        miners: m,
        validators: v,
        window_blocks: take as u32,
    })
}

/// Daily emission estimated as `per_block * blocks_per_day`.
///
/// This is an estimate: the true daily figure requires summing the actual
/// blocks of the day.
pub fn estimate_daily_emission(per_block_emission: f64, blocks_per_day: u64) -> f64 {
    per_block_emission * blocks_per_day as f64
}

/// `daily_emission / total_stake`, or `None` when stake is not positive.
pub fn compute_emission_roi(daily_emission: f64, total_stake: f64) -> Option<f64> {
    if !daily_emission.is_finite() || !total_stake.is_finite() || total_stake <= 0.0 {
        return None;
    }
    Some(daily_emission / total_stake)
}

/// Convert an exact RAO amount to TAO.
pub fn rao_to_tao(rao: Decimal) -> Option<f64> {
    (rao / RAO_PER_TAO).to_f64()
}

// ═══════════════════════════════════════════════════════════════════════════
// Market
// ═══════════════════════════════════════════════════════════════════════════

/// Signed percentage change over the last `days` entries of a daily price
/// history (oldest first). `None` if the history is too short or the base
/// price is not positive.
pub fn price_change_from_history(history: &[f64], days: usize) -> Option<f64> {
    if days == 0 || history.len() <= days {
        return None;
    }
    let last = *history.last()?;
    let base = history[history.len() - 1 - days];
    if !base.is_finite() || !last.is_finite() || base <= 0.0 {
        return None;
    }
    Some((last / base - 1.0) * 100.0)
}

/// Net 24h flow relative to market cap (signed).
pub fn compute_flow_turnover(flow_24h: f64, market_cap: f64) -> Option<f64> {
    if market_cap > 0.0 && flow_24h.is_finite() {
        Some(flow_24h / market_cap)
    } else {
        None
    }
}

/// Day-over-day change of the pool reserve relative to market cap.
pub fn compute_reserve_momentum(tao_in: f64, tao_in_prev: f64, market_cap: f64) -> Option<f64> {
    if market_cap > 0.0 && tao_in.is_finite() && tao_in_prev.is_finite() {
        Some((tao_in - tao_in_prev) / market_cap)
    } else {
        None
    }
}

/// `buy / max(1, sell)`. Negative volumes are undefined.
pub fn compute_buy_sell_ratio(buy_volume: f64, sell_volume: f64) -> Option<f64> {
    if buy_volume < 0.0 || sell_volume < 0.0 || !buy_volume.is_finite() || !sell_volume.is_finite() {
        return None;
    }
    Some(buy_volume / sell_volume.max(1.0))
}

/// Network-wide native-unit USD price from the price feed. Must be positive.
pub fn global_price_usd(payload: &Value, quality: &mut QualityLog) -> Option<f64> {
    let price = Payload::new(None, payload).number(GLOBAL_PRICE_USD, quality)?;
    if price > 0.0 {
        Some(price)
    } else {
        quality.record(None, "price_usd", QualityIssue::OutOfRange);
        None
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Record derivation
// ═══════════════════════════════════════════════════════════════════════════

/// Everything the calculator sees for one entity.
#[derive(Debug, Clone, Copy)]
pub struct RecordInputs<'a> {
    pub netuid: u32,
    pub snapshot_ts: i64,
    pub category: Option<Category>,
    pub on_chain: Option<&'a Value>,
    pub market: Option<&'a Value>,
    pub global_price_usd: Option<f64>,
}

/// Derive the full metric record for one entity.
///
/// Any field that cannot be derived stays `None`. Invalid inputs are logged
/// to `quality` and treated as missing; they never affect other entities.
pub fn compute_record(
    inputs: RecordInputs<'_>,
    config: &CalculatorConfig,
    quality: &mut QualityLog,
) -> DerivedMetricRecord {
    let netuid = inputs.netuid;
    let mut record = DerivedMetricRecord::new(netuid, inputs.snapshot_ts, inputs.category);

    let null = Value::Null;
    let chain = Payload::new(Some(netuid), inputs.on_chain.unwrap_or(&null));
    let market = Payload::new(Some(netuid), inputs.market.unwrap_or(&null));

    // -- Stake ------------------------------------------------------------
    let stakes = chain
        .numbers(STAKES, quality)
        .and_then(|s| validated_non_negative(netuid, "stakes", s, quality));

    if let Some(stakes) = &stakes {
        let (hhi, q) = compute_stake_concentration_with(stakes, config.stake_quality_mapping);
        record.stake_hhi =
            hhi.map(|h| clamp_recorded(&mut record.clamps, netuid, FactorKey::StakeHhi, h));
        record.stake_quality = q;
    }

    let chain_stake = stakes.as_ref().map(|s| s.iter().sum::<f64>());
    let market_stake = market
        .number(MARKET_TOTAL_STAKE, quality)
        .and_then(|v| non_negative(netuid, "total_stake", v, quality));
    record.stake_total = canonical(netuid, "stake_total", chain_stake, market_stake);

    let permits = chain.flags(VALIDATOR_PERMIT, quality);
    if let Some(permits) = &permits {
        let active = permits.iter().filter(|p| **p).count() as u32;
        record.active_validator_count = Some(active);

        let capacity = chain
            .number(MAX_VALIDATORS, quality)
            .filter(|c| *c >= 1.0)
            .map(|c| c as u32)
            .unwrap_or(config.default_validator_capacity);
        record.validator_utilization = compute_validator_utilization(active, capacity)
            .map(|u| clamp_recorded(&mut record.clamps, netuid, FactorKey::ValidatorUtilization, u));
    }

    if let (Some(stakes), Some(permits)) = (&stakes, &permits) {
        match compute_active_stake_ratio(stakes, permits) {
            Ok(ratio) => record.active_stake_ratio = ratio,
            Err(_) => quality.record(Some(netuid), "validator_permit", QualityIssue::LengthMismatch),
        }
    }

    // -- Consensus and trust ----------------------------------------------
    if let Some(consensus) = chain.numbers(CONSENSUS, quality) {
        let consensus = finite_only(netuid, "consensus", consensus, quality);
        record.consensus_alignment =
            compute_consensus_alignment(&consensus, config.consensus_tolerance);
    }

    if let Some(trust) = chain.numbers(TRUST, quality) {
        record.trust_score = derive_trust(netuid, &trust, stakes.as_deref(), quality)
            .map(|t| clamp_recorded(&mut record.clamps, netuid, FactorKey::TrustScore, t));
    }

    if let Some(incentives) = chain.numbers(INCENTIVE, quality) {
        let incentives = finite_only(netuid, "incentive", incentives, quality);
        let (mean, p95) = compute_incentive_stats(&incentives);
        record.mean_incentive = mean;
        record.p95_incentive = p95;
    }

    // -- Emission ---------------------------------------------------------
    let blocks = emission_blocks(netuid, &chain, quality);
    record.emission_split = match &blocks {
        Some(blocks) => compute_rolling_emission_split(blocks, config.emission_window_blocks),
        None => single_block_split(netuid, &chain, quality),
    };

    let per_block = tao_amount(netuid, "emission_per_block_rao", &chain, EMISSION_PER_BLOCK, quality)
        .or_else(|| {
            let blocks = blocks.as_ref().filter(|b| !b.is_empty())?;
            let take = (config.emission_window_blocks as usize).clamp(1, blocks.len());
            let window = &blocks[blocks.len() - take..];
            let total: f64 = window.iter().map(|b| b.0 + b.1 + b.2).sum();
            Some(total / take as f64)
        })
        .or_else(|| {
            let o = tao_amount(netuid, "owner_emission_rao", &chain, OWNER_EMISSION, quality)?;
            let m = tao_amount(netuid, "miner_emission_rao", &chain, MINER_EMISSION, quality)?;
            let v = tao_amount(netuid, "validator_emission_rao", &chain, VALIDATOR_EMISSION, quality)?;
            Some(o + m + v)
        });

    if let Some(per_block) = per_block {
        let daily = estimate_daily_emission(per_block, config.blocks_per_day);
        record.emission_daily_estimate = Some(daily);
        record.emission_roi = record
            .stake_total
            .and_then(|stake| compute_emission_roi(daily, stake));
    }

    // -- Market -----------------------------------------------------------
    let chain_mcap = chain
        .number(ONCHAIN_MARKET_CAP, quality)
        .and_then(|v| non_negative(netuid, "market_cap_tao", v, quality));
    let market_mcap = market
        .number(MARKET_CAP, quality)
        .and_then(|v| non_negative(netuid, "market_cap", v, quality));
    record.market_cap = canonical(netuid, "market_cap", chain_mcap, market_mcap);
    record.market_cap_usd = record
        .market_cap
        .zip(inputs.global_price_usd)
        .map(|(mcap, usd)| mcap * usd);

    // Entries stay in place: one position per day.
    let history = market.numbers(PRICE_HISTORY, quality).unwrap_or_default();
    if history.iter().any(|p| !p.is_finite()) {
        quality.record(Some(netuid), "price_history", QualityIssue::NonFinite);
    }
    let history = history.as_slice();
    record.price_1d_change = market
        .number(PRICE_1D, quality)
        .or_else(|| price_change_from_history(history, 1));
    record.price_7d_change = market
        .number(PRICE_7D, quality)
        .or_else(|| price_change_from_history(history, 7));
    record.price_30d_change = market
        .number(PRICE_30D, quality)
        .or_else(|| price_change_from_history(history, 30));

    record.total_volume_1d = market
        .number(TOTAL_VOLUME, quality)
        .and_then(|v| non_negative(netuid, "total_volume_1d", v, quality));
    record.flow_24h = market.number(NET_FLOW, quality);

    let buy = market
        .number(BUY_VOLUME, quality)
        .and_then(|v| non_negative(netuid, "buy_volume_tao_1d", v, quality));
    let sell = market
        .number(SELL_VOLUME, quality)
        .and_then(|v| non_negative(netuid, "sell_volume_tao_1d", v, quality));
    record.buy_sell_ratio = buy.zip(sell).and_then(|(b, s)| compute_buy_sell_ratio(b, s));

    if let Some(mcap) = record.market_cap {
        record.flow_turnover = record
            .flow_24h
            .and_then(|flow| compute_flow_turnover(flow, mcap));

        let tao_in = tao_amount(netuid, "tao_in_rao", &chain, TAO_IN, quality);
        let tao_in_prev = tao_amount(netuid, "tao_in_prev_rao", &chain, TAO_IN_PREV, quality);
        record.reserve_momentum = tao_in
            .zip(tao_in_prev)
            .and_then(|(now, prev)| compute_reserve_momentum(now, prev, mcap));
    }

    debug!(
        netuid,
        stake_hhi = ?record.stake_hhi,
        consensus_alignment = ?record.consensus_alignment,
        emission_roi = ?record.emission_roi,
        clamps = record.clamps.len(),
        "derived metrics computed"
    );
    record
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Whole-array validation for fields where one bad entry poisons the
/// metric (stake shares are meaningless over a partial holder list).
fn validated_non_negative(
    netuid: u32,
    field: &str,
    values: Vec<f64>,
    quality: &mut QualityLog,
) -> Option<Vec<f64>> {
    if values.iter().any(|v| !v.is_finite()) {
        quality.record(Some(netuid), field, QualityIssue::NonFinite);
        return None;
    }
    if values.iter().any(|v| *v < 0.0) {
        quality.record(Some(netuid), field, QualityIssue::Negative);
        return None;
    }
    Some(values)
}

/// Drop non-finite entries, recording one event per field.
fn finite_only(netuid: u32, field: &str, values: Vec<f64>, quality: &mut QualityLog) -> Vec<f64> {
    let before = values.len();
    let kept: Vec<f64> = values.into_iter().filter(|v| v.is_finite()).collect();
    if kept.len() != before {
        quality.record(Some(netuid), field, QualityIssue::NonFinite);
    }
    kept
}

fn non_negative(netuid: u32, field: &str, value: f64, quality: &mut QualityLog) -> Option<f64> {
    if value < 0.0 {
        quality.record(Some(netuid), field, QualityIssue::Negative);
        None
    } else {
        Some(value)
    }
}

/// Stake-weighted trust when stake aligns with the trust array, otherwise
/// the plain mean.
fn derive_trust(
    netuid: u32,
    trust: &[f64],
    stakes: Option<&[f64]>,
    quality: &mut QualityLog,
) -> Option<f64> {
    let weights = match stakes {
        Some(s) if s.len() == trust.len() => Some(s),
        Some(_) => {
            quality.record(Some(netuid), "trust", QualityIssue::LengthMismatch);
            None
        }
        None => None,
    };

    let (values, weights): (Vec<f64>, Option<Vec<f64>>) = match weights {
        Some(w) => {
            let pairs: Vec<(f64, f64)> = trust
                .iter()
                .zip(w)
                .filter(|(t, _)| t.is_finite())
                .map(|(t, w)| (*t, *w))
                .collect();
            let (t, w): (Vec<f64>, Vec<f64>) = pairs.into_iter().unzip();
            (t, Some(w))
        }
        None => (trust.iter().copied().filter(|t| t.is_finite()).collect(), None),
    };
    if values.len() != trust.len() {
        quality.record(Some(netuid), "trust", QualityIssue::NonFinite);
    }

    // Lengths are aligned above, so the error arm is unreachable.
    compute_trust_score(&values, weights.as_deref()).unwrap_or(None)
}

/// Clamp `value` into the factor's documented range, recording the clamp.
fn clamp_recorded(clamps: &mut Vec<ClampEvent>, netuid: u32, field: FactorKey, value: f64) -> f64 {
    let Some((lo, hi)) = field.range() else {
        return value;
    };
    let clamped = value.clamp(lo, hi);
    if clamped != value {
        warn!(netuid, field = field.as_str(), raw = value, clamped, "value clamped into range");
        clamps.push(ClampEvent {
            field,
            raw: value,
            clamped,
        });
    }
    clamped
}

/// On-chain source wins over the market screener for duplicated fields.
fn canonical(netuid: u32, field: &str, on_chain: Option<f64>, market: Option<f64>) -> Option<f64> {
    if let (Some(a), Some(b)) = (on_chain, market) {
        let scale = a.abs().max(b.abs());
        if scale > 0.0 && (a - b).abs() / scale > SOURCE_DISAGREEMENT {
            debug!(netuid, field, on_chain = a, market = b, "sources disagree, using on-chain");
        }
    }
    on_chain.or(market)
}

/// RAO amount under `keys`, converted to TAO. Negative amounts are invalid.
fn tao_amount(
    netuid: u32,
    field: &str,
    payload: &Payload<'_>,
    keys: &[&'static str],
    quality: &mut QualityLog,
) -> Option<f64> {
    let rao = payload.decimal(keys, quality)?;
    if rao.is_sign_negative() && !rao.is_zero() {
        quality.record(Some(netuid), field, QualityIssue::Negative);
        return None;
    }
    rao_to_tao(rao)
}

/// Per-block `(owner, miner, validator)` emission from the rolling window.
/// Blocks with a missing or negative component are skipped.
fn emission_blocks(
    netuid: u32,
    chain: &Payload<'_>,
    quality: &mut QualityLog,
) -> Option<Vec<(f64, f64, f64)>> {
    let entries = chain.objects(EMISSION_WINDOW, quality)?;
    let mut blocks = Vec::with_capacity(entries.len());
    for entry in &entries {
        let owner = tao_amount(netuid, "emission_window.owner", entry, WINDOW_OWNER, quality);
        let miner = tao_amount(netuid, "emission_window.miner", entry, WINDOW_MINER, quality);
        let validator =
            tao_amount(netuid, "emission_window.validator", entry, WINDOW_VALIDATOR, quality);
        if let (Some(o), Some(m), Some(v)) = (owner, miner, validator) {
            blocks.push((o, m, v));
        }
    }
    if blocks.is_empty() {
        None
    } else {
        Some(blocks)
    }
}

fn single_block_split(
    netuid: u32,
    chain: &Payload<'_>,
    quality: &mut QualityLog,
) -> Option<EmissionSplit> {
    let owner = tao_amount(netuid, "owner_emission_rao", chain, OWNER_EMISSION, quality)?;
    let miner = tao_amount(netuid, "miner_emission_rao", chain, MINER_EMISSION, quality)?;
    let validator = tao_amount(netuid, "validator_emission_rao", chain, VALIDATOR_EMISSION, quality)?;
    compute_emission_split(owner, miner, validator).map(|(o, m, v)| EmissionSplit {
        owner: o,
        miners: m,
        validators: v,
        window_blocks: 1,
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn inputs<'a>(on_chain: Option<&'a Value>, market: Option<&'a Value>) -> RecordInputs<'a> {
        RecordInputs {
            netuid: 1,
            snapshot_ts: 1_700_000_000,
            category: None,
            on_chain,
            market,
            global_price_usd: None,
        }
    }

    // -- stake concentration ----------------------------------------------

    #[test]
    fn hhi_single_holder_is_max() {
        let (hhi, q) = compute_stake_concentration(&[200.0]);
        assert_eq!(hhi, Some(10_000.0));
        assert_eq!(q, Some(0.0));
    }

    #[test]
    fn hhi_equal_holders() {
        for n in [2usize, 4, 10, 100] {
            let stakes = vec![50.0; n];
            let (hhi, q) = compute_stake_concentration(&stakes);
            assert!(approx(hhi.unwrap(), 10_000.0 / n as f64), "n={n}");
            assert!(approx(q.unwrap(), 100.0 - 100.0 / n as f64), "n={n}");
        }
    }

    #[test]
    fn hhi_quality_grows_with_holders() {
        let q4 = compute_stake_concentration(&[1.0; 4]).1.unwrap();
        let q64 = compute_stake_concentration(&[1.0; 64]).1.unwrap();
        assert!(q64 > q4);
        assert!(q64 > 98.0);
    }

    #[test]
    fn hhi_zero_or_empty_is_none() {
        assert_eq!(compute_stake_concentration(&[]), (None, None));
        assert_eq!(compute_stake_concentration(&[0.0, 0.0]), (None, None));
    }

    #[test]
    fn hhi_invalid_entries_are_none() {
        assert_eq!(compute_stake_concentration(&[10.0, -1.0]), (None, None));
        assert_eq!(compute_stake_concentration(&[10.0, f64::NAN]), (None, None));
    }

    #[test]
    fn power_mapping_matches_linear_at_exponent_one() {
        let linear = stake_quality(2_500.0, StakeQualityMapping::Linear);
        let power = stake_quality(2_500.0, StakeQualityMapping::Power { exponent: 1.0 });
        assert!(approx(linear, power));
        let steeper = stake_quality(2_500.0, StakeQualityMapping::Power { exponent: 2.0 });
        assert!(steeper < linear);
    }

    // -- consensus / trust ------------------------------------------------

    #[test]
    fn consensus_alignment_counts_within_tolerance() {
        // mean 0.5; 0.45 and 0.55 within 0.10, 0.9 and 0.1 not.
        let got = compute_consensus_alignment(&[0.45, 0.55, 0.9, 0.1], 0.10).unwrap();
        assert!(approx(got, 50.0));
    }

    #[test]
    fn consensus_alignment_singleton_is_none() {
        assert_eq!(compute_consensus_alignment(&[0.7], 0.10), None);
        assert_eq!(compute_consensus_alignment(&[], 0.10), None);
    }

    #[test]
    fn trust_unweighted_and_weighted() {
        let trust = [0.2, 0.8];
        assert!(approx(compute_trust_score(&trust, None).unwrap().unwrap(), 0.5));
        let w = compute_trust_score(&trust, Some(&[1.0, 3.0])).unwrap().unwrap();
        assert!(approx(w, 0.65));
    }

    #[test]
    fn trust_empty_is_none() {
        assert_eq!(compute_trust_score(&[], None).unwrap(), None);
    }

    #[test]
    fn trust_zero_weights_is_none() {
        assert_eq!(compute_trust_score(&[0.5], Some(&[0.0])).unwrap(), None);
    }

    #[test]
    fn trust_length_mismatch_errors() {
        let err = compute_trust_score(&[0.5, 0.5], Some(&[1.0])).unwrap_err();
        assert!(matches!(err, ScoringError::LengthMismatch { .. }));
    }

    // -- emission ---------------------------------------------------------

    #[test]
    fn emission_split_zero_sum_is_none() {
        assert_eq!(compute_emission_split(0.0, 0.0, 0.0), None);
    }

    #[test]
    fn emission_split_proportions() {
        assert_eq!(compute_emission_split(1.0, 1.0, 2.0), Some((0.25, 0.25, 0.5)));
    }

    #[test]
    fn emission_split_negative_or_nan_is_none() {
        assert_eq!(compute_emission_split(-1.0, 1.0, 2.0), None);
        assert_eq!(compute_emission_split(f64::NAN, 1.0, 2.0), None);
    }

    #[test]
    fn rolling_split_uses_trailing_window() {
        let mut blocks = vec![(100.0, 0.0, 0.0); 5];
        blocks.extend(vec![(1.0, 1.0, 2.0); 3]);
        let split = compute_rolling_emission_split(&blocks, 3).unwrap();
        assert_eq!(split.window_blocks, 3);
        assert!(approx(split.owner, 0.25));
        assert!(approx(split.validators, 0.5));

        let all = compute_rolling_emission_split(&blocks, 360).unwrap();
        assert_eq!(all.window_blocks, 8);
        assert!(all.owner > 0.9);
    }

    #[test]
    fn daily_emission_is_multiplication() {
        assert!(approx(estimate_daily_emission(0.5, 7_200), 3_600.0));
    }

    #[test]
    fn emission_roi_missing_stake_is_none() {
        assert_eq!(compute_emission_roi(100.0, 0.0), None);
        assert_eq!(compute_emission_roi(100.0, -5.0), None);
        assert_eq!(compute_emission_roi(100.0, 1_000.0), Some(0.1));
    }

    #[test]
    fn rao_conversion_is_exact() {
        assert_eq!(rao_to_tao(Decimal::from(1_500_000_000u64)), Some(1.5));
    }

    // -- market -----------------------------------------------------------

    #[test]
    fn price_change_from_history_basic() {
        let history = [10.0, 12.0, 15.0];
        assert!(approx(price_change_from_history(&history, 1).unwrap(), 25.0));
        assert!(approx(price_change_from_history(&history, 2).unwrap(), 50.0));
        assert_eq!(price_change_from_history(&history, 3), None);
        assert_eq!(price_change_from_history(&[0.0, 5.0], 1), None);
    }

    #[test]
    fn buy_sell_ratio_floors_sell_at_one() {
        assert_eq!(compute_buy_sell_ratio(5.0, 0.2), Some(5.0));
        assert_eq!(compute_buy_sell_ratio(5.0, 2.0), Some(2.5));
        assert_eq!(compute_buy_sell_ratio(-1.0, 2.0), None);
    }

    #[test]
    fn validator_utilization_zero_capacity_is_none() {
        assert_eq!(compute_validator_utilization(10, 0), None);
        assert_eq!(compute_validator_utilization(64, 256), Some(0.25));
    }

    #[test]
    fn active_stake_ratio_mismatch_errors() {
        assert!(compute_active_stake_ratio(&[1.0, 2.0], &[true]).is_err());
        let ratio = compute_active_stake_ratio(&[1.0, 3.0], &[true, false]).unwrap();
        assert_eq!(ratio, Some(0.25));
    }

    // -- compute_record ---------------------------------------------------

    #[test]
    fn record_from_empty_payloads_is_all_none() {
        let mut quality = QualityLog::new();
        let record = compute_record(inputs(None, None), &CalculatorConfig::default(), &mut quality);
        assert_eq!(record.stake_hhi, None);
        assert_eq!(record.emission_roi, None);
        assert_eq!(record.market_cap, None);
        assert!(quality.is_empty());
    }

    #[test]
    fn record_full_on_chain_payload() {
        let chain = json!({
            "stakes": [100.0, 100.0, 200.0],
            "consensus": [0.5, 0.52, 0.9],
            "trust": [0.5, 0.5, 1.0],
            "incentive": [0.1, 0.2, 0.7],
            "validator_permit": [true, false, true],
            "max_validators": 64,
            "emission_per_block_rao": "1000000000",
            "owner_emission_rao": 18,
            "miner_emission_rao": 41,
            "validator_emission_rao": 41,
            "market_cap_tao": 10000.0,
            "tao_in_rao": "2000000000000",
            "tao_in_prev_rao": "1000000000000"
        });
        let mut quality = QualityLog::new();
        let record = compute_record(
            inputs(Some(&chain), None),
            &CalculatorConfig::default(),
            &mut quality,
        );

        assert_eq!(record.stake_total, Some(400.0));
        assert!(approx(record.stake_hhi.unwrap(), 3_750.0));
        assert_eq!(record.active_validator_count, Some(2));
        assert!(approx(record.validator_utilization.unwrap(), 2.0 / 64.0));
        assert!(approx(record.active_stake_ratio.unwrap(), 0.75));
        // Stake-weighted: (0.5*100 + 0.5*100 + 1.0*200) / 400.
        assert!(approx(record.trust_score.unwrap(), 0.75));
        assert!(approx(record.emission_daily_estimate.unwrap(), 7_200.0));
        assert!(approx(record.emission_roi.unwrap(), 18.0));
        let split = record.emission_split.unwrap();
        assert_eq!(split.window_blocks, 1);
        assert!(approx(split.owner, 0.18));
        assert!(approx(record.reserve_momentum.unwrap(), 0.1));
        assert!(quality.is_empty());
    }

    #[test]
    fn record_negative_stake_is_quality_event() {
        let chain = json!({ "stakes": [10.0, -3.0] });
        let mut quality = QualityLog::new();
        let record = compute_record(
            inputs(Some(&chain), None),
            &CalculatorConfig::default(),
            &mut quality,
        );
        assert_eq!(record.stake_hhi, None);
        assert_eq!(record.stake_total, None);
        assert_eq!(quality.events()[0].issue, QualityIssue::Negative);
    }

    #[test]
    fn record_zero_emission_gives_zero_roi_not_none() {
        let chain = json!({ "stakes": [10.0], "emission_per_block_rao": 0 });
        let mut quality = QualityLog::new();
        let record = compute_record(
            inputs(Some(&chain), None),
            &CalculatorConfig::default(),
            &mut quality,
        );
        assert_eq!(record.emission_roi, Some(0.0));
    }

    #[test]
    fn record_nan_emission_is_missing() {
        let chain = json!({ "stakes": [10.0], "emission_per_block_rao": "NaN" });
        let mut quality = QualityLog::new();
        let record = compute_record(
            inputs(Some(&chain), None),
            &CalculatorConfig::default(),
            &mut quality,
        );
        assert_eq!(record.emission_daily_estimate, None);
        assert_eq!(record.emission_roi, None);
        assert_eq!(quality.len(), 1);
    }

    #[test]
    fn record_utilization_over_capacity_is_clamped_and_recorded() {
        let chain = json!({ "validator_permit": [true, true, true], "max_validators": 2 });
        let mut quality = QualityLog::new();
        let record = compute_record(
            inputs(Some(&chain), None),
            &CalculatorConfig::default(),
            &mut quality,
        );
        assert_eq!(record.validator_utilization, Some(1.0));
        assert_eq!(record.clamps.len(), 1);
        assert!(approx(record.clamps[0].raw, 1.5));
    }

    #[test]
    fn record_rolling_window_preferred_over_single_block() {
        let chain = json!({
            "owner_emission_rao": 100, "miner_emission_rao": 0, "validator_emission_rao": 0,
            "emission_window": [
                { "owner": 1, "miner": 1, "validator": 2 },
                { "owner": 1, "miner": 1, "validator": 2 }
            ]
        });
        let mut quality = QualityLog::new();
        let record = compute_record(
            inputs(Some(&chain), None),
            &CalculatorConfig::default(),
            &mut quality,
        );
        let split = record.emission_split.unwrap();
        assert_eq!(split.window_blocks, 2);
        assert!(approx(split.miners, 0.25));
    }

    #[test]
    fn record_market_fields_and_canonical_precedence() {
        let chain = json!({ "stakes": [50.0, 50.0], "market_cap_tao": 2000.0 });
        let market = json!({
            "market_cap": 1500.0,
            "total_stake": 999.0,
            "net_volume_tao_24h": -200.0,
            "buy_vol_tao_1d": 30.0,
            "sell_vol_tao_1d": 10.0,
            "price_history": [1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 2.0]
        });
        let mut quality = QualityLog::new();
        let mut i = inputs(Some(&chain), Some(&market));
        i.global_price_usd = Some(400.0);
        let record = compute_record(i, &CalculatorConfig::default(), &mut quality);

        assert_eq!(record.market_cap, Some(2000.0));
        assert_eq!(record.stake_total, Some(100.0));
        assert_eq!(record.market_cap_usd, Some(800_000.0));
        assert!(approx(record.flow_turnover.unwrap(), -0.1));
        assert_eq!(record.buy_sell_ratio, Some(3.0));
        assert!(approx(record.price_1d_change.unwrap(), 100.0));
        assert!(approx(record.price_7d_change.unwrap(), 100.0));
        assert_eq!(record.price_30d_change, None);
    }

    #[test]
    fn hhi_rounding_residue_is_clamped_and_recorded() {
        let mut clamps = Vec::new();
        let hhi = clamp_recorded(&mut clamps, 7, FactorKey::StakeHhi, HHI_MAX + 1e-9);
        assert_eq!(hhi, HHI_MAX);
        assert_eq!(clamps.len(), 1);
        assert_eq!(clamps[0].field, FactorKey::StakeHhi);

        let chain = json!({ "stakes": [200.0] });
        let mut quality = QualityLog::new();
        let record = compute_record(inputs(Some(&chain), None), &CalculatorConfig::default(), &mut quality);
        assert_eq!(record.stake_hhi, Some(HHI_MAX));
        assert!(record.clamps.is_empty());
    }

    #[test]
    fn non_finite_price_history_entry_keeps_day_positions() {
        let market = json!({ "price_history": [1.0, "NaN", 2.0] });
        let mut quality = QualityLog::new();
        let record = compute_record(inputs(None, Some(&market)), &CalculatorConfig::default(), &mut quality);

        // The 1d base is the NaN entry, not the day before it.
        assert_eq!(record.price_1d_change, None);
        assert_eq!(quality.len(), 1);
        assert_eq!(quality.events()[0].field, "price_history");
        assert_eq!(quality.events()[0].issue, QualityIssue::NonFinite);

        let market = json!({ "price_history": ["NaN", 1.0, 2.0] });
        let mut quality = QualityLog::new();
        let record = compute_record(inputs(None, Some(&market)), &CalculatorConfig::default(), &mut quality);
        assert!(approx(record.price_1d_change.unwrap(), 100.0));
        assert_eq!(quality.len(), 1);
    }

    #[test]
    fn global_price_must_be_positive() {
        let mut quality = QualityLog::new();
        assert_eq!(global_price_usd(&json!({ "price_usd": 420.5 }), &mut quality), Some(420.5));
        assert_eq!(global_price_usd(&json!({ "price_usd": 0 }), &mut quality), None);
        assert_eq!(quality.len(), 1);
    }
}
