use serde::{Deserialize, Serialize};

use super::entity::Category;

/// Numeric fields of a [`DerivedMetricRecord`] that can feed normalization,
/// scoring and risk formulas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorKey {
    StakeTotal,
    StakeHhi,
    StakeQuality,
    ActiveValidatorCount,
    ValidatorUtilization,
    ActiveStakeRatio,
    ConsensusAlignment,
    TrustScore,
    MeanIncentive,
    P95Incentive,
    EmissionDailyEstimate,
    EmissionRoi,
    #[serde(rename = "price_1d_change")]
    Price1dChange,
    #[serde(rename = "price_7d_change")]
    Price7dChange,
    #[serde(rename = "price_30d_change")]
    Price30dChange,
    MarketCap,
    MarketCapUsd,
    #[serde(rename = "total_volume_1d")]
    TotalVolume1d,
    #[serde(rename = "flow_24h")]
    Flow24h,
    FlowTurnover,
    ReserveMomentum,
    BuySellRatio,
}

impl FactorKey {
    pub const ALL: [FactorKey; 22] = [
        Self::StakeTotal,
        Self::StakeHhi,
        Self::StakeQuality,
        Self::ActiveValidatorCount,
        Self::ValidatorUtilization,
        Self::ActiveStakeRatio,
        Self::ConsensusAlignment,
        Self::TrustScore,
        Self::MeanIncentive,
        Self::P95Incentive,
        Self::EmissionDailyEstimate,
        Self::EmissionRoi,
        Self::Price1dChange,
        Self::Price7dChange,
        Self::Price30dChange,
        Self::MarketCap,
        Self::MarketCapUsd,
        Self::TotalVolume1d,
        Self::Flow24h,
        Self::FlowTurnover,
        Self::ReserveMomentum,
        Self::BuySellRatio,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StakeTotal => "stake_total",
            Self::StakeHhi => "stake_hhi",
            Self::StakeQuality => "stake_quality",
            Self::ActiveValidatorCount => "active_validator_count",
            Self::ValidatorUtilization => "validator_utilization",
            Self::ActiveStakeRatio => "active_stake_ratio",
            Self::ConsensusAlignment => "consensus_alignment",
            Self::TrustScore => "trust_score",
            Self::MeanIncentive => "mean_incentive",
            Self::P95Incentive => "p95_incentive",
            Self::EmissionDailyEstimate => "emission_daily_estimate",
            Self::EmissionRoi => "emission_roi",
            Self::Price1dChange => "price_1d_change",
            Self::Price7dChange => "price_7d_change",
            Self::Price30dChange => "price_30d_change",
            Self::MarketCap => "market_cap",
            Self::MarketCapUsd => "market_cap_usd",
            Self::TotalVolume1d => "total_volume_1d",
            Self::Flow24h => "flow_24h",
            Self::FlowTurnover => "flow_turnover",
            Self::ReserveMomentum => "reserve_momentum",
            Self::BuySellRatio => "buy_sell_ratio",
        }
    }

    /// The factor this one is a deterministic function of, if any. A
    /// definition may not weight both a factor and its source.
    pub fn derived_from(&self) -> Option<FactorKey> {
        match self {
            Self::StakeQuality => Some(Self::StakeHhi),
            Self::MarketCapUsd => Some(Self::MarketCap),
            _ => None,
        }
    }

    /// Documented closed range, for fields that have one.
    pub fn range(&self) -> Option<(f64, f64)> {
        match self {
            Self::StakeHhi => Some((0.0, 10_000.0)),
            Self::StakeQuality | Self::ConsensusAlignment => Some((0.0, 100.0)),
            Self::ValidatorUtilization | Self::ActiveStakeRatio | Self::TrustScore => {
                Some((0.0, 1.0))
            }
            _ => None,
        }
    }
}

/// Owner / miner / validator share of emission over a block window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmissionSplit {
    pub owner: f64,
    pub miners: f64,
    pub validators: f64,
    /// Number of blocks the split was averaged over.
    pub window_blocks: u32,
}

/// A computed value that fell outside its range and was clamped.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClampEvent {
    pub field: FactorKey,
    pub raw: f64,
    pub clamped: f64,
}

/// Derived metrics for one entity at one snapshot timestamp.
///
/// Every metric is optional: upstream data is partial and an unavailable
/// value is never reported as zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DerivedMetricRecord {
    pub netuid: u32,
    pub snapshot_ts: i64,
    pub category: Option<Category>,

    // -- Stake ------------------------------------------------------------
    pub stake_total: Option<f64>,
    pub stake_hhi: Option<f64>,
    pub stake_quality: Option<f64>,
    pub active_validator_count: Option<u32>,
    pub validator_utilization: Option<f64>,
    pub active_stake_ratio: Option<f64>,

    // -- Consensus --------------------------------------------------------
    pub consensus_alignment: Option<f64>,
    pub trust_score: Option<f64>,
    pub mean_incentive: Option<f64>,
    pub p95_incentive: Option<f64>,

    // -- Emission ---------------------------------------------------------
    pub emission_daily_estimate: Option<f64>,
    pub emission_roi: Option<f64>,
    pub emission_split: Option<EmissionSplit>,

    // -- Market -----------------------------------------------------------
    pub price_1d_change: Option<f64>,
    pub price_7d_change: Option<f64>,
    pub price_30d_change: Option<f64>,
    pub market_cap: Option<f64>,
    pub market_cap_usd: Option<f64>,
    pub total_volume_1d: Option<f64>,
    pub flow_24h: Option<f64>,
    pub flow_turnover: Option<f64>,
    pub reserve_momentum: Option<f64>,
    pub buy_sell_ratio: Option<f64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clamps: Vec<ClampEvent>,
}

impl DerivedMetricRecord {
    pub fn new(netuid: u32, snapshot_ts: i64, category: Option<Category>) -> Self {
        Self {
            netuid,
            snapshot_ts,
            category,
            ..Self::default()
        }
    }

    pub fn factor(&self, key: FactorKey) -> Option<f64> {
        match key {
            FactorKey::StakeTotal => self.stake_total,
            FactorKey::StakeHhi => self.stake_hhi,
            FactorKey::StakeQuality => self.stake_quality,
            FactorKey::ActiveValidatorCount => self.active_validator_count.map(f64::from),
            FactorKey::ValidatorUtilization => self.validator_utilization,
            FactorKey::ActiveStakeRatio => self.active_stake_ratio,
            FactorKey::ConsensusAlignment => self.consensus_alignment,
            FactorKey::TrustScore => self.trust_score,
            FactorKey::MeanIncentive => self.mean_incentive,
            FactorKey::P95Incentive => self.p95_incentive,
            FactorKey::EmissionDailyEstimate => self.emission_daily_estimate,
            FactorKey::EmissionRoi => self.emission_roi,
            FactorKey::Price1dChange => self.price_1d_change,
            FactorKey::Price7dChange => self.price_7d_change,
            FactorKey::Price30dChange => self.price_30d_change,
            FactorKey::MarketCap => self.market_cap,
            FactorKey::MarketCapUsd => self.market_cap_usd,
            FactorKey::TotalVolume1d => self.total_volume_1d,
            FactorKey::Flow24h => self.flow_24h,
            FactorKey::FlowTurnover => self.flow_turnover,
            FactorKey::ReserveMomentum => self.reserve_momentum,
            FactorKey::BuySellRatio => self.buy_sell_ratio,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_factor_has_a_distinct_name() {
        let mut names: Vec<&str> = FactorKey::ALL.iter().map(|f| f.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), FactorKey::ALL.len());
    }

    #[test]
    fn serde_name_matches_as_str() {
        for key in FactorKey::ALL {
            let json = serde_json::to_string(&key).unwrap();
            assert_eq!(json, format!("\"{}\"", key.as_str()));
            let back: FactorKey = serde_json::from_str(&json).unwrap();
            assert_eq!(back, key);
        }
    }

    #[test]
    fn digit_suffixed_names_parse_from_config_spelling() {
        let keys: Vec<FactorKey> = serde_json::from_str(
            r#"["price_1d_change", "price_7d_change", "price_30d_change", "total_volume_1d", "flow_24h"]"#,
        )
        .unwrap();
        assert_eq!(
            keys,
            vec![
                FactorKey::Price1dChange,
                FactorKey::Price7dChange,
                FactorKey::Price30dChange,
                FactorKey::TotalVolume1d,
                FactorKey::Flow24h,
            ]
        );
    }

    #[test]
    fn factor_reads_the_matching_field() {
        let mut record = DerivedMetricRecord::new(4, 0, None);
        record.stake_hhi = Some(2500.0);
        record.active_validator_count = Some(12);
        assert_eq!(record.factor(FactorKey::StakeHhi), Some(2500.0));
        assert_eq!(record.factor(FactorKey::ActiveValidatorCount), Some(12.0));
        assert_eq!(record.factor(FactorKey::EmissionRoi), None);
    }
}
