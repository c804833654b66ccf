use serde::{Deserialize, Serialize};

use super::metrics::FactorKey;
use super::score::FactorContribution;

/// Risk tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlertTier {
    None,
    Watchlist,
    RedFlag,
}

impl AlertTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Watchlist => "watchlist",
            Self::RedFlag => "red-flag",
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "watchlist" => Some(Self::Watchlist),
            "red-flag" => Some(Self::RedFlag),
            _ => None,
        }
    }
}

/// Tier classification for one entity at one snapshot, with the
/// contributions that produced it ordered from largest to smallest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertFlag {
    pub netuid: u32,
    pub snapshot_ts: i64,
    pub name: String,
    pub version: String,
    pub tier: AlertTier,
    /// `None` when no factor was well-defined.
    pub risk_score: Option<f64>,
    pub contributions: Vec<FactorContribution>,
}

/// Statistical outlier on a single factor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlierFlag {
    pub netuid: u32,
    pub factor: FactorKey,
    pub robust_z: f64,
}
