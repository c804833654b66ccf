use serde::{Deserialize, Serialize};

use super::metrics::FactorKey;
use crate::constants::WEIGHT_SUM_TOLERANCE;
use crate::errors::ScoringError;

/// Direction of a factor: `-1` flips "lower is better" factors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "i8", into = "i8")]
pub enum Sign {
    #[default]
    Positive,
    Negative,
}

impl Sign {
    pub fn value(&self) -> f64 {
        match self {
            Self::Positive => 1.0,
            Self::Negative => -1.0,
        }
    }
}

impl TryFrom<i8> for Sign {
    type Error = String;

    fn try_from(v: i8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Self::Positive),
            -1 => Ok(Self::Negative),
            other => Err(format!("sign must be 1 or -1, got {other}")),
        }
    }
}

impl From<Sign> for i8 {
    fn from(s: Sign) -> i8 {
        match s {
            Sign::Positive => 1,
            Sign::Negative => -1,
        }
    }
}

/// Value transform applied before normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    #[default]
    Identity,
    /// Sign-preserving `ln(1 + |x|)`, for heavy-tailed volume and flow metrics.
    Log1p,
}

/// How a transformed factor is made comparable across entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    /// Use the transformed value as-is.
    Raw,
    /// Population z-score.
    ZScore,
    /// Population z-score clamped to the configured robust cap.
    #[default]
    CappedZScore,
}

/// Population a factor is normalized against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    #[default]
    Population,
    /// Peers in the same category. Uncategorized entities fall back to the
    /// full population.
    Category,
}

/// Missing-factor policy of a score definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strictness {
    /// Exclude missing factors and renormalize the remaining weights.
    Lenient,
    /// Any missing factor makes the whole score unavailable.
    Strict,
}

/// One weighted term of a score or risk formula.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorSpec {
    pub factor: FactorKey,
    pub weight: f64,
    #[serde(default)]
    pub sign: Sign,
    #[serde(default)]
    pub transform: Transform,
    #[serde(default)]
    pub normalization: Normalization,
    /// Clip to the configured percentiles before normalizing (only when the
    /// population reaches the minimum sample size).
    #[serde(default)]
    pub winsorize: bool,
    #[serde(default)]
    pub scope: Scope,
}

/// A named, versioned composite score. Any change to the factor list,
/// weights or transforms requires a new version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreDefinition {
    pub name: String,
    pub version: String,
    pub strictness: Strictness,
    #[serde(default)]
    pub description: String,
    pub factors: Vec<FactorSpec>,
}

impl ScoreDefinition {
    pub fn validate(&self) -> Result<(), ScoringError> {
        validate_formula(&self.name, &self.version, &self.factors)
    }
}

/// A versioned risk sub-formula with its two tier thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskDefinition {
    pub name: String,
    pub version: String,
    pub watchlist_threshold: f64,
    pub red_flag_threshold: f64,
    pub factors: Vec<FactorSpec>,
}

impl RiskDefinition {
    pub fn validate(&self) -> Result<(), ScoringError> {
        validate_formula(&self.name, &self.version, &self.factors)?;
        let ordered = self.watchlist_threshold.is_finite()
            && self.red_flag_threshold.is_finite()
            && self.watchlist_threshold > 0.0
            && self.watchlist_threshold < self.red_flag_threshold;
        if !ordered {
            return Err(invalid(
                &self.name,
                &self.version,
                format!(
                    "thresholds must satisfy 0 < watchlist ({}) < red_flag ({})",
                    self.watchlist_threshold, self.red_flag_threshold
                ),
            ));
        }
        Ok(())
    }
}

fn invalid(name: &str, version: &str, reason: String) -> ScoringError {
    ScoringError::InvalidDefinition {
        name: name.to_string(),
        version: version.to_string(),
        reason,
    }
}

/// Shared contract checks for score and risk formulas.
fn validate_formula(name: &str, version: &str, factors: &[FactorSpec]) -> Result<(), ScoringError> {
    if name.trim().is_empty() || version.trim().is_empty() {
        return Err(invalid(name, version, "name and version must be non-empty".into()));
    }
    if factors.is_empty() {
        return Err(invalid(name, version, "factor list is empty".into()));
    }

    for spec in factors {
        if !spec.weight.is_finite() || spec.weight < 0.0 {
            return Err(invalid(
                name,
                version,
                format!("weight for {} must be finite and >= 0, got {}", spec.factor.as_str(), spec.weight),
            ));
        }
    }

    let sum: f64 = factors.iter().map(|s| s.weight).sum();
    if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
        return Err(invalid(name, version, format!("weights sum to {sum}, expected 1")));
    }

    for (i, spec) in factors.iter().enumerate() {
        if factors[..i].iter().any(|s| s.factor == spec.factor) {
            return Err(invalid(
                name,
                version,
                format!("duplicate factor {}", spec.factor.as_str()),
            ));
        }
        if let Some(source) = spec.factor.derived_from() {
            if factors.iter().any(|s| s.factor == source) {
                return Err(invalid(
                    name,
                    version,
                    format!(
                        "{} is derived from {}; weight only one of them",
                        spec.factor.as_str(),
                        source.as_str()
                    ),
                ));
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Per-factor term of a composite or risk formula.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorContribution {
    pub factor: FactorKey,
    /// Value from the derived record, if available.
    pub raw: Option<f64>,
    /// Transformed and normalized value, before the sign is applied.
    pub normalized: Option<f64>,
    pub sign: Sign,
    /// Weight from the definition.
    pub weight: f64,
    /// Weight actually applied after renormalization (0 when excluded).
    pub effective_weight: f64,
    pub contribution: f64,
}

/// One composite score for one entity at one snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeScore {
    pub netuid: u32,
    pub snapshot_ts: i64,
    pub name: String,
    pub version: String,
    /// Percentile rank among the snapshot's scored entities, 0-100.
    pub value: Option<f64>,
    /// Weighted sum before clipping and ranking; equals the sum of
    /// `breakdown[..].contribution`.
    pub raw_composite: Option<f64>,
    /// One entry per definition factor, in definition order.
    pub breakdown: Vec<FactorContribution>,
}
