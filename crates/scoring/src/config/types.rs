use serde::Deserialize;

use crate::constants::{BLOCKS_PER_DAY, DEFAULT_VALIDATOR_CAPACITY, TEMPO_BLOCKS};
use crate::types::{RiskDefinition, ScoreDefinition};

// ---------------------------------------------------------------------------
// Top-level aggregate
// ---------------------------------------------------------------------------

/// Explicit configuration passed into every cycle. Nothing in the core reads
/// ambient global state.
#[derive(Debug, Clone, Deserialize)]
pub struct ScoringConfig {
    pub app: AppConfig,
    pub calculator: CalculatorConfig,
    pub normalizer: NormalizerConfig,
    pub scores: ScoresConfig,
    pub alerts: AlertsConfig,
}

// ---------------------------------------------------------------------------
// app.json
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    pub cycle: CycleConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub log_dir: String,
    #[serde(default = "default_log_file")]
    pub file_name: String,
    /// Level for this crate when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_file() -> String {
    "scoring.log".into()
}

fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CycleConfig {
    /// Raw snapshots older than this (relative to the cycle timestamp) are
    /// ignored when assembling cycle input.
    pub input_window_seconds: i64,
}

// ---------------------------------------------------------------------------
// calculator.json
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CalculatorConfig {
    /// Half-width of the band around mean consensus counted as aligned.
    pub consensus_tolerance: f64,
    pub blocks_per_day: u64,
    pub default_validator_capacity: u32,
    /// Blocks averaged for the rolling emission split.
    pub emission_window_blocks: u32,
    #[serde(default)]
    pub stake_quality_mapping: StakeQualityMapping,
}

impl Default for CalculatorConfig {
    fn default() -> Self {
        Self {
            consensus_tolerance: 0.10,
            blocks_per_day: BLOCKS_PER_DAY,
            default_validator_capacity: DEFAULT_VALIDATOR_CAPACITY,
            emission_window_blocks: TEMPO_BLOCKS,
            stake_quality_mapping: StakeQualityMapping::Linear,
        }
    }
}

/// Mapping from HHI to stake quality (0-100, decreasing in HHI).
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StakeQualityMapping {
    /// `max(0, 100 - hhi / 100)`.
    #[default]
    Linear,
    /// `100 * (1 - hhi / 10000) ^ exponent`.
    Power { exponent: f64 },
}

// ---------------------------------------------------------------------------
// normalizer.json
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct NormalizerConfig {
    /// Bound applied by the capped z-score, in standard deviations.
    pub robust_cap: f64,
    pub winsor_low_pct: f64,
    pub winsor_high_pct: f64,
    /// Populations smaller than this skip winsorization and outlier listing.
    pub min_sample_size: usize,
    /// MAD z-score above which an entity is listed as a factor outlier.
    pub outlier_threshold: f64,
    /// |r| at or above which two score factors are reported as redundant.
    pub redundancy_threshold: f64,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            robust_cap: 8.0,
            winsor_low_pct: 0.01,
            winsor_high_pct: 0.99,
            min_sample_size: 8,
            outlier_threshold: 2.0,
            redundancy_threshold: 0.95,
        }
    }
}

// ---------------------------------------------------------------------------
// scores.json / alerts.json
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ScoresConfig {
    /// Name of the score published as the headline health score.
    pub primary: String,
    pub definitions: Vec<ScoreDefinition>,
}

impl ScoresConfig {
    pub fn primary_definition(&self) -> Option<&ScoreDefinition> {
        self.definitions.iter().find(|d| d.name == self.primary)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertsConfig {
    pub risk: RiskDefinition,
}
