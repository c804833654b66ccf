use std::collections::HashSet;

use anyhow::{bail, Result};

use super::types::ScoringConfig;

/// Validate invariants across the merged config that serde alone cannot
/// enforce. Every violation is collected so one run reports all of them.
pub fn validate_config(config: &ScoringConfig) -> Result<()> {
    let mut errors: Vec<String> = Vec::new();

    validate_app(config, &mut errors);
    validate_calculator(config, &mut errors);
    validate_normalizer(config, &mut errors);
    validate_scores(config, &mut errors);
    validate_alerts(config, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        let msg = format!(
            "Configuration validation failed ({} error{}):\n  - {}",
            errors.len(),
            if errors.len() == 1 { "" } else { "s" },
            errors.join("\n  - ")
        );
        bail!("{msg}");
    }
}

// ---------------------------------------------------------------------------
// App config
// ---------------------------------------------------------------------------

fn validate_app(config: &ScoringConfig, errors: &mut Vec<String>) {
    let app = &config.app;
    if app.database.path.trim().is_empty() {
        errors.push("app.database: path is empty".into());
    }
    if app.logging.log_dir.trim().is_empty() {
        errors.push("app.logging: log_dir is empty".into());
    }
    if let Err(e) = crate::logging::parse_level(&app.logging.level) {
        errors.push(format!("app.logging: {e}"));
    }
    if app.cycle.input_window_seconds <= 0 {
        errors.push(format!(
            "app.cycle: input_window_seconds must be > 0, got {}",
            app.cycle.input_window_seconds
        ));
    }
}

// ---------------------------------------------------------------------------
// Calculator config
// ---------------------------------------------------------------------------

fn validate_calculator(config: &ScoringConfig, errors: &mut Vec<String>) {
    let calc = &config.calculator;

    if !(calc.consensus_tolerance > 0.0 && calc.consensus_tolerance <= 1.0) {
        errors.push(format!(
            "calculator: consensus_tolerance must be in (0, 1], got {}",
            calc.consensus_tolerance
        ));
    }
    if calc.blocks_per_day == 0 {
        errors.push("calculator: blocks_per_day must be > 0".into());
    }
    if calc.default_validator_capacity == 0 {
        errors.push("calculator: default_validator_capacity must be > 0".into());
    }
    if calc.emission_window_blocks == 0 {
        errors.push("calculator: emission_window_blocks must be > 0".into());
    }
    if let super::types::StakeQualityMapping::Power { exponent } = calc.stake_quality_mapping {
        if !(exponent.is_finite() && exponent > 0.0) {
            errors.push(format!(
                "calculator.stake_quality_mapping: exponent must be finite and > 0, got {exponent}"
            ));
        }
    }
}

// ---------------------------------------------------------------------------
// Normalizer config
// ---------------------------------------------------------------------------

fn validate_normalizer(config: &ScoringConfig, errors: &mut Vec<String>) {
    let norm = &config.normalizer;

    if !(norm.robust_cap.is_finite() && norm.robust_cap > 0.0) {
        errors.push(format!("normalizer: robust_cap must be > 0, got {}", norm.robust_cap));
    }
    let ordered = norm.winsor_low_pct >= 0.0
        && norm.winsor_low_pct < norm.winsor_high_pct
        && norm.winsor_high_pct <= 1.0;
    if !ordered {
        errors.push(format!(
            "normalizer: winsor percentiles must satisfy 0 <= low ({}) < high ({}) <= 1",
            norm.winsor_low_pct, norm.winsor_high_pct
        ));
    }
    if norm.min_sample_size < 2 {
        errors.push(format!(
            "normalizer: min_sample_size must be >= 2, got {}",
            norm.min_sample_size
        ));
    }
    if !(norm.outlier_threshold.is_finite() && norm.outlier_threshold > 0.0) {
        errors.push(format!(
            "normalizer: outlier_threshold must be > 0, got {}",
            norm.outlier_threshold
        ));
    }
    if !(norm.redundancy_threshold > 0.0 && norm.redundancy_threshold <= 1.0) {
        errors.push(format!(
            "normalizer: redundancy_threshold must be in (0, 1], got {}",
            norm.redundancy_threshold
        ));
    }
}

// ---------------------------------------------------------------------------
// Score and risk definitions
// ---------------------------------------------------------------------------

fn validate_scores(config: &ScoringConfig, errors: &mut Vec<String>) {
    let scores = &config.scores;

    if scores.definitions.is_empty() {
        errors.push("scores: at least one definition is required".into());
    }
    if scores.primary_definition().is_none() {
        errors.push(format!(
            "scores: primary score '{}' has no definition",
            scores.primary
        ));
    }

    let mut seen = HashSet::new();
    for def in &scores.definitions {
        if !seen.insert((def.name.as_str(), def.version.as_str())) {
            errors.push(format!("scores: {}@{} defined twice", def.name, def.version));
        }
        if let Err(e) = def.validate() {
            errors.push(format!("scores: {e}"));
        }
    }
}

fn validate_alerts(config: &ScoringConfig, errors: &mut Vec<String>) {
    if let Err(e) = config.alerts.risk.validate() {
        errors.push(format!("alerts: {e}"));
    }
}
