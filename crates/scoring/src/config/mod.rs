pub mod types;
pub mod validate;

pub use types::*;

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use tracing::info;

/// Load and merge all config JSON files into a single [`ScoringConfig`],
/// then apply environment variable overrides and validate.
///
/// Expected directory layout:
/// ```text
/// config/
///   app.json
///   calculator.json
///   normalizer.json
///   scores.json
///   alerts.json
/// ```
///
/// # Environment variable overrides
///
/// Only infrastructure settings can be overridden. Weights, transforms and
/// thresholds are bound to their version tags and are read from JSON only.
///
/// | Env Var                        | Config Field                     |
/// |--------------------------------|----------------------------------|
/// | `SCORING_DB_PATH`              | `app.database.path`              |
/// | `SCORING_LOG_DIR`              | `app.logging.log_dir`            |
/// | `SCORING_LOG_LEVEL`            | `app.logging.level`              |
/// | `SCORING_INPUT_WINDOW_SECONDS` | `app.cycle.input_window_seconds` |
pub fn load_config(config_dir: &Path) -> Result<ScoringConfig> {
    let read = |name: &str| -> Result<String> {
        let path = config_dir.join(name);
        std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file: {}", path.display()))
    };

    let app: AppConfig = serde_json::from_str(&read("app.json")?).context("parsing app.json")?;

    let calculator: CalculatorConfig =
        serde_json::from_str(&read("calculator.json")?).context("parsing calculator.json")?;

    let normalizer: NormalizerConfig =
        serde_json::from_str(&read("normalizer.json")?).context("parsing normalizer.json")?;

    let scores: ScoresConfig =
        serde_json::from_str(&read("scores.json")?).context("parsing scores.json")?;

    let alerts: AlertsConfig =
        serde_json::from_str(&read("alerts.json")?).context("parsing alerts.json")?;

    let mut config = ScoringConfig {
        app,
        calculator,
        normalizer,
        scores,
        alerts,
    };

    apply_env_overrides(&mut config);
    validate::validate_config(&config)?;

    Ok(config)
}

// ---------------------------------------------------------------------------
// Environment variable overrides
// ---------------------------------------------------------------------------

/// Only non-empty env vars take effect. Parse failures are skipped and the
/// JSON value remains.
fn apply_env_overrides(config: &mut ScoringConfig) {
    if let Some(val) = env_string("SCORING_DB_PATH") {
        info!(path = %val, "env override: SCORING_DB_PATH");
        config.app.database.path = val;
    }

    if let Some(val) = env_string("SCORING_LOG_DIR") {
        info!(dir = %val, "env override: SCORING_LOG_DIR");
        config.app.logging.log_dir = val;
    }

    if let Some(val) = env_string("SCORING_LOG_LEVEL") {
        info!(level = %val, "env override: SCORING_LOG_LEVEL");
        config.app.logging.level = val;
    }

    if let Some(val) = env_parse::<i64>("SCORING_INPUT_WINDOW_SECONDS") {
        info!(val, "env override: SCORING_INPUT_WINDOW_SECONDS");
        config.app.cycle.input_window_seconds = val;
    }
}

/// Read a non-empty env var as a `String`.
fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Read a non-empty env var and parse it as `T`.
fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse().ok())
}
