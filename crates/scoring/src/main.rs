use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use subnet_scoring::config;
use subnet_scoring::core::pipeline;
use subnet_scoring::errors::ScoringError;
use subnet_scoring::logging;
use subnet_scoring::store::SnapshotStore;
use subnet_scoring::types::AlertTier;

/// Run one scoring cycle.
///
/// Usage: `subnet-scoring [SNAPSHOT_TS]`. The snapshot timestamp (unix
/// seconds) defaults to now.
#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (ignore if missing).
    let _ = dotenvy::dotenv();

    let config_dir = std::env::var("SCORING_CONFIG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config"));

    let config = config::load_config(&config_dir)?;

    // Hold the guard for the process lifetime.
    let _guard = logging::init_tracing(&config.app.logging)?;

    let snapshot_ts = match std::env::args().nth(1) {
        Some(arg) => arg
            .parse::<i64>()
            .with_context(|| format!("invalid snapshot timestamp '{arg}'"))?,
        None => SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("system clock before unix epoch")?
            .as_secs() as i64,
    };

    info!(
        snapshot_ts,
        primary = %config.scores.primary,
        definitions = config.scores.definitions.len(),
        risk = %config.alerts.risk.name,
        "subnet scoring starting"
    );

    let store = SnapshotStore::new(&config.app.database.path)
        .await
        .context("failed to initialize snapshot store")?;

    let input = store
        .load_cycle_input(snapshot_ts, config.app.cycle.input_window_seconds)
        .await?;
    if input.entities.is_empty() {
        warn!(snapshot_ts, "no raw snapshots in the input window, nothing to score");
        return Ok(());
    }

    // -----------------------------------------------------------------------
    // Cycle with Ctrl+C cancellation
    // -----------------------------------------------------------------------

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    let signal_handle = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received, cancelling cycle");
            signal_token.cancel();
        }
    });

    let cycle_config = config.clone();
    let cycle_token = cancel.clone();
    let result = tokio::task::spawn_blocking(move || {
        pipeline::run_cycle(&input, &cycle_config, &cycle_token)
    })
    .await
    .context("cycle task panicked")?;
    signal_handle.abort();

    let output = match result {
        Ok(output) => output,
        Err(ScoringError::Cancelled { snapshot_ts }) => {
            warn!(snapshot_ts, "cycle cancelled, nothing committed");
            return Ok(());
        }
        Err(e) => {
            error!(error = %e, "cycle failed");
            return Err(e.into());
        }
    };

    store
        .commit_cycle(&output, &config.scores.definitions, &config.alerts.risk)
        .await
        .context("failed to commit cycle")?;

    let red_flags = output
        .alerts
        .iter()
        .filter(|a| a.tier == AlertTier::RedFlag)
        .count();
    let watchlist = output
        .alerts
        .iter()
        .filter(|a| a.tier == AlertTier::Watchlist)
        .count();

    info!(
        snapshot_ts,
        entities = output.records.len(),
        scores = output.scores.len(),
        red_flags,
        watchlist,
        outliers = output.outliers.len(),
        redundancies = output.redundancies.len(),
        quality_events = output.quality_events.len(),
        "cycle complete"
    );
    Ok(())
}
