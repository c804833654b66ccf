use anyhow::{Context, Result};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Dependencies log at `warn` unless `RUST_LOG` says otherwise.
const DEPENDENCY_LEVEL: &str = "warn";

/// Install the global subscriber: JSON lines to a daily-rolling file plus a
/// compact stderr stream.
///
/// `RUST_LOG` wins when set. Otherwise this crate logs at
/// `app.logging.level` and everything else at `warn`.
///
/// The returned [`WorkerGuard`] flushes the file writer on drop and must be
/// held until the process exits.
pub fn init_tracing(logging: &LoggingConfig) -> Result<WorkerGuard> {
    std::fs::create_dir_all(&logging.log_dir)
        .with_context(|| format!("failed to create log dir {}", logging.log_dir))?;

    let file_appender = tracing_appender::rolling::daily(&logging.log_dir, &logging.file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_directive(logging)?)
            .context("invalid app.logging.level")?,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .json(),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .init();

    Ok(guard)
}

/// Filter directive for this crate at the configured level.
fn default_directive(logging: &LoggingConfig) -> Result<String> {
    let level = parse_level(&logging.level)?;
    Ok(format!(
        "{}={},{DEPENDENCY_LEVEL}",
        env!("CARGO_CRATE_NAME"),
        level.to_string().to_ascii_lowercase()
    ))
}

/// Case-insensitive `trace` through `error`.
pub fn parse_level(level: &str) -> Result<Level> {
    level
        .trim()
        .parse::<Level>()
        .map_err(|_| anyhow::anyhow!("unknown log level '{level}'"))
}
