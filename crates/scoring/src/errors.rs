use thiserror::Error;

/// Typed error hierarchy for the scoring core.
///
/// Missing data is never an error here: it travels as `None`. These variants
/// cover contract violations by the caller. Storage, config and I/O failures
/// propagate as `anyhow::Error` with context; a `ScoringError` raised inside
/// the store (a version conflict) can be recovered with `downcast_ref`.
#[derive(Error, Debug)]
pub enum ScoringError {
    // -- Definitions --------------------------------------------------------
    #[error("invalid definition {name}@{version}: {reason}")]
    InvalidDefinition {
        name: String,
        version: String,
        reason: String,
    },

    #[error("{name}@{version} is already registered with a different definition")]
    VersionConflict { name: String, version: String },

    // -- Population ---------------------------------------------------------
    #[error("mixed snapshot timestamps: expected {expected}, netuid {netuid} has {found}")]
    MixedSnapshot {
        expected: i64,
        found: i64,
        netuid: u32,
    },

    #[error("length mismatch: {left_name} has {left} entries, {right_name} has {right}")]
    LengthMismatch {
        left_name: &'static str,
        left: usize,
        right_name: &'static str,
        right: usize,
    },

    // -- Cycle --------------------------------------------------------------
    #[error("cycle for snapshot {snapshot_ts} cancelled before normalization")]
    Cancelled { snapshot_ts: i64 },
}
