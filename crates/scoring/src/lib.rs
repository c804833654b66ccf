//! Subnet analytics core: derives per-subnet metrics from raw snapshots,
//! normalizes them cross-sectionally, and publishes versioned composite
//! scores and risk tiers per snapshot date.

pub mod config;
pub mod constants;
pub mod core;
pub mod errors;
pub mod logging;
pub mod store;
pub mod types;
