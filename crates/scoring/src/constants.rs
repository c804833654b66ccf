use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Smallest on-chain unit per native token.
pub const RAO_PER_TAO: Decimal = dec!(1_000_000_000);

/// 12-second blocks.
pub const BLOCKS_PER_DAY: u64 = 7_200;

/// One tempo: the emission distribution period.
pub const TEMPO_BLOCKS: u32 = 360;

/// Validator permit slots per subnet when the probe does not report one.
pub const DEFAULT_VALIDATOR_CAPACITY: u32 = 256;

/// HHI upper bound (a single holder owning everything).
pub const HHI_MAX: f64 = 10_000.0;

/// Scales MAD to the standard deviation of a normal distribution.
pub const MAD_CONSISTENCY: f64 = 0.6745;

/// Tolerance applied to weight vectors that must sum to one.
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// Minimum paired observations for a correlation coefficient.
pub const MIN_CORRELATION_POINTS: usize = 3;
