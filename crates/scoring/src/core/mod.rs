pub mod calculator;
pub mod correlation;
pub mod detector;
pub mod normalizer;
pub mod pipeline;
pub mod scorer;
