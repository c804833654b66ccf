pub mod alert;
pub mod entity;
pub mod metrics;
pub mod quality;
pub mod score;
pub mod snapshot;
pub mod stats;

pub use alert::{AlertFlag, AlertTier, OutlierFlag};
pub use entity::{Category, CategorySuggestion, CategoryUpdate, Entity};
pub use metrics::{ClampEvent, DerivedMetricRecord, EmissionSplit, FactorKey};
pub use quality::{DataQualityEvent, QualityIssue, QualityLog};
pub use score::{
    CompositeScore, FactorContribution, FactorSpec, Normalization, RiskDefinition,
    ScoreDefinition, Scope, Sign, Strictness, Transform,
};
pub use snapshot::{Payload, RawSnapshot, SourceKind};
pub use stats::{CategorySpread, CrossSectionalStats, FactorStats};
