use serde::{Deserialize, Serialize};
use tracing::warn;

/// Kind of invalid input encountered while deriving or scoring a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityIssue {
    /// NaN or infinite number in a payload.
    NonFinite,
    /// Negative value where only non-negative values are meaningful.
    Negative,
    /// Computed value outside its documented range (clamped and recorded).
    OutOfRange,
    /// Field present with the wrong JSON type.
    TypeMismatch,
    /// Parallel arrays of different lengths.
    LengthMismatch,
    /// A factor transform produced NaN or an infinity.
    NonFiniteTransform,
}

impl QualityIssue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NonFinite => "non_finite",
            Self::Negative => "negative",
            Self::OutOfRange => "out_of_range",
            Self::TypeMismatch => "type_mismatch",
            Self::LengthMismatch => "length_mismatch",
            Self::NonFiniteTransform => "non_finite_transform",
        }
    }
}

/// One data-quality event. The offending value was treated as missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataQualityEvent {
    /// `None` for network-wide inputs such as the global price feed.
    pub netuid: Option<u32>,
    pub field: String,
    pub issue: QualityIssue,
}

/// Per-cycle collector of data-quality events.
#[derive(Debug, Default, Clone)]
pub struct QualityLog {
    events: Vec<DataQualityEvent>,
}

impl QualityLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record and log an event.
    pub fn record(&mut self, netuid: Option<u32>, field: &str, issue: QualityIssue) {
        warn!(
            netuid = ?netuid,
            field,
            issue = issue.as_str(),
            "data-quality event, value treated as missing"
        );
        self.events.push(DataQualityEvent {
            netuid,
            field: field.to_string(),
            issue,
        });
    }

    pub fn events(&self) -> &[DataQualityEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn into_events(self) -> Vec<DataQualityEvent> {
        self.events
    }
}
