use serde::{Deserialize, Serialize};

/// Closed subnet taxonomy used for peer-group partitioning.
///
/// Labels outside this set never reach the normalizer directly: they are
/// held as a [`CategorySuggestion`] until promoted onto an existing variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "LLM-Inference")]
    LlmInference,
    #[serde(rename = "LLM-Training")]
    LlmTraining,
    #[serde(rename = "Data")]
    Data,
    #[serde(rename = "GPU-Compute")]
    GpuCompute,
    #[serde(rename = "BTC-Hash")]
    BtcHash,
    #[serde(rename = "Trading")]
    Trading,
    #[serde(rename = "Tooling")]
    Tooling,
    #[serde(rename = "Research")]
    Research,
    #[serde(rename = "Infrastructure")]
    Infrastructure,
    #[serde(rename = "Other")]
    Other,
}

impl Category {
    pub const ALL: [Category; 10] = [
        Self::LlmInference,
        Self::LlmTraining,
        Self::Data,
        Self::GpuCompute,
        Self::BtcHash,
        Self::Trading,
        Self::Tooling,
        Self::Research,
        Self::Infrastructure,
        Self::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LlmInference => "LLM-Inference",
            Self::LlmTraining => "LLM-Training",
            Self::Data => "Data",
            Self::GpuCompute => "GPU-Compute",
            Self::BtcHash => "BTC-Hash",
            Self::Trading => "Trading",
            Self::Tooling => "Tooling",
            Self::Research => "Research",
            Self::Infrastructure => "Infrastructure",
            Self::Other => "Other",
        }
    }

    /// Match an enrichment label against the taxonomy (case-insensitive,
    /// surrounding whitespace ignored).
    pub fn from_label(label: &str) -> Option<Self> {
        let label = label.trim();
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(label))
    }
}

/// One subnet. Created on first ingestion, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub netuid: u32,
    pub name: String,
    pub category: Option<Category>,
}

/// A label proposed by the enrichment collaborator that is not part of the
/// taxonomy. Pending until explicitly promoted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategorySuggestion {
    pub id: Option<i64>,
    pub netuid: u32,
    pub label: String,
    pub suggested_at: i64,
    pub promoted_to: Option<Category>,
}

/// Result of applying an enrichment label to an entity.
#[derive(Debug, Clone, PartialEq)]
pub enum CategoryUpdate {
    Assigned(Category),
    Suggested(CategorySuggestion),
}

impl Entity {
    /// Apply an enrichment label. Known labels set the category; unknown
    /// labels leave the entity untouched and yield a pending suggestion.
    pub fn apply_category_label(&mut self, label: &str, now: i64) -> CategoryUpdate {
        match Category::from_label(label) {
            Some(category) => {
                self.category = Some(category);
                CategoryUpdate::Assigned(category)
            }
            None => CategoryUpdate::Suggested(CategorySuggestion {
                id: None,
                netuid: self.netuid,
                label: label.trim().to_string(),
                suggested_at: now,
                promoted_to: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_label_is_case_insensitive() {
        assert_eq!(Category::from_label(" gpu-compute "), Some(Category::GpuCompute));
        assert_eq!(Category::from_label("LLM-Inference"), Some(Category::LlmInference));
        assert_eq!(Category::from_label("Quantum"), None);
    }

    #[test]
    fn serde_uses_display_labels() {
        let json = serde_json::to_string(&Category::BtcHash).unwrap();
        assert_eq!(json, "\"BTC-Hash\"");
        let back: Category = serde_json::from_str("\"LLM-Training\"").unwrap();
        assert_eq!(back, Category::LlmTraining);
    }

    #[test]
    fn unknown_label_becomes_suggestion() {
        let mut entity = Entity {
            netuid: 7,
            name: "allways".into(),
            category: Some(Category::Trading),
        };
        match entity.apply_category_label("Bridging", 100) {
            CategoryUpdate::Suggested(s) => {
                assert_eq!(s.netuid, 7);
                assert_eq!(s.label, "Bridging");
                assert!(s.promoted_to.is_none());
            }
            other => panic!("expected suggestion, got {other:?}"),
        }
        assert_eq!(entity.category, Some(Category::Trading));
    }

    #[test]
    fn known_label_assigns_category() {
        let mut entity = Entity {
            netuid: 1,
            name: "apex".into(),
            category: None,
        };
        let update = entity.apply_category_label("research", 0);
        assert_eq!(update, CategoryUpdate::Assigned(Category::Research));
        assert_eq!(entity.category, Some(Category::Research));
    }
}
