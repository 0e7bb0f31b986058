use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::version::ImageVersion;

/// Category of a field-level difference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DifferenceType {
    Prompt,
    Parameters,
    Metadata,
    Visual,
}

/// A single field that differs between two versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Difference {
    #[serde(rename = "type")]
    pub diff_type: DifferenceType,
    pub field: String,
    pub old_value: serde_json::Value,
    pub new_value: serde_json::Value,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComparisonType {
    Manual,
    Auto,
}

impl std::fmt::Display for ComparisonType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComparisonType::Manual => f.write_str("manual"),
            ComparisonType::Auto => f.write_str("auto"),
        }
    }
}

/// Result of comparing two versions. Derived on demand, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comparison {
    pub id: String,
    pub version_a: ImageVersion,
    pub version_b: ImageVersion,
    pub differences: Vec<Difference>,
    /// In [0, 1].
    pub similarity: f64,
    pub compared_at: DateTime<Utc>,
    pub comparison_type: ComparisonType,
}

impl Comparison {
    pub(crate) fn new(
        version_a: ImageVersion,
        version_b: ImageVersion,
        differences: Vec<Difference>,
        similarity: f64,
        comparison_type: ComparisonType,
    ) -> Self {
        Self {
            id: format!("cmp-{}", Uuid::new_v4().as_simple()),
            version_a,
            version_b,
            differences,
            similarity,
            compared_at: Utc::now(),
            comparison_type,
        }
    }

    pub fn is_identical(&self) -> bool {
        self.differences.is_empty()
    }
}
