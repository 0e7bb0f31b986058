use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::fmt::Write;

use crate::config::SimilarityConfig;
use crate::model::comparison::{Comparison, ComparisonType, Difference, DifferenceType};
use crate::model::version::{AiParameters, Dimensions, ImageVersion};

// ---------------------------------------------------------------------------
// Field table: the single definition of "what counts as different"
// ---------------------------------------------------------------------------

/// One comparable field. Shared by [`find_differences`] and
/// [`find_conflicts`].
pub struct FieldSpec {
    pub name: &'static str,
    pub diff_type: DifferenceType,
    pub description: &'static str,
    /// Whether a mismatch on this field is reported as a branch conflict.
    pub conflict: bool,
    pub accessor: fn(&ImageVersion) -> Value,
    pub equal: fn(&Value, &Value) -> bool,
}

fn strict_eq(a: &Value, b: &Value) -> bool {
    a == b
}

fn dimensions_value(d: Option<Dimensions>) -> Value {
    d.map_or(Value::Null, |d| json!({ "width": d.width, "height": d.height }))
}

fn params(v: &ImageVersion) -> &AiParameters {
    &v.metadata.ai_parameters
}

/// Compared in this order.
pub const FIELDS: &[FieldSpec] = &[
    FieldSpec {
        name: "prompt",
        diff_type: DifferenceType::Prompt,
        description: "Prompt text changed",
        conflict: true,
        accessor: |v| json!(v.prompt),
        equal: strict_eq,
    },
    FieldSpec {
        name: "model",
        diff_type: DifferenceType::Parameters,
        description: "AI model changed",
        conflict: true,
        accessor: |v| json!(params(v).model),
        equal: strict_eq,
    },
    FieldSpec {
        name: "provider",
        diff_type: DifferenceType::Parameters,
        description: "AI provider changed",
        conflict: true,
        accessor: |v| json!(params(v).provider),
        equal: strict_eq,
    },
    FieldSpec {
        name: "seed",
        diff_type: DifferenceType::Parameters,
        description: "Generation seed changed",
        conflict: false,
        accessor: |v| json!(params(v).seed),
        equal: strict_eq,
    },
    FieldSpec {
        name: "guidance",
        diff_type: DifferenceType::Parameters,
        description: "Guidance scale changed",
        conflict: false,
        accessor: |v| json!(params(v).guidance),
        equal: strict_eq,
    },
    FieldSpec {
        name: "steps",
        diff_type: DifferenceType::Parameters,
        description: "Inference steps changed",
        conflict: false,
        accessor: |v| json!(params(v).steps),
        equal: strict_eq,
    },
    FieldSpec {
        name: "enhance",
        diff_type: DifferenceType::Parameters,
        description: "Prompt enhancement toggled",
        conflict: false,
        accessor: |v| json!(params(v).enhance),
        equal: strict_eq,
    },
    FieldSpec {
        name: "style",
        diff_type: DifferenceType::Parameters,
        description: "Style preset changed",
        conflict: false,
        accessor: |v| json!(params(v).style),
        equal: strict_eq,
    },
    FieldSpec {
        name: "dimensions",
        diff_type: DifferenceType::Visual,
        description: "Image dimensions changed",
        conflict: true,
        accessor: |v| dimensions_value(v.metadata.dimensions),
        equal: strict_eq,
    },
    FieldSpec {
        name: "title",
        diff_type: DifferenceType::Metadata,
        description: "Title changed",
        conflict: false,
        accessor: |v| json!(v.metadata.title),
        equal: strict_eq,
    },
    FieldSpec {
        name: "description",
        diff_type: DifferenceType::Metadata,
        description: "Description changed",
        conflict: false,
        accessor: |v| json!(v.metadata.description),
        equal: strict_eq,
    },
    FieldSpec {
        name: "fileSize",
        diff_type: DifferenceType::Metadata,
        description: "File size changed",
        conflict: false,
        accessor: |v| json!(v.metadata.file_size),
        equal: strict_eq,
    },
];

fn diff_fields<'a>(
    fields: impl Iterator<Item = &'a FieldSpec>,
    old: &ImageVersion,
    new: &ImageVersion,
) -> Vec<Difference> {
    fields
        .filter_map(|field| {
            let old_value = (field.accessor)(old);
            let new_value = (field.accessor)(new);
            if (field.equal)(&old_value, &new_value) {
                return None;
            }
            Some(Difference {
                diff_type: field.diff_type,
                field: field.name.to_string(),
                old_value,
                new_value,
                description: field.description.to_string(),
            })
        })
        .collect()
}

/// Every mismatched field between `old` and `new`, at most one entry per
/// field, in table order.
pub fn find_differences(old: &ImageVersion, new: &ImageVersion) -> Vec<Difference> {
    diff_fields(FIELDS.iter(), old, new)
}

/// The subset of differences that matter when two branch heads diverge:
/// prompt, model, provider, dimensions.
pub fn find_conflicts(source: &ImageVersion, target: &ImageVersion) -> Vec<Difference> {
    diff_fields(FIELDS.iter().filter(|f| f.conflict), source, target)
}

// ---------------------------------------------------------------------------
// Similarity
// ---------------------------------------------------------------------------

pub const PROMPT_WEIGHT: f64 = 0.40;
pub const PARAMETER_WEIGHT: f64 = 0.30;
pub const DIMENSION_WEIGHT: f64 = 0.10;
pub const TAG_WEIGHT: f64 = 0.10;
pub const FILE_SIZE_WEIGHT: f64 = 0.05;
pub const GENERATION_TIME_WEIGHT: f64 = 0.05;

/// Jaccard index. Two empty sets are identical; one empty set shares nothing.
fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => 1.0,
        (true, false) | (false, true) => 0.0,
        _ => {
            let intersection = a.intersection(b).count() as f64;
            let union = a.union(b).count() as f64;
            intersection / union
        }
    }
}

fn prompt_tokens(prompt: &str) -> BTreeSet<String> {
    prompt.split_whitespace().map(str::to_lowercase).collect()
}

/// smaller/larger, with 0-vs-0 as identical and 0-vs-nonzero as disjoint.
fn ratio(a: f64, b: f64) -> f64 {
    if a == b {
        return 1.0;
    }
    let (lo, hi) = if a < b { (a, b) } else { (b, a) };
    if lo <= 0.0 {
        0.0
    } else {
        lo / hi
    }
}

/// Ratio of two optional magnitudes; `None` when neither side has a value.
fn optional_ratio(a: Option<u64>, b: Option<u64>) -> Option<f64> {
    match (a, b) {
        (None, None) => None,
        (a, b) => Some(ratio(a.unwrap_or(0) as f64, b.unwrap_or(0) as f64)),
    }
}

/// Per-field match: `None` when neither side sets it, 0 when only one does.
fn field_match<T>(a: &Option<T>, b: &Option<T>, same: impl Fn(&T, &T) -> bool) -> Option<f64> {
    match (a, b) {
        (None, None) => None,
        (Some(x), Some(y)) => Some(if same(x, y) { 1.0 } else { 0.0 }),
        _ => Some(0.0),
    }
}

fn dimension_similarity(a: Option<Dimensions>, b: Option<Dimensions>) -> Option<f64> {
    match (a, b) {
        (None, None) => None,
        (Some(x), Some(y)) => Some(
            (ratio(x.width as f64, y.width as f64) + ratio(x.height as f64, y.height as f64))
                / 2.0,
        ),
        _ => Some(0.0),
    }
}

/// Weighted, per-field resemblance of two versions.
#[derive(Debug, Clone, Default)]
pub struct ComparisonEngine {
    config: SimilarityConfig,
}

impl ComparisonEngine {
    pub fn new(config: SimilarityConfig) -> Self {
        Self { config }
    }

    /// Fraction of the AI parameters set on either side that match.
    fn parameter_similarity(&self, a: &AiParameters, b: &AiParameters) -> Option<f64> {
        let guidance_tol = self.config.guidance_tolerance;
        let steps_tol = self.config.steps_tolerance;

        let scores = [
            field_match(&a.model, &b.model, |x, y| x == y),
            field_match(&a.provider, &b.provider, |x, y| x == y),
            field_match(&a.seed, &b.seed, |x, y| x == y),
            field_match(&a.guidance, &b.guidance, |x, y| (x - y).abs() <= guidance_tol),
            field_match(&a.steps, &b.steps, |x, y| x.abs_diff(*y) <= steps_tol),
            field_match(&a.enhance, &b.enhance, |x, y| x == y),
            field_match(&a.style, &b.style, |x, y| x == y),
        ];

        let evaluated: Vec<f64> = scores.into_iter().flatten().collect();
        if evaluated.is_empty() {
            return None;
        }
        Some(evaluated.iter().sum::<f64>() / evaluated.len() as f64)
    }

    /// Similarity in [0, 1]. Sub-scores whose fields are absent on both
    /// sides are left out and the remaining weights renormalised.
    pub fn calculate_similarity(&self, a: &ImageVersion, b: &ImageVersion) -> f64 {
        let (ma, mb) = (&a.metadata, &b.metadata);
        let lower_tags =
            |tags: &BTreeSet<String>| tags.iter().map(|t| t.to_lowercase()).collect::<BTreeSet<_>>();

        let parts: [(f64, Option<f64>); 6] = [
            (
                PROMPT_WEIGHT,
                Some(jaccard(&prompt_tokens(&a.prompt), &prompt_tokens(&b.prompt))),
            ),
            (
                PARAMETER_WEIGHT,
                self.parameter_similarity(&ma.ai_parameters, &mb.ai_parameters),
            ),
            (
                DIMENSION_WEIGHT,
                dimension_similarity(ma.dimensions, mb.dimensions),
            ),
            (TAG_WEIGHT, Some(jaccard(&lower_tags(&ma.tags), &lower_tags(&mb.tags)))),
            (FILE_SIZE_WEIGHT, optional_ratio(ma.file_size, mb.file_size)),
            (
                GENERATION_TIME_WEIGHT,
                optional_ratio(ma.generation_duration_ms, mb.generation_duration_ms),
            ),
        ];

        let mut weighted = 0.0;
        let mut total_weight = 0.0;
        for (weight, score) in parts {
            if let Some(score) = score {
                weighted += weight * score;
                total_weight += weight;
            }
        }

        if total_weight == 0.0 {
            return 1.0;
        }
        (weighted / total_weight).clamp(0.0, 1.0)
    }

    pub fn compare(
        &self,
        a: &ImageVersion,
        b: &ImageVersion,
        comparison_type: ComparisonType,
    ) -> Comparison {
        let similarity = self.calculate_similarity(a, b);
        let differences = find_differences(a, b);
        Comparison::new(a.clone(), b.clone(), differences, similarity, comparison_type)
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

fn display_title(v: &ImageVersion) -> &str {
    if v.metadata.title.trim().is_empty() {
        "Untitled"
    } else {
        &v.metadata.title
    }
}

/// Plain-text rendering of a comparison. Same input, same output.
pub fn generate_comparison_report(comparison: &Comparison) -> String {
    let a = &comparison.version_a;
    let b = &comparison.version_b;
    let mut out = String::new();

    // Writing to a String cannot fail.
    let _ = writeln!(out, "Version Comparison Report");
    let _ = writeln!(out, "=========================");
    let _ = writeln!(out, "Version A: {} (v{})", display_title(a), a.version_number);
    let _ = writeln!(out, "Version B: {} (v{})", display_title(b), b.version_number);
    let _ = writeln!(out, "Similarity: {:.1}%", comparison.similarity * 100.0);
    let _ = writeln!(out);

    if comparison.is_identical() {
        let _ = writeln!(out, "The versions are identical.");
    } else {
        let _ = writeln!(out, "Differences ({}):", comparison.differences.len());
        for (i, diff) in comparison.differences.iter().enumerate() {
            let _ = writeln!(
                out,
                "  {}. {}: {} -> {}",
                i + 1,
                diff.field,
                diff.old_value,
                diff.new_value
            );
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "Compared at: {}", comparison.compared_at.to_rfc3339());
    let _ = write!(out, "Mode: {}", comparison.comparison_type);
    out
}
