use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// ImageVersion: one generated artifact iteration
// ---------------------------------------------------------------------------

/// A version identifier, unique within the version store.
pub type VersionId = String;

/// Generate a new version ID.
pub fn new_version_id() -> VersionId {
    format!("v-{}", Uuid::new_v4().as_simple())
}

/// Lifecycle status of a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionStatus {
    Active,
    Archived,
    Deleted,
    Draft,
}

impl VersionStatus {
    pub const ALL: [VersionStatus; 4] = [
        VersionStatus::Active,
        VersionStatus::Archived,
        VersionStatus::Deleted,
        VersionStatus::Draft,
    ];
}

/// How a version came into existence relative to its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionType {
    Original,
    Revision,
    Branch,
    Merge,
}

impl VersionType {
    pub const ALL: [VersionType; 4] = [
        VersionType::Original,
        VersionType::Revision,
        VersionType::Branch,
        VersionType::Merge,
    ];
}

/// Pixel dimensions of a rendered image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl std::fmt::Display for Dimensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Parameters handed to the generation provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AiParameters {
    pub model: Option<String>,
    pub provider: Option<String>,
    pub seed: Option<u64>,
    pub guidance: Option<f64>,
    pub steps: Option<u32>,
    pub enhance: Option<bool>,
    pub style: Option<String>,
}

/// Engagement counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageStats {
    pub view_count: u64,
    pub like_count: u64,
    pub export_count: u64,
}

/// Which usage counter an interaction bumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageKind {
    View,
    Like,
    Export,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionMetadata {
    pub title: String,
    pub description: Option<String>,
    pub tags: BTreeSet<String>,
    /// Generation wall time in milliseconds.
    pub generation_duration_ms: Option<u64>,
    /// Stored image size in bytes.
    pub file_size: Option<u64>,
    pub dimensions: Option<Dimensions>,
    pub ai_parameters: AiParameters,
    pub usage: UsageStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single generated image iteration in a lineage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageVersion {
    pub id: VersionId,
    /// Position within the sibling set sharing `parent_version_id`, from 1.
    pub version_number: u32,
    pub status: VersionStatus,
    #[serde(rename = "type")]
    pub version_type: VersionType,
    pub parent_version_id: Option<VersionId>,
    /// Children in insertion order.
    pub child_version_ids: Vec<VersionId>,
    pub root_version_id: VersionId,
    pub branch_name: Option<String>,
    pub prompt: String,
    pub original_prompt: String,
    pub image_url: Option<String>,
    pub metadata: VersionMetadata,
}

impl ImageVersion {
    pub fn is_root(&self) -> bool {
        self.parent_version_id.is_none()
    }

    pub fn is_leaf(&self) -> bool {
        self.child_version_ids.is_empty()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.metadata.created_at
    }

    pub fn usage_count(&self, kind: UsageKind) -> u64 {
        match kind {
            UsageKind::View => self.metadata.usage.view_count,
            UsageKind::Like => self.metadata.usage.like_count,
            UsageKind::Export => self.metadata.usage.export_count,
        }
    }
}

// ---------------------------------------------------------------------------
// Inputs to create / update
// ---------------------------------------------------------------------------

/// Caller-supplied data for a new version. Identity, numbering, lineage
/// links, counters and timestamps are assigned by the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewVersion {
    pub parent_version_id: Option<VersionId>,
    pub version_type: Option<VersionType>,
    pub status: Option<VersionStatus>,
    pub branch_name: Option<String>,
    pub prompt: String,
    /// Defaults to `prompt`.
    pub original_prompt: Option<String>,
    pub image_url: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub tags: BTreeSet<String>,
    pub generation_duration_ms: Option<u64>,
    pub file_size: Option<u64>,
    pub dimensions: Option<Dimensions>,
    pub ai_parameters: AiParameters,
}

impl NewVersion {
    /// A root version with the given prompt.
    pub fn root(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    /// A child of `parent` with the given prompt.
    pub fn child_of(parent: impl Into<VersionId>, prompt: impl Into<String>) -> Self {
        Self {
            parent_version_id: Some(parent.into()),
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_type(mut self, version_type: VersionType) -> Self {
        self.version_type = Some(version_type);
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch_name = Some(branch.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_parameters(mut self, params: AiParameters) -> Self {
        self.ai_parameters = params;
        self
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.dimensions = Some(Dimensions::new(width, height));
        self
    }

    pub fn with_file_size(mut self, bytes: u64) -> Self {
        self.file_size = Some(bytes);
        self
    }

    pub fn with_generation_time(mut self, millis: u64) -> Self {
        self.generation_duration_ms = Some(millis);
        self
    }
}

/// Partial metadata update. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VersionPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub tags: Option<BTreeSet<String>>,
    pub status: Option<VersionStatus>,
    pub image_url: Option<String>,
    pub generation_duration_ms: Option<u64>,
    pub file_size: Option<u64>,
    pub dimensions: Option<Dimensions>,
}

impl VersionPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.tags.is_none()
            && self.status.is_none()
            && self.image_url.is_none()
            && self.generation_duration_ms.is_none()
            && self.file_size.is_none()
            && self.dimensions.is_none()
    }

    /// Merge this patch into `metadata` and `version`, refreshing `updated_at`.
    pub(crate) fn apply(self, version: &mut ImageVersion, now: DateTime<Utc>) {
        let meta = &mut version.metadata;
        if let Some(title) = self.title {
            meta.title = title;
        }
        if let Some(description) = self.description {
            meta.description = Some(description);
        }
        if let Some(tags) = self.tags {
            meta.tags = tags;
        }
        if let Some(ms) = self.generation_duration_ms {
            meta.generation_duration_ms = Some(ms);
        }
        if let Some(bytes) = self.file_size {
            meta.file_size = Some(bytes);
        }
        if let Some(dimensions) = self.dimensions {
            meta.dimensions = Some(dimensions);
        }
        meta.updated_at = now;
        if let Some(status) = self.status {
            version.status = status;
        }
        if let Some(url) = self.image_url {
            version.image_url = Some(url);
        }
    }
}
