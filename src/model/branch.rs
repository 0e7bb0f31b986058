use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::model::version::VersionId;

// ---------------------------------------------------------------------------
// Branch: a named pointer into the version graph
// ---------------------------------------------------------------------------

pub type BranchId = String;

pub fn new_branch_id() -> BranchId {
    format!("b-{}", Uuid::new_v4().as_simple())
}

const BRANCH_PALETTE: [&str; 12] = [
    "#3B82F6", "#10B981", "#F59E0B", "#EF4444", "#8B5CF6", "#EC4899", "#14B8A6", "#F97316",
    "#6366F1", "#84CC16", "#06B6D4", "#A855F7",
];

/// Key under which branch names are compared: trimmed and Unicode-lowercased.
pub fn name_key(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Deterministic display color for a branch name. Names differing only in
/// case map to the same color.
pub fn branch_color(name: &str) -> String {
    let digest = Sha256::digest(name_key(name).as_bytes());
    let index = u16::from_be_bytes([digest[0], digest[1]]) as usize % BRANCH_PALETTE.len();
    BRANCH_PALETTE[index].to_string()
}

/// A named lineage with a movable head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    pub id: BranchId,
    pub name: String,
    pub root_version_id: VersionId,
    /// Always a member of `version_ids`.
    pub head_version_id: VersionId,
    pub version_ids: Vec<VersionId>,
    pub color: String,
    /// True for the branch the active-branch pointer designates.
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set once the branch has been retired; retired branches stop tracking.
    pub retired_at: Option<DateTime<Utc>>,
}

impl Branch {
    /// Create a branch whose initial head is `source`.
    pub fn new(name: impl Into<String>, root_version_id: VersionId, source: VersionId) -> Self {
        let name = name.into();
        let now = Utc::now();
        Self {
            id: new_branch_id(),
            color: branch_color(&name),
            name,
            root_version_id,
            head_version_id: source.clone(),
            version_ids: vec![source],
            is_active: false,
            created_at: now,
            updated_at: now,
            retired_at: None,
        }
    }

    pub fn contains(&self, version_id: &str) -> bool {
        self.version_ids.iter().any(|v| v == version_id)
    }

    pub fn is_retired(&self) -> bool {
        self.retired_at.is_some()
    }

    /// Case-insensitive name match.
    pub fn has_name(&self, name: &str) -> bool {
        name_key(&self.name) == name_key(name)
    }

    /// Append a version and move the head onto it.
    pub(crate) fn advance_head(&mut self, version_id: VersionId) {
        if !self.contains(&version_id) {
            self.version_ids.push(version_id.clone());
        }
        self.head_version_id = version_id;
        self.updated_at = Utc::now();
    }

    pub(crate) fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
        self.color = branch_color(&self.name);
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_seeds_head() {
        let branch = Branch::new("feature", "v-root".into(), "v-2".into());
        assert_eq!(branch.head_version_id, "v-2");
        assert_eq!(branch.version_ids, vec!["v-2".to_string()]);
        assert!(branch.id.starts_with("b-"));
        assert!(!branch.is_retired());
    }

    #[test]
    fn test_color_is_deterministic_and_case_insensitive() {
        assert_eq!(branch_color("Feature"), branch_color("feature"));
        assert_eq!(branch_color("feature"), branch_color("feature"));
        assert!(branch_color("x").starts_with('#'));
    }

    #[test]
    fn test_advance_head_does_not_duplicate() {
        let mut branch = Branch::new("main", "v-1".into(), "v-1".into());
        branch.advance_head("v-2".into());
        branch.advance_head("v-2".into());
        assert_eq!(branch.version_ids.len(), 2);
        assert_eq!(branch.head_version_id, "v-2");
    }

    #[test]
    fn test_rename_recolors() {
        let mut branch = Branch::new("a", "v-1".into(), "v-1".into());
        branch.rename("sketches");
        assert_eq!(branch.color, branch_color("sketches"));
        assert!(branch.has_name("SKETCHES"));
    }

    #[test]
    fn test_has_name_folds_non_ascii() {
        let branch = Branch::new("Ärger", "v-1".into(), "v-1".into());
        assert!(branch.has_name("ärger"));
        assert!(branch.has_name("  ÄRGER "));
        assert!(!branch.has_name("arger"));
        assert_eq!(name_key(" Ärger "), "ärger");
    }
}
