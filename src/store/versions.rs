use chrono::Utc;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use crate::error::{LineageError, LineageResult};
use crate::model::version::{
    new_version_id, ImageVersion, NewVersion, UsageKind, UsageStats, VersionId, VersionMetadata,
    VersionPatch, VersionStatus, VersionType,
};

// ---------------------------------------------------------------------------
// VersionStore: arena of ImageVersion records with lineage indexes
// ---------------------------------------------------------------------------

/// Owns every [`ImageVersion`] keyed by id.
///
/// Parent/child links live on the records themselves (`parent_version_id`
/// and `child_version_ids`); two derived indexes are maintained on every
/// mutation:
/// - `by_parent`: sibling sets keyed by parent id (`None` for roots)
/// - `by_root`: lineage membership keyed by root id
///
/// Every mutating method validates before writing, so a rejected call
/// leaves the store untouched.
#[derive(Debug, Clone, Default)]
pub struct VersionStore {
    versions: HashMap<VersionId, ImageVersion>,
    by_parent: HashMap<Option<VersionId>, Vec<VersionId>>,
    by_root: HashMap<VersionId, Vec<VersionId>>,
}

impl VersionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from already-linked records, rebuilding the indexes.
    /// Structural validation is the caller's job (see `store::integrity`).
    pub fn from_records(records: impl IntoIterator<Item = ImageVersion>) -> Self {
        let mut store = Self::new();
        store.versions = records.into_iter().map(|v| (v.id.clone(), v)).collect();
        store.rebuild_indexes();
        store
    }

    /// Insert linked records next to the existing ones. Ids must not clash
    /// and parents must be resolvable; callers check both beforehand.
    pub(crate) fn extend(&mut self, records: impl IntoIterator<Item = ImageVersion>) {
        for record in records {
            self.versions.insert(record.id.clone(), record);
        }
        self.rebuild_indexes();
    }

    fn rebuild_indexes(&mut self) {
        self.by_parent.clear();
        self.by_root.clear();

        let mut ordered: Vec<&ImageVersion> = self.versions.values().collect();
        ordered.sort_by(|a, b| {
            a.metadata
                .created_at
                .cmp(&b.metadata.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        for version in ordered {
            self.by_parent
                .entry(version.parent_version_id.clone())
                .or_default()
                .push(version.id.clone());
            self.by_root
                .entry(version.root_version_id.clone())
                .or_default()
                .push(version.id.clone());
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn get(&self, id: &str) -> Option<&ImageVersion> {
        self.versions.get(id)
    }

    /// Like [`get`](Self::get) but fails with `NotFound`.
    pub fn require(&self, id: &str) -> LineageResult<&ImageVersion> {
        self.versions
            .get(id)
            .ok_or_else(|| LineageError::version_not_found(id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.versions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ImageVersion> {
        self.versions.values()
    }

    /// Number of versions sharing `parent` (roots when `None`).
    pub fn sibling_count(&self, parent: Option<&str>) -> usize {
        self.by_parent
            .get(&parent.map(str::to_string))
            .map_or(0, Vec::len)
    }

    /// Root versions ordered by creation.
    pub fn roots(&self) -> Vec<&ImageVersion> {
        self.by_parent
            .get(&None)
            .into_iter()
            .flatten()
            .filter_map(|id| self.versions.get(id))
            .collect()
    }

    /// Every version whose `root_version_id` is `root_id`, ordered by creation.
    pub fn lineage_members(&self, root_id: &str) -> Vec<&ImageVersion> {
        self.by_root
            .get(root_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.versions.get(id))
            .collect()
    }

    pub fn lineage_size(&self, root_id: &str) -> usize {
        self.by_root.get(root_id).map_or(0, Vec::len)
    }

    /// Ids from the lineage root down to `id`, inclusive. Stops early on a
    /// dangling parent reference or a cycle.
    pub fn ancestry(&self, id: &str) -> LineageResult<Vec<VersionId>> {
        let mut path = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut current = Some(self.require(id)?);

        while let Some(version) = current {
            if !seen.insert(version.id.as_str()) {
                break;
            }
            path.push(version.id.clone());
            current = version
                .parent_version_id
                .as_deref()
                .and_then(|parent_id| self.versions.get(parent_id));
        }

        path.reverse();
        Ok(path)
    }

    pub fn records(&self) -> Vec<ImageVersion> {
        let mut records: Vec<ImageVersion> = self.versions.values().cloned().collect();
        records.sort_by(|a, b| {
            a.metadata
                .created_at
                .cmp(&b.metadata.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        records
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Check a creation request without writing anything.
    pub fn validate_new(&self, data: &NewVersion) -> LineageResult<()> {
        if let Some(guidance) = data.ai_parameters.guidance {
            if !guidance.is_finite() {
                return Err(LineageError::Validation(format!(
                    "guidance must be a finite number, got {}",
                    guidance
                )));
            }
        }
        match (&data.parent_version_id, data.version_type) {
            (Some(parent_id), version_type) => {
                if !self.contains(parent_id) {
                    return Err(LineageError::Validation(format!(
                        "parent version {} does not exist",
                        parent_id
                    )));
                }
                if version_type == Some(VersionType::Original) {
                    return Err(LineageError::Validation(
                        "a version with a parent cannot be of type original".to_string(),
                    ));
                }
            }
            (None, Some(t)) if t != VersionType::Original => {
                return Err(LineageError::Validation(format!(
                    "a root version must be of type original, got {:?}",
                    t
                )));
            }
            (None, _) => {}
        }
        Ok(())
    }

    /// Create a version from caller data. Returns the new id.
    pub fn create(&mut self, data: NewVersion) -> LineageResult<VersionId> {
        self.validate_new(&data)?;

        let id = new_version_id();
        let now = Utc::now();
        let parent_id = data.parent_version_id.clone();
        let root_version_id = match &parent_id {
            Some(parent) => self.require(parent)?.root_version_id.clone(),
            None => id.clone(),
        };
        let version_type = data.version_type.unwrap_or(if parent_id.is_some() {
            VersionType::Branch
        } else {
            VersionType::Original
        });

        let version = ImageVersion {
            id: id.clone(),
            version_number: self.sibling_count(parent_id.as_deref()) as u32 + 1,
            status: data.status.unwrap_or(VersionStatus::Active),
            version_type,
            parent_version_id: parent_id,
            child_version_ids: Vec::new(),
            root_version_id,
            branch_name: data.branch_name,
            original_prompt: data.original_prompt.unwrap_or_else(|| data.prompt.clone()),
            prompt: data.prompt,
            image_url: data.image_url,
            metadata: VersionMetadata {
                title: data.title,
                description: data.description,
                tags: data.tags,
                generation_duration_ms: data.generation_duration_ms,
                file_size: data.file_size,
                dimensions: data.dimensions,
                ai_parameters: data.ai_parameters,
                usage: UsageStats::default(),
                created_at: now,
                updated_at: now,
            },
        };

        self.insert_linked(version);
        info!(version_id = %id, "version created");
        Ok(id)
    }

    /// Insert a freshly built record and wire it into its parent and indexes.
    fn insert_linked(&mut self, version: ImageVersion) {
        let id = version.id.clone();
        if let Some(parent_id) = &version.parent_version_id {
            if let Some(parent) = self.versions.get_mut(parent_id) {
                parent.child_version_ids.push(id.clone());
            }
        }
        self.by_parent
            .entry(version.parent_version_id.clone())
            .or_default()
            .push(id.clone());
        self.by_root
            .entry(version.root_version_id.clone())
            .or_default()
            .push(id.clone());
        self.versions.insert(id, version);
    }

    /// Merge `patch` into the version's metadata.
    pub fn update(&mut self, id: &str, patch: VersionPatch) -> LineageResult<()> {
        let version = self
            .versions
            .get_mut(id)
            .ok_or_else(|| LineageError::version_not_found(id))?;
        patch.apply(version, Utc::now());
        debug!(version_id = %id, "version updated");
        Ok(())
    }

    /// Set the branch a version was recorded on.
    pub(crate) fn set_branch_name(&mut self, id: &str, branch: Option<String>) {
        if let Some(version) = self.versions.get_mut(id) {
            version.branch_name = branch;
        }
    }

    /// Rename every version recorded on branch `from`.
    pub(crate) fn rename_branch_refs(&mut self, from: &str, to: &str) {
        for version in self.versions.values_mut() {
            if version.branch_name.as_deref() == Some(from) {
                version.branch_name = Some(to.to_string());
            }
        }
    }

    /// Check that `id` exists and is a leaf.
    pub fn validate_delete(&self, id: &str) -> LineageResult<&ImageVersion> {
        let version = self.require(id)?;
        if !version.is_leaf() {
            return Err(LineageError::Conflict(format!(
                "version {} has {} child version(s)",
                id,
                version.child_version_ids.len()
            )));
        }
        Ok(version)
    }

    /// Remove a leaf version and detach it from its parent.
    pub fn delete(&mut self, id: &str) -> LineageResult<ImageVersion> {
        self.validate_delete(id)?;
        let version = self
            .versions
            .remove(id)
            .ok_or_else(|| LineageError::version_not_found(id))?;

        if let Some(parent_id) = &version.parent_version_id {
            if let Some(parent) = self.versions.get_mut(parent_id) {
                parent.child_version_ids.retain(|c| c != id);
            }
        }
        if let Some(siblings) = self.by_parent.get_mut(&version.parent_version_id) {
            siblings.retain(|s| s != id);
            if siblings.is_empty() {
                self.by_parent.remove(&version.parent_version_id);
            }
        }
        if let Some(members) = self.by_root.get_mut(&version.root_version_id) {
            members.retain(|m| m != id);
            if members.is_empty() {
                self.by_root.remove(&version.root_version_id);
            }
        }

        info!(version_id = %id, "version deleted");
        Ok(version)
    }

    /// Copy a version as a new sibling (same parent) with reset counters.
    /// A copy of a root starts its own lineage and stays `Original`.
    pub fn duplicate(&mut self, id: &str) -> LineageResult<VersionId> {
        let source = self.require(id)?.clone();
        let new_id = new_version_id();
        let now = Utc::now();

        let root_version_id = if source.is_root() {
            new_id.clone()
        } else {
            source.root_version_id.clone()
        };

        let mut metadata = source.metadata.clone();
        metadata.title = format!("{} (copy)", metadata.title).trim_start().to_string();
        metadata.usage = UsageStats::default();
        metadata.created_at = now;
        metadata.updated_at = now;

        let copy = ImageVersion {
            id: new_id.clone(),
            version_number: self.sibling_count(source.parent_version_id.as_deref()) as u32 + 1,
            status: source.status,
            version_type: if source.is_root() {
                VersionType::Original
            } else {
                VersionType::Branch
            },
            parent_version_id: source.parent_version_id,
            child_version_ids: Vec::new(),
            root_version_id,
            branch_name: None,
            prompt: source.prompt,
            original_prompt: source.original_prompt,
            image_url: source.image_url,
            metadata,
        };

        self.insert_linked(copy);
        info!(source = %id, version_id = %new_id, "version duplicated");
        Ok(new_id)
    }

    /// Bump a usage counter by one.
    pub fn record_usage(&mut self, id: &str, kind: UsageKind) -> LineageResult<u64> {
        let version = self
            .versions
            .get_mut(id)
            .ok_or_else(|| LineageError::version_not_found(id))?;
        let usage = &mut version.metadata.usage;
        let counter = match kind {
            UsageKind::View => &mut usage.view_count,
            UsageKind::Like => &mut usage.like_count,
            UsageKind::Export => &mut usage.export_count,
        };
        *counter += 1;
        Ok(*counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_root() -> (VersionStore, VersionId) {
        let mut store = VersionStore::new();
        let root = store.create(NewVersion::root("a cat").with_title("Cat")).unwrap();
        (store, root)
    }

    #[test]
    fn test_create_root_defaults() {
        let (store, root) = store_with_root();
        let v = store.get(&root).unwrap();
        assert_eq!(v.version_number, 1);
        assert_eq!(v.version_type, VersionType::Original);
        assert_eq!(v.status, VersionStatus::Active);
        assert_eq!(v.root_version_id, root);
        assert_eq!(v.original_prompt, "a cat");
        assert_eq!(v.metadata.usage, UsageStats::default());
    }

    #[test]
    fn test_create_child_links_both_ways() {
        let (mut store, root) = store_with_root();
        let child = store.create(NewVersion::child_of(&root, "a cat, detailed")).unwrap();

        let c = store.get(&child).unwrap();
        assert_eq!(c.version_type, VersionType::Branch);
        assert_eq!(c.root_version_id, root);
        assert_eq!(c.version_number, 1);
        assert_eq!(store.get(&root).unwrap().child_version_ids, vec![child.clone()]);
        assert_eq!(store.lineage_size(&root), 2);
    }

    #[test]
    fn test_version_number_counts_siblings() {
        let (mut store, root) = store_with_root();
        store.create(NewVersion::child_of(&root, "one")).unwrap();
        store.create(NewVersion::child_of(&root, "two")).unwrap();
        let third = store.create(NewVersion::child_of(&root, "three")).unwrap();
        assert_eq!(store.get(&third).unwrap().version_number, 3);
    }

    #[test]
    fn test_create_with_unknown_parent_is_validation_error() {
        let (mut store, _) = store_with_root();
        let err = store.create(NewVersion::child_of("v-missing", "x")).unwrap_err();
        assert!(matches!(err, LineageError::Validation(_)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_root_must_be_original() {
        let mut store = VersionStore::new();
        let err = store
            .create(NewVersion::root("x").with_type(VersionType::Revision))
            .unwrap_err();
        assert!(matches!(err, LineageError::Validation(_)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_non_finite_guidance_is_rejected() {
        let mut store = VersionStore::new();
        for guidance in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let data = NewVersion::root("x").with_parameters(crate::model::version::AiParameters {
                guidance: Some(guidance),
                ..Default::default()
            });
            let err = store.create(data).unwrap_err();
            assert!(matches!(err, LineageError::Validation(_)));
        }
        assert!(store.is_empty());
    }

    #[test]
    fn test_update_merges_and_refreshes_timestamp() {
        let (mut store, root) = store_with_root();
        let before = store.get(&root).unwrap().metadata.updated_at;
        store
            .update(
                &root,
                VersionPatch {
                    description: Some("fluffy".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        let v = store.get(&root).unwrap();
        assert_eq!(v.metadata.title, "Cat");
        assert_eq!(v.metadata.description.as_deref(), Some("fluffy"));
        assert!(v.metadata.updated_at >= before);

        let err = store.update("v-nope", VersionPatch::default()).unwrap_err();
        assert!(matches!(err, LineageError::NotFound { .. }));
    }

    #[test]
    fn test_delete_guard_and_detach() {
        let (mut store, root) = store_with_root();
        let child = store.create(NewVersion::child_of(&root, "child")).unwrap();

        let err = store.delete(&root).unwrap_err();
        assert!(matches!(err, LineageError::Conflict(_)));
        assert_eq!(store.len(), 2);

        store.delete(&child).unwrap();
        assert!(store.get(&root).unwrap().child_version_ids.is_empty());
        assert_eq!(store.lineage_size(&root), 1);
        assert_eq!(store.sibling_count(Some(&root)), 0);

        store.delete(&root).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_duplicate_is_sibling() {
        let (mut store, root) = store_with_root();
        let child = store.create(NewVersion::child_of(&root, "child").with_title("Kid")).unwrap();
        store.record_usage(&child, UsageKind::View).unwrap();

        let copy = store.duplicate(&child).unwrap();
        let c = store.get(&copy).unwrap();
        assert_eq!(c.parent_version_id.as_deref(), Some(root.as_str()));
        assert_eq!(c.version_type, VersionType::Branch);
        assert_eq!(c.metadata.title, "Kid (copy)");
        assert_eq!(c.metadata.usage.view_count, 0);
        assert_eq!(c.version_number, 2);
        assert_eq!(store.get(&root).unwrap().child_version_ids.len(), 2);
    }

    #[test]
    fn test_duplicate_root_starts_new_lineage() {
        let (mut store, root) = store_with_root();
        let copy = store.duplicate(&root).unwrap();
        let c = store.get(&copy).unwrap();
        assert!(c.is_root());
        assert_eq!(c.root_version_id, copy);
        assert_eq!(c.version_type, VersionType::Original);
        assert_eq!(store.roots().len(), 2);
    }

    #[test]
    fn test_ancestry_runs_root_first() {
        let (mut store, root) = store_with_root();
        let a = store.create(NewVersion::child_of(&root, "a")).unwrap();
        let b = store.create(NewVersion::child_of(&a, "b")).unwrap();
        assert_eq!(store.ancestry(&b).unwrap(), vec![root, a, b]);
    }

    #[test]
    fn test_from_records_rebuilds_indexes() {
        let (mut store, root) = store_with_root();
        store.create(NewVersion::child_of(&root, "a")).unwrap();
        let rebuilt = VersionStore::from_records(store.records());
        assert_eq!(rebuilt.lineage_size(&root), 2);
        assert_eq!(rebuilt.sibling_count(None), 1);
        assert_eq!(rebuilt.sibling_count(Some(&root)), 1);
    }
}
