use chrono::Utc;
use std::collections::HashMap;
use tracing::{info, warn};

use crate::error::{LineageError, LineageResult};
use crate::model::branch::{name_key, Branch, BranchId};
use crate::model::comparison::Difference;
use crate::model::version::VersionId;
use crate::query::comparison::find_conflicts;
use crate::store::versions::VersionStore;

// ---------------------------------------------------------------------------
// BranchManager: named lineages and the active-branch pointer
// ---------------------------------------------------------------------------

/// Owns [`Branch`] records and the active-branch pointer. Version
/// existence checks go through the [`VersionStore`] passed to each call.
#[derive(Debug, Clone, Default)]
pub struct BranchManager {
    branches: HashMap<BranchId, Branch>,
    active_branch_id: Option<BranchId>,
    protected_names: Vec<String>,
}

impl BranchManager {
    /// `protected_names` are matched case-insensitively.
    pub fn new(protected_names: Vec<String>) -> Self {
        Self {
            branches: HashMap::new(),
            active_branch_id: None,
            protected_names,
        }
    }

    pub fn from_records(
        records: impl IntoIterator<Item = Branch>,
        active_branch_id: Option<BranchId>,
        protected_names: Vec<String>,
    ) -> Self {
        let mut manager = Self::new(protected_names);
        manager.branches = records.into_iter().map(|b| (b.id.clone(), b)).collect();
        manager.active_branch_id = active_branch_id
            .filter(|id| manager.branches.contains_key(id));
        manager.sync_active_flags();
        manager
    }

    pub(crate) fn extend(&mut self, records: impl IntoIterator<Item = Branch>) {
        for mut record in records {
            record.is_active = false;
            self.branches.insert(record.id.clone(), record);
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn get(&self, id: &str) -> Option<&Branch> {
        self.branches.get(id)
    }

    pub fn require(&self, id: &str) -> LineageResult<&Branch> {
        self.branches
            .get(id)
            .ok_or_else(|| LineageError::branch_not_found(id))
    }

    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Branch> {
        self.branches.values()
    }

    pub fn active(&self) -> Option<&Branch> {
        self.active_branch_id
            .as_deref()
            .and_then(|id| self.branches.get(id))
    }

    pub fn active_id(&self) -> Option<&str> {
        self.active_branch_id.as_deref()
    }

    /// Case-insensitive lookup.
    pub fn find_by_name(&self, name: &str) -> Option<&Branch> {
        self.branches.values().find(|b| b.has_name(name))
    }

    pub fn is_protected(&self, name: &str) -> bool {
        self.protected_names
            .iter()
            .any(|p| name_key(p) == name_key(name))
    }

    /// Branches anchored at `root_id`, oldest first.
    pub fn for_root(&self, root_id: &str) -> Vec<&Branch> {
        let mut branches: Vec<&Branch> = self
            .branches
            .values()
            .filter(|b| b.root_version_id == root_id)
            .collect();
        branches.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        branches
    }

    /// Branches whose head is `version_id`, oldest first.
    pub fn heads_at(&self, version_id: &str) -> Vec<&Branch> {
        let mut branches: Vec<&Branch> = self
            .branches
            .values()
            .filter(|b| b.head_version_id == version_id)
            .collect();
        branches.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        branches
    }

    /// The branch to annotate a tree node with: the active branch if it is
    /// headed here, otherwise the oldest branch headed here.
    pub fn head_branch_for(&self, version_id: &str) -> Option<&Branch> {
        if let Some(active) = self.active() {
            if active.head_version_id == version_id {
                return Some(active);
            }
        }
        self.heads_at(version_id).into_iter().next()
    }

    pub fn records(&self) -> Vec<Branch> {
        let mut records: Vec<Branch> = self.branches.values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        records
    }

    // -----------------------------------------------------------------------
    // Validation helpers
    // -----------------------------------------------------------------------

    /// Trim and check a branch name. `except` excludes one branch from the
    /// uniqueness check (for renames).
    fn validate_name(&self, name: &str, except: Option<&str>) -> LineageResult<String> {
        let name = name.trim();
        if name.is_empty() {
            return Err(LineageError::Validation(
                "branch name must not be blank".to_string(),
            ));
        }
        if let Some(existing) = self.find_by_name(name) {
            if Some(existing.id.as_str()) != except {
                return Err(LineageError::Conflict(format!(
                    "a branch named '{}' already exists",
                    existing.name
                )));
            }
        }
        Ok(name.to_string())
    }

    fn ensure_removable(&self, branch: &Branch, action: &str) -> LineageResult<()> {
        if self.is_protected(&branch.name) {
            return Err(LineageError::Conflict(format!(
                "branch '{}' is protected and cannot be {}",
                branch.name, action
            )));
        }
        if self.active_branch_id.as_deref() == Some(branch.id.as_str()) {
            return Err(LineageError::Conflict(format!(
                "branch '{}' is the active branch and cannot be {}",
                branch.name, action
            )));
        }
        Ok(())
    }

    /// Which branch a new version with `parent` should be recorded on.
    ///
    /// A requested branch must exist, must not be retired and must already
    /// contain the parent. Without a request the active branch is used when
    /// it contains the parent; otherwise the version is untracked.
    pub fn resolve_tracking(
        &self,
        parent: Option<&str>,
        requested: Option<&str>,
    ) -> LineageResult<Option<BranchId>> {
        match requested {
            Some(name) => {
                let branch = self.find_by_name(name).ok_or_else(|| LineageError::NotFound {
                    entity: "Branch",
                    id: name.to_string(),
                })?;
                if branch.is_retired() {
                    return Err(LineageError::Conflict(format!(
                        "branch '{}' is retired",
                        branch.name
                    )));
                }
                match parent {
                    Some(parent_id) if branch.contains(parent_id) => Ok(Some(branch.id.clone())),
                    _ => Err(LineageError::Validation(format!(
                        "parent version is not on branch '{}'",
                        branch.name
                    ))),
                }
            }
            None => Ok(parent.and_then(|parent_id| {
                self.active()
                    .filter(|b| !b.is_retired() && b.contains(parent_id))
                    .map(|b| b.id.clone())
            })),
        }
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    fn activate(&mut self, id: &str) {
        self.active_branch_id = Some(id.to_string());
        self.sync_active_flags();
    }

    fn sync_active_flags(&mut self) {
        let active = self.active_branch_id.clone();
        for branch in self.branches.values_mut() {
            branch.is_active = active.as_deref() == Some(branch.id.as_str());
        }
    }

    /// Create a branch headed at `source_version_id` and make it active.
    pub fn create(
        &mut self,
        name: &str,
        source_version_id: &str,
        versions: &VersionStore,
    ) -> LineageResult<BranchId> {
        let name = self.validate_name(name, None)?;
        let source = versions.get(source_version_id).ok_or_else(|| {
            LineageError::Conflict(format!(
                "source version {} does not exist",
                source_version_id
            ))
        })?;

        let branch = Branch::new(
            name.clone(),
            source.root_version_id.clone(),
            source.id.clone(),
        );
        let id = branch.id.clone();
        self.branches.insert(id.clone(), branch);
        self.activate(&id);

        info!(branch_id = %id, name = %name, source = %source_version_id, "branch created");
        Ok(id)
    }

    /// Rename a branch. Returns the previous name.
    pub fn rename(&mut self, id: &str, new_name: &str) -> LineageResult<String> {
        let branch = self.require(id)?;
        if self.is_protected(&branch.name) {
            return Err(LineageError::Conflict(format!(
                "branch '{}' is protected and cannot be renamed",
                branch.name
            )));
        }
        let new_name = self.validate_name(new_name, Some(id))?;

        let branch = self
            .branches
            .get_mut(id)
            .ok_or_else(|| LineageError::branch_not_found(id))?;
        let old_name = std::mem::take(&mut branch.name);
        branch.rename(new_name.clone());

        info!(branch_id = %id, from = %old_name, to = %new_name, "branch renamed");
        Ok(old_name)
    }

    /// Delete a branch. Protected and active branches are refused.
    pub fn delete(&mut self, id: &str) -> LineageResult<Branch> {
        let branch = self.require(id)?;
        self.ensure_removable(branch, "deleted")?;
        let removed = self
            .branches
            .remove(id)
            .ok_or_else(|| LineageError::branch_not_found(id))?;
        info!(branch_id = %id, name = %removed.name, "branch deleted");
        Ok(removed)
    }

    /// Move the active-branch pointer. No version is touched.
    pub fn switch(&mut self, id: &str) -> LineageResult<()> {
        let branch = self.require(id)?;
        if branch.is_retired() {
            return Err(LineageError::Conflict(format!(
                "branch '{}' is retired",
                branch.name
            )));
        }
        self.activate(id);
        info!(branch_id = %id, "switched branch");
        Ok(())
    }

    /// Retire a branch in place of merging it. Idempotent.
    pub fn retire(&mut self, id: &str) -> LineageResult<()> {
        let branch = self.require(id)?;
        if branch.is_retired() {
            return Ok(());
        }
        self.ensure_removable(branch, "retired")?;
        if let Some(branch) = self.branches.get_mut(id) {
            let now = Utc::now();
            branch.retired_at = Some(now);
            branch.updated_at = now;
        }
        info!(branch_id = %id, "branch retired");
        Ok(())
    }

    /// Branch merging is not supported; branches are retired instead.
    /// Returns the rejection to report.
    pub fn merge(&self, source_id: &str, target_id: &str) -> LineageError {
        warn!(source = %source_id, target = %target_id, "merge requested but not supported");
        LineageError::UnsupportedOperation(
            "branch merging is not implemented; retire the source branch instead".to_string(),
        )
    }

    /// Differences between two branch heads, read as merge conflicts.
    /// Advisory only: nothing is mutated.
    pub fn detect_conflicts(
        &self,
        source_id: &str,
        target_id: &str,
        versions: &VersionStore,
    ) -> LineageResult<Vec<Difference>> {
        let source = self.require(source_id)?;
        let target = self.require(target_id)?;
        let source_head = versions.require(&source.head_version_id)?;
        let target_head = versions.require(&target.head_version_id)?;
        Ok(find_conflicts(source_head, target_head))
    }

    /// Record `version_id` on a branch and move its head there.
    pub(crate) fn advance(&mut self, branch_id: &str, version_id: VersionId) -> LineageResult<()> {
        let branch = self
            .branches
            .get_mut(branch_id)
            .ok_or_else(|| LineageError::branch_not_found(branch_id))?;
        branch.advance_head(version_id);
        Ok(())
    }

    /// Drop a deleted version from every branch membership list. Heads are
    /// guarded by the caller before the version is deleted.
    pub(crate) fn forget_version(&mut self, version_id: &str) {
        for branch in self.branches.values_mut() {
            branch.version_ids.retain(|v| v != version_id);
        }
    }
}
