use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::{AppConfig, EngineConfig};
use crate::error::{LineageError, LineageResult, OperationResult};
use crate::model::branch::{name_key, Branch};
use crate::model::comparison::{Comparison, ComparisonType, Difference};
use crate::model::version::{ImageVersion, NewVersion, UsageKind, VersionId, VersionPatch};
use crate::query::comparison::ComparisonEngine;
use crate::query::history::{
    compute_statistics, scoped_versions, version_history, Statistics, StatisticsScope,
    VersionHistory,
};
use crate::query::tree::{build_version_tree, VersionTree};
use crate::store::branches::BranchManager;
use crate::store::events::{EventBus, StoreEvent};
use crate::store::integrity::{check_integrity, IntegrityIssue};
use crate::store::snapshot::{ExportOptions, ImportMode, ImportOptions, Snapshot};
use crate::store::versions::VersionStore;

// ---------------------------------------------------------------------------
// Engine: the operation surface collaborators talk to
// ---------------------------------------------------------------------------

/// Single-writer facade over the version and branch stores.
///
/// Mutations return an [`OperationResult`] instead of an error: every
/// expected failure is reported as data and a rejected call performs no
/// writes. Reads return `LineageResult` and never mutate.
#[derive(Debug)]
pub struct Engine {
    versions: VersionStore,
    branches: BranchManager,
    comparison: ComparisonEngine,
    config: EngineConfig,
    events: EventBus,
}

impl Engine {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            versions: VersionStore::new(),
            branches: BranchManager::new(config.engine.protected_branches.clone()),
            comparison: ComparisonEngine::new(config.similarity.clone()),
            config: config.engine.clone(),
            events: EventBus::default(),
        }
    }

    /// Rebuild an engine from a persisted snapshot. The snapshot must pass
    /// the integrity check.
    pub fn from_snapshot(config: &AppConfig, snapshot: Snapshot) -> LineageResult<Self> {
        let (versions, branches) =
            snapshot.into_state(config.engine.protected_branches.clone())?;
        info!(
            versions = versions.len(),
            branches = branches.len(),
            "engine restored from snapshot"
        );
        Ok(Self {
            versions,
            branches,
            comparison: ComparisonEngine::new(config.similarity.clone()),
            config: config.engine.clone(),
            events: EventBus::default(),
        })
    }

    /// Full state, ready to hand to a [`crate::store::snapshot::SnapshotStore`].
    pub fn snapshot(&self) -> LineageResult<Snapshot> {
        Snapshot::capture(&self.versions, &self.branches, &ExportOptions::default())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn versions(&self) -> &VersionStore {
        &self.versions
    }

    pub fn branches(&self) -> &BranchManager {
        &self.branches
    }

    pub fn version(&self, id: &str) -> Option<&ImageVersion> {
        self.versions.get(id)
    }

    pub fn branch(&self, id: &str) -> Option<&Branch> {
        self.branches.get(id)
    }

    pub fn active_branch(&self) -> Option<&Branch> {
        self.branches.active()
    }

    fn settle(operation: &str, outcome: LineageResult<OperationResult>) -> OperationResult {
        match outcome {
            Ok(result) => result,
            Err(err) => {
                warn!(operation = %operation, code = %err.code(), error = %err, "operation rejected");
                OperationResult::failed(&err)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Versions
    // -----------------------------------------------------------------------

    /// Create a root or child version.
    ///
    /// A child is recorded on `branch_name` (or the active branch) when its
    /// parent is already on that branch. The first root version bootstraps
    /// the default branch.
    pub fn create_version(&mut self, data: NewVersion) -> OperationResult {
        let outcome = self.try_create_version(data);
        Self::settle("create_version", outcome)
    }

    fn try_create_version(&mut self, data: NewVersion) -> LineageResult<OperationResult> {
        self.versions.validate_new(&data)?;

        let parent = data.parent_version_id.clone();
        let bootstrap = parent.is_none()
            && self.config.auto_create_default_branch
            && self.branches.is_empty()
            && !self.config.default_branch.trim().is_empty();
        let tracking = match &parent {
            Some(parent_id) => self
                .branches
                .resolve_tracking(Some(parent_id), data.branch_name.as_deref())?,
            None => {
                if let Some(requested) = data.branch_name.as_deref() {
                    let is_default = name_key(requested) == name_key(&self.config.default_branch);
                    if !(bootstrap && is_default) {
                        return Err(self.root_label_error(requested));
                    }
                }
                None
            }
        };

        let id = self.versions.create(data)?;

        let branch_id = if let Some(branch_id) = tracking {
            self.branches.advance(&branch_id, id.clone())?;
            let name = self.branches.require(&branch_id)?.name.clone();
            self.versions.set_branch_name(&id, Some(name));
            Some(branch_id)
        } else if bootstrap {
            let name = self.config.default_branch.trim().to_string();
            let branch_id = self.branches.create(&name, &id, &self.versions)?;
            self.versions.set_branch_name(&id, Some(name.clone()));
            self.events.publish(StoreEvent::BranchCreated {
                branch_id: branch_id.clone(),
                name,
            });
            Some(branch_id)
        } else {
            None
        };

        self.events.publish(StoreEvent::VersionCreated {
            version_id: id.clone(),
            branch_id: branch_id.clone(),
        });

        let result = OperationResult::ok("Version created").with_version(id);
        Ok(match branch_id {
            Some(branch_id) => result.with_branch(branch_id),
            None => result,
        })
    }

    /// A new root belongs to no branch yet; only the bootstrap may label it.
    fn root_label_error(&self, requested: &str) -> LineageError {
        match self.branches.find_by_name(requested) {
            Some(branch) => LineageError::Validation(format!(
                "a root version cannot join existing branch '{}'",
                branch.name
            )),
            None => LineageError::NotFound {
                entity: "Branch",
                id: requested.to_string(),
            },
        }
    }

    pub fn update_version(&mut self, id: &str, patch: VersionPatch) -> OperationResult {
        let outcome = self.versions.update(id, patch).map(|()| {
            self.events.publish(StoreEvent::VersionUpdated {
                version_id: id.to_string(),
            });
            OperationResult::ok("Version updated").with_version(id)
        });
        Self::settle("update_version", outcome)
    }

    /// Delete a leaf version that no branch is headed at.
    pub fn delete_version(&mut self, id: &str) -> OperationResult {
        let outcome = self.try_delete_version(id);
        Self::settle("delete_version", outcome)
    }

    fn try_delete_version(&mut self, id: &str) -> LineageResult<OperationResult> {
        self.versions.validate_delete(id)?;
        if let Some(branch) = self.branches.heads_at(id).first() {
            return Err(LineageError::Conflict(format!(
                "version {} is the head of branch '{}'",
                id, branch.name
            )));
        }

        self.versions.delete(id)?;
        self.branches.forget_version(id);
        self.events.publish(StoreEvent::VersionDeleted {
            version_id: id.to_string(),
        });
        Ok(OperationResult::ok("Version deleted").with_version(id))
    }

    pub fn duplicate_version(&mut self, id: &str) -> OperationResult {
        let outcome = self.versions.duplicate(id).map(|copy_id| {
            self.events.publish(StoreEvent::VersionDuplicated {
                source_id: id.to_string(),
                version_id: copy_id.clone(),
            });
            OperationResult::ok("Version duplicated").with_version(copy_id)
        });
        Self::settle("duplicate_version", outcome)
    }

    pub fn record_usage(&mut self, id: &str, kind: UsageKind) -> OperationResult {
        let outcome = self.versions.record_usage(id, kind).map(|count| {
            self.events.publish(StoreEvent::UsageRecorded {
                version_id: id.to_string(),
                kind,
            });
            OperationResult::ok(format!("{:?} count is now {}", kind, count)).with_version(id)
        });
        Self::settle("record_usage", outcome)
    }

    // -----------------------------------------------------------------------
    // Branches
    // -----------------------------------------------------------------------

    /// Create a branch headed at `source_version_id` and check it out.
    pub fn create_branch(&mut self, name: &str, source_version_id: &str) -> OperationResult {
        let outcome = self
            .branches
            .create(name, source_version_id, &self.versions)
            .map(|branch_id| {
                self.events.publish(StoreEvent::BranchCreated {
                    branch_id: branch_id.clone(),
                    name: name.trim().to_string(),
                });
                OperationResult::ok("Branch created")
                    .with_branch(branch_id)
                    .with_version(source_version_id)
            });
        Self::settle("create_branch", outcome)
    }

    pub fn rename_branch(&mut self, id: &str, new_name: &str) -> OperationResult {
        let outcome = self.try_rename_branch(id, new_name);
        Self::settle("rename_branch", outcome)
    }

    fn try_rename_branch(&mut self, id: &str, new_name: &str) -> LineageResult<OperationResult> {
        let old_name = self.branches.rename(id, new_name)?;
        let new_name = self.branches.require(id)?.name.clone();
        self.versions.rename_branch_refs(&old_name, &new_name);
        self.events.publish(StoreEvent::BranchRenamed {
            branch_id: id.to_string(),
            from: old_name,
            to: new_name,
        });
        Ok(OperationResult::ok("Branch renamed").with_branch(id))
    }

    /// Delete a branch. Its versions stay; their branch label is cleared.
    pub fn delete_branch(&mut self, id: &str) -> OperationResult {
        let outcome = self.branches.delete(id).map(|removed| {
            for version_id in &removed.version_ids {
                let labelled = self
                    .versions
                    .get(version_id)
                    .is_some_and(|v| v.branch_name.as_deref() == Some(removed.name.as_str()));
                if labelled {
                    self.versions.set_branch_name(version_id, None);
                }
            }
            self.events.publish(StoreEvent::BranchDeleted {
                branch_id: id.to_string(),
            });
            OperationResult::ok("Branch deleted").with_branch(id)
        });
        Self::settle("delete_branch", outcome)
    }

    pub fn switch_branch(&mut self, id: &str) -> OperationResult {
        let outcome = self.branches.switch(id).map(|()| {
            self.events.publish(StoreEvent::BranchSwitched {
                branch_id: id.to_string(),
            });
            OperationResult::ok("Switched branch").with_branch(id)
        });
        Self::settle("switch_branch", outcome)
    }

    pub fn retire_branch(&mut self, id: &str) -> OperationResult {
        let outcome = self.branches.retire(id).map(|()| {
            self.events.publish(StoreEvent::BranchRetired {
                branch_id: id.to_string(),
            });
            OperationResult::ok("Branch retired").with_branch(id)
        });
        Self::settle("retire_branch", outcome)
    }

    /// Always fails with `UnsupportedOperationError`.
    pub fn merge_branch(&mut self, source_id: &str, target_id: &str) -> OperationResult {
        let err = self.branches.merge(source_id, target_id);
        Self::settle("merge_branch", Err(err))
    }

    pub fn detect_conflicts(
        &self,
        source_id: &str,
        target_id: &str,
    ) -> LineageResult<Vec<Difference>> {
        self.branches
            .detect_conflicts(source_id, target_id, &self.versions)
    }

    // -----------------------------------------------------------------------
    // Read side
    // -----------------------------------------------------------------------

    pub fn compare_versions(&self, id_a: &str, id_b: &str) -> LineageResult<Comparison> {
        let a = self.versions.require(id_a)?;
        let b = self.versions.require(id_b)?;
        Ok(self.comparison.compare(a, b, ComparisonType::Manual))
    }

    pub fn calculate_similarity(&self, id_a: &str, id_b: &str) -> LineageResult<f64> {
        let a = self.versions.require(id_a)?;
        let b = self.versions.require(id_b)?;
        Ok(self.comparison.calculate_similarity(a, b))
    }

    /// `max_depth` falls back to the configured default; `None` is unbounded.
    pub fn build_version_tree(
        &self,
        root_version_id: &str,
        max_depth: Option<usize>,
    ) -> LineageResult<VersionTree> {
        build_version_tree(
            &self.versions,
            &self.branches,
            root_version_id,
            max_depth.or(self.config.default_tree_depth),
        )
    }

    pub fn get_statistics(&self, scope: &StatisticsScope) -> LineageResult<Statistics> {
        let members = scoped_versions(&self.versions, scope)?;
        Ok(compute_statistics(&members, Utc::now(), self.config.top_n))
    }

    pub fn get_version_history(&self, root_version_id: &str) -> LineageResult<VersionHistory> {
        version_history(
            &self.versions,
            &self.branches,
            root_version_id,
            Utc::now(),
            self.config.top_n,
        )
    }

    /// Ancestor path of `id`, root first.
    pub fn lineage(&self, id: &str) -> LineageResult<Vec<VersionId>> {
        self.versions.ancestry(id)
    }

    pub fn check_integrity(&self) -> Vec<IntegrityIssue> {
        check_integrity(&self.versions, &self.branches)
    }

    // -----------------------------------------------------------------------
    // Export / import
    // -----------------------------------------------------------------------

    pub fn export_versions(&self, options: &ExportOptions) -> LineageResult<Vec<u8>> {
        let snapshot = Snapshot::capture(&self.versions, &self.branches, options)?;
        let bytes = snapshot.encode(options.format, options.pretty)?;
        info!(
            versions = snapshot.versions.len(),
            branches = snapshot.branches.len(),
            format = ?options.format,
            "versions exported"
        );
        Ok(bytes)
    }

    pub fn import_versions(&mut self, bytes: &[u8], options: ImportOptions) -> OperationResult {
        let outcome = self.try_import_versions(bytes, options);
        Self::settle("import_versions", outcome)
    }

    fn try_import_versions(
        &mut self,
        bytes: &[u8],
        options: ImportOptions,
    ) -> LineageResult<OperationResult> {
        let snapshot = Snapshot::decode(bytes, options.format)?;
        let (version_count, branch_count) = (snapshot.versions.len(), snapshot.branches.len());
        let protected = self.config.protected_branches.clone();

        match options.mode {
            ImportMode::Replace => {
                let (versions, branches) = snapshot.into_state(protected)?;
                self.versions = versions;
                self.branches = branches;
            }
            ImportMode::Merge => {
                snapshot.check_merge(&self.versions, &self.branches)?;
                let (versions, branches) = snapshot.into_state(protected)?;
                self.versions.extend(versions.records());
                self.branches.extend(branches.records());
            }
        }

        info!(versions = version_count, branches = branch_count, mode = ?options.mode, "versions imported");
        self.events.publish(StoreEvent::SnapshotImported {
            versions: version_count,
            branches: branch_count,
        });
        Ok(OperationResult::ok(format!(
            "Imported {} version(s) and {} branch(es)",
            version_count, branch_count
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::store::snapshot::ExportFormat;

    fn engine() -> Engine {
        Engine::new(&AppConfig::default())
    }

    fn created(result: &OperationResult) -> VersionId {
        assert!(result.success, "{}", result.message);
        result.version_id.clone().unwrap()
    }

    #[test]
    fn test_first_root_bootstraps_main() {
        let mut engine = engine();
        let result = engine.create_version(NewVersion::root("a cat"));
        let root = created(&result);

        let main = engine.active_branch().unwrap();
        assert_eq!(main.name, "main");
        assert_eq!(main.head_version_id, root);
        assert_eq!(result.branch_id.as_deref(), Some(main.id.as_str()));
        assert_eq!(engine.version(&root).unwrap().branch_name.as_deref(), Some("main"));

        // Only the first root.
        let second = created(&engine.create_version(NewVersion::root("a dog")));
        assert_eq!(engine.branches().len(), 1);
        assert!(engine.version(&second).unwrap().branch_name.is_none());
    }

    #[test]
    fn test_children_advance_active_branch() {
        let mut engine = engine();
        let root = created(&engine.create_version(NewVersion::root("a cat")));
        let child = created(&engine.create_version(NewVersion::child_of(&root, "a cat, detailed")));

        let main = engine.active_branch().unwrap();
        assert_eq!(main.head_version_id, child);
        assert_eq!(main.version_ids, vec![root.clone(), child.clone()]);

        // Any member can be extended; the head follows.
        let side = created(&engine.create_version(NewVersion::child_of(&root, "a cat, sketch")));
        assert_eq!(engine.active_branch().unwrap().head_version_id, side);
    }

    #[test]
    fn test_unknown_branch_name_rejected_without_writes() {
        let mut engine = engine();
        let root = created(&engine.create_version(NewVersion::root("a cat")));
        let result =
            engine.create_version(NewVersion::child_of(&root, "x").with_branch("nowhere"));
        assert_eq!(result.error_code(), Some(ErrorCode::NotFoundError));
        assert_eq!(engine.versions().len(), 1);
    }

    #[test]
    fn test_root_branch_labels_are_checked() {
        let mut engine = engine();
        let first = engine.create_version(NewVersion::root("a cat").with_branch("ghost"));
        assert_eq!(first.error_code(), Some(ErrorCode::NotFoundError));
        assert!(engine.versions().is_empty());
        assert!(engine.branches().is_empty());

        // The bootstrap label is accepted, in any case.
        let root = created(&engine.create_version(NewVersion::root("a cat").with_branch("MAIN")));
        assert_eq!(engine.version(&root).unwrap().branch_name.as_deref(), Some("main"));

        let result = engine.create_version(NewVersion::root("a dog").with_branch("ghost"));
        assert_eq!(result.error_code(), Some(ErrorCode::NotFoundError));
        let result = engine.create_version(NewVersion::root("a dog").with_branch("main"));
        assert_eq!(result.error_code(), Some(ErrorCode::ValidationError));
        assert_eq!(engine.versions().len(), 1);
        assert!(engine.check_integrity().is_empty());
    }

    #[test]
    fn test_invalid_parent_is_validation_error() {
        let mut engine = engine();
        let result = engine.create_version(NewVersion::child_of("v-missing", "x"));
        assert_eq!(result.error_code(), Some(ErrorCode::ValidationError));
        assert!(engine.versions().is_empty());
        assert!(engine.branches().is_empty());
    }

    #[test]
    fn test_branch_head_cannot_be_deleted() {
        let mut engine = engine();
        let root = created(&engine.create_version(NewVersion::root("a cat")));
        let child = created(&engine.create_version(NewVersion::child_of(&root, "b")));

        let result = engine.delete_version(&child);
        assert_eq!(result.error_code(), Some(ErrorCode::ConflictError));

        let other = created(&engine.create_version(NewVersion::root("dog")));
        let result = engine.delete_version(&other);
        assert!(result.success);
        assert!(engine.version(&other).is_none());
    }

    #[test]
    fn test_rename_updates_version_labels() {
        let mut engine = engine();
        let root = created(&engine.create_version(NewVersion::root("a cat")));
        let feature = engine.create_branch("feature", &root).branch_id.unwrap();
        let v = created(&engine.create_version(NewVersion::child_of(&root, "x")));
        assert_eq!(engine.version(&v).unwrap().branch_name.as_deref(), Some("feature"));

        assert!(engine.rename_branch(&feature, "experiment").success);
        assert_eq!(engine.version(&v).unwrap().branch_name.as_deref(), Some("experiment"));

        let main = engine.branches().find_by_name("main").unwrap().id.clone();
        let result = engine.rename_branch(&main, "trunk");
        assert_eq!(result.error_code(), Some(ErrorCode::ConflictError));
    }

    #[test]
    fn test_delete_branch_clears_labels() {
        let mut engine = engine();
        let root = created(&engine.create_version(NewVersion::root("a cat")));
        let main = engine.active_branch().unwrap().id.clone();
        let feature = engine.create_branch("feature", &root).branch_id.unwrap();
        let v = created(&engine.create_version(NewVersion::child_of(&root, "x")));

        assert!(engine.switch_branch(&main).success);
        assert!(engine.delete_branch(&feature).success);
        assert!(engine.version(&v).unwrap().branch_name.is_none());
        assert!(engine.check_integrity().is_empty());
    }

    #[test]
    fn test_retired_branch_stops_tracking() {
        let mut engine = engine();
        let root = created(&engine.create_version(NewVersion::root("a cat")));
        let main = engine.active_branch().unwrap().id.clone();
        let feature = engine.create_branch("feature", &root).branch_id.unwrap();
        engine.switch_branch(&main);
        assert!(engine.retire_branch(&feature).success);

        let result =
            engine.create_version(NewVersion::child_of(&root, "x").with_branch("feature"));
        assert_eq!(result.error_code(), Some(ErrorCode::ConflictError));
        assert_eq!(
            engine.switch_branch(&feature).error_code(),
            Some(ErrorCode::ConflictError)
        );
        assert!(engine.branch(&feature).unwrap().is_retired());
        assert!(!engine.branch(&main).unwrap().is_retired());
    }

    #[test]
    fn test_replace_import_restores_state() {
        let mut source = engine();
        let root = created(&source.create_version(NewVersion::root("a cat")));
        created(&source.create_version(NewVersion::child_of(&root, "a cat, detailed")));
        let bytes = source
            .export_versions(&ExportOptions {
                format: ExportFormat::Binary,
                ..Default::default()
            })
            .unwrap();

        let mut target = engine();
        let result = target.import_versions(
            &bytes,
            ImportOptions {
                format: ExportFormat::Binary,
                mode: ImportMode::Replace,
            },
        );
        assert!(result.success, "{}", result.message);
        assert_eq!(target.versions().len(), 2);
        assert_eq!(target.active_branch().unwrap().name, "main");
    }

    #[test]
    fn test_merge_import_rejects_clash_without_writes() {
        let mut engine = engine();
        created(&engine.create_version(NewVersion::root("a cat")));
        let bytes = engine.export_versions(&ExportOptions::default()).unwrap();

        let result = engine.import_versions(
            &bytes,
            ImportOptions {
                format: ExportFormat::Json,
                mode: ImportMode::Merge,
            },
        );
        assert_eq!(result.error_code(), Some(ErrorCode::ConflictError));
        assert_eq!(engine.versions().len(), 1);
    }

    #[test]
    fn test_merge_import_adds_lineage() {
        let mut first = engine();
        created(&first.create_version(NewVersion::root("a cat")));

        let mut second = engine();
        let dog = created(&second.create_version(NewVersion::root("a dog")));
        let bytes = second
            .export_versions(&ExportOptions {
                include_branches: false,
                ..Default::default()
            })
            .unwrap();

        let result = first.import_versions(
            &bytes,
            ImportOptions {
                format: ExportFormat::Json,
                mode: ImportMode::Merge,
            },
        );
        assert!(result.success, "{}", result.message);
        assert!(first.version(&dog).is_some());
        assert_eq!(first.versions().roots().len(), 2);
        assert!(first.check_integrity().is_empty());
    }

    #[tokio::test]
    async fn test_events_follow_mutations() {
        let mut engine = engine();
        let mut rx = engine.subscribe();

        let root = created(&engine.create_version(NewVersion::root("a cat")));
        engine.record_usage(&root, UsageKind::View);
        // Rejected calls publish nothing.
        engine.delete_version("v-missing");

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        assert!(matches!(seen[0], StoreEvent::BranchCreated { .. }));
        assert!(
            matches!(&seen[1], StoreEvent::VersionCreated { version_id, branch_id: Some(_) } if *version_id == root)
        );
        assert_eq!(
            seen[2],
            StoreEvent::UsageRecorded {
                version_id: root,
                kind: UsageKind::View
            }
        );
        assert_eq!(seen.len(), 3);
    }
}
