use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{LineageError, LineageResult};
use crate::model::branch::{name_key, Branch, BranchId};
use crate::model::version::{ImageVersion, VersionId};
use crate::store::branches::BranchManager;
use crate::store::integrity::check_integrity;
use crate::store::versions::VersionStore;

/// Bumped whenever the persisted layout changes incompatibly.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Persisted shape
// ---------------------------------------------------------------------------

/// Flat keyed collections of versions and branches. Trees, comparisons and
/// statistics are derived on demand and never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub format_version: u32,
    pub exported_at: DateTime<Utc>,
    pub versions: BTreeMap<VersionId, ImageVersion>,
    pub branches: BTreeMap<BranchId, Branch>,
    pub active_branch_id: Option<BranchId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Json,
    /// `bincode`, for compact machine-to-machine transfer.
    Binary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportOptions {
    pub format: ExportFormat,
    /// Restrict the export to one image's lineage.
    pub root_version_id: Option<VersionId>,
    pub include_branches: bool,
    /// Indent JSON output. Ignored for binary.
    pub pretty: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            format: ExportFormat::Json,
            root_version_id: None,
            include_branches: true,
            pretty: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportMode {
    /// Discard the current state.
    #[default]
    Replace,
    /// Add to the current state; any id or branch-name clash rejects the import.
    Merge,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ImportOptions {
    pub format: ExportFormat,
    pub mode: ImportMode,
}

impl Snapshot {
    /// Capture the given state, optionally narrowed to one lineage.
    pub fn capture(
        versions: &VersionStore,
        branches: &BranchManager,
        options: &ExportOptions,
    ) -> LineageResult<Self> {
        let (records, branch_records): (Vec<ImageVersion>, Vec<Branch>) =
            match &options.root_version_id {
                Some(root_id) => {
                    let root = versions.require(root_id)?;
                    if !root.is_root() {
                        return Err(LineageError::Validation(format!(
                            "{} is not a root version",
                            root_id
                        )));
                    }
                    (
                        versions.lineage_members(root_id).into_iter().cloned().collect(),
                        branches.for_root(root_id).into_iter().cloned().collect(),
                    )
                }
                None => (versions.records(), branches.records()),
            };

        let branch_records = if options.include_branches {
            branch_records
        } else {
            Vec::new()
        };
        let active_branch_id = branches
            .active_id()
            .filter(|id| branch_records.iter().any(|b| b.id == *id))
            .map(str::to_string);

        Ok(Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            exported_at: Utc::now(),
            versions: records.into_iter().map(|v| (v.id.clone(), v)).collect(),
            branches: branch_records.into_iter().map(|b| (b.id.clone(), b)).collect(),
            active_branch_id,
        })
    }

    pub fn encode(&self, format: ExportFormat, pretty: bool) -> LineageResult<Vec<u8>> {
        let bytes = match format {
            ExportFormat::Json if pretty => serde_json::to_vec_pretty(self)?,
            ExportFormat::Json => serde_json::to_vec(self)?,
            ExportFormat::Binary => bincode::serialize(self)?,
        };
        debug!(?format, bytes = bytes.len(), "snapshot encoded");
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8], format: ExportFormat) -> LineageResult<Self> {
        let decoded: LineageResult<Snapshot> = match format {
            ExportFormat::Json => serde_json::from_slice(bytes).map_err(LineageError::from),
            ExportFormat::Binary => bincode::deserialize(bytes).map_err(LineageError::from),
        };
        let snapshot: Snapshot = decoded
            .map_err(|err| LineageError::Validation(format!("undecodable snapshot: {err}")))?;
        if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(LineageError::Validation(format!(
                "unsupported snapshot format version {} (expected {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }
        Ok(snapshot)
    }

    /// Materialise the snapshot, rejecting it if any structural invariant
    /// fails.
    pub fn into_state(self, protected_names: Vec<String>) -> LineageResult<(VersionStore, BranchManager)> {
        self.check_keys()?;
        if let Some(active) = &self.active_branch_id {
            if !self.branches.contains_key(active) {
                return Err(LineageError::Validation(format!(
                    "active branch {} is not part of the snapshot",
                    active
                )));
            }
        }

        let versions = VersionStore::from_records(self.versions.into_values());
        let branches = BranchManager::from_records(
            self.branches.into_values(),
            self.active_branch_id,
            protected_names,
        );

        let issues = check_integrity(&versions, &branches);
        if let Some(first) = issues.first() {
            warn!(count = issues.len(), "snapshot failed integrity check");
            return Err(LineageError::Validation(format!(
                "snapshot has {} integrity issue(s), first: {}",
                issues.len(),
                first
            )));
        }
        Ok((versions, branches))
    }

    /// Check that every map key matches the record's own id.
    fn check_keys(&self) -> LineageResult<()> {
        if let Some((key, v)) = self.versions.iter().find(|(k, v)| **k != v.id) {
            return Err(LineageError::Validation(format!(
                "version keyed {} carries id {}",
                key, v.id
            )));
        }
        if let Some((key, b)) = self.branches.iter().find(|(k, b)| **k != b.id) {
            return Err(LineageError::Validation(format!(
                "branch keyed {} carries id {}",
                key, b.id
            )));
        }
        Ok(())
    }

    /// Reject a merge that would overwrite or shadow existing records.
    pub fn check_merge(&self, versions: &VersionStore, branches: &BranchManager) -> LineageResult<()> {
        if let Some(id) = self.versions.keys().find(|id| versions.contains(id)) {
            return Err(LineageError::Conflict(format!("version {} already exists", id)));
        }
        if let Some(id) = self.branches.keys().find(|id| branches.get(id).is_some()) {
            return Err(LineageError::Conflict(format!("branch {} already exists", id)));
        }
        let mut seen: HashSet<String> = HashSet::new();
        for branch in self.branches.values() {
            let key = name_key(&branch.name);
            if branches.find_by_name(&branch.name).is_some() || !seen.insert(key) {
                return Err(LineageError::Conflict(format!(
                    "a branch named '{}' already exists",
                    branch.name
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SnapshotStore: where snapshots live between runs
// ---------------------------------------------------------------------------

/// Persistence adapter. The engine never calls this itself; callers load a
/// snapshot, hand it over, and save what they get back.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// `None` when nothing has been saved yet.
    async fn load(&self) -> LineageResult<Option<Snapshot>>;

    async fn save(&self, snapshot: &Snapshot) -> LineageResult<()>;
}

/// Pretty-printed JSON file, replaced atomically on save.
#[derive(Debug, Clone)]
pub struct JsonFileSnapshotStore {
    path: PathBuf,
}

impl JsonFileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl SnapshotStore for JsonFileSnapshotStore {
    async fn load(&self) -> LineageResult<Option<Snapshot>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no snapshot file yet");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        let snapshot = Snapshot::decode(&bytes, ExportFormat::Json)?;
        info!(
            path = %self.path.display(),
            versions = snapshot.versions.len(),
            branches = snapshot.branches.len(),
            "snapshot loaded"
        );
        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &Snapshot) -> LineageResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = snapshot.encode(ExportFormat::Json, true)?;
        let staging = self.staging_path();
        tokio::fs::write(&staging, &bytes).await?;
        tokio::fs::rename(&staging, &self.path).await?;
        info!(path = %self.path.display(), bytes = bytes.len(), "snapshot saved");
        Ok(())
    }
}

/// Keeps the last saved snapshot in memory. Used in tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    slot: RwLock<Option<Snapshot>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn load(&self) -> LineageResult<Option<Snapshot>> {
        Ok(self.slot.read().await.clone())
    }

    async fn save(&self, snapshot: &Snapshot) -> LineageResult<()> {
        *self.slot.write().await = Some(snapshot.clone());
        Ok(())
    }
}
