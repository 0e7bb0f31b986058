use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::model::branch::{name_key, BranchId};
use crate::model::version::VersionId;
use crate::store::branches::BranchManager;
use crate::store::versions::VersionStore;

/// A structural invariant that does not hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityIssue {
    /// `parent_version_id` points at a version that does not exist.
    MissingParent { version_id: VersionId, parent_id: VersionId },
    /// The parent exists but does not list this version as a child.
    UnlistedChild { parent_id: VersionId, child_id: VersionId },
    /// A `child_version_ids` entry is missing or points elsewhere.
    DanglingChild { parent_id: VersionId, child_id: VersionId },
    /// The ancestor chain ends at a root other than `root_version_id`.
    WrongRoot {
        version_id: VersionId,
        expected: VersionId,
        actual: VersionId,
    },
    /// Following parents from this version loops.
    Cycle { version_id: VersionId },
    HeadNotMember { branch_id: BranchId },
    UnknownBranchVersion { branch_id: BranchId, version_id: VersionId },
    DuplicateBranchName { name: String },
}

impl fmt::Display for IntegrityIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingParent { version_id, parent_id } => {
                write!(f, "{version_id}: parent {parent_id} does not exist")
            }
            Self::UnlistedChild { parent_id, child_id } => {
                write!(f, "{parent_id}: does not list child {child_id}")
            }
            Self::DanglingChild { parent_id, child_id } => {
                write!(f, "{parent_id}: child {child_id} is missing or has another parent")
            }
            Self::WrongRoot {
                version_id,
                expected,
                actual,
            } => write!(
                f,
                "{version_id}: root_version_id is {expected} but ancestors end at {actual}"
            ),
            Self::Cycle { version_id } => write!(f, "{version_id}: ancestor chain loops"),
            Self::HeadNotMember { branch_id } => {
                write!(f, "{branch_id}: head is not one of the branch's versions")
            }
            Self::UnknownBranchVersion {
                branch_id,
                version_id,
            } => write!(f, "{branch_id}: references unknown version {version_id}"),
            Self::DuplicateBranchName { name } => {
                write!(f, "branch name '{name}' is used more than once")
            }
        }
    }
}

/// Check every structural invariant over the given state.
pub fn check_integrity(versions: &VersionStore, branches: &BranchManager) -> Vec<IntegrityIssue> {
    let mut issues = Vec::new();
    let mut records: Vec<_> = versions.iter().collect();
    records.sort_by(|a, b| a.id.cmp(&b.id));

    for version in &records {
        // Parent/child symmetry, from both ends.
        if let Some(parent_id) = &version.parent_version_id {
            match versions.get(parent_id) {
                None => issues.push(IntegrityIssue::MissingParent {
                    version_id: version.id.clone(),
                    parent_id: parent_id.clone(),
                }),
                Some(parent) if !parent.child_version_ids.contains(&version.id) => {
                    issues.push(IntegrityIssue::UnlistedChild {
                        parent_id: parent_id.clone(),
                        child_id: version.id.clone(),
                    })
                }
                Some(_) => {}
            }
        }
        for child_id in &version.child_version_ids {
            let linked = versions
                .get(child_id)
                .is_some_and(|c| c.parent_version_id.as_deref() == Some(version.id.as_str()));
            if !linked {
                issues.push(IntegrityIssue::DanglingChild {
                    parent_id: version.id.clone(),
                    child_id: child_id.clone(),
                });
            }
        }

        // Ancestor termination at the recorded root.
        let mut seen: HashSet<&str> = HashSet::new();
        let mut current = *version;
        loop {
            if !seen.insert(current.id.as_str()) {
                issues.push(IntegrityIssue::Cycle {
                    version_id: version.id.clone(),
                });
                break;
            }
            match current.parent_version_id.as_deref().map(|p| versions.get(p)) {
                Some(Some(parent)) => current = parent,
                // Reported above as MissingParent on the version that dangles.
                Some(None) => break,
                None => {
                    if current.id != version.root_version_id {
                        issues.push(IntegrityIssue::WrongRoot {
                            version_id: version.id.clone(),
                            expected: version.root_version_id.clone(),
                            actual: current.id.clone(),
                        });
                    }
                    break;
                }
            }
        }
    }

    let mut names: HashMap<String, usize> = HashMap::new();
    for branch in branches.records() {
        if !branch.contains(&branch.head_version_id) {
            issues.push(IntegrityIssue::HeadNotMember {
                branch_id: branch.id.clone(),
            });
        }
        for version_id in &branch.version_ids {
            if !versions.contains(version_id) {
                issues.push(IntegrityIssue::UnknownBranchVersion {
                    branch_id: branch.id.clone(),
                    version_id: version_id.clone(),
                });
            }
        }
        *names.entry(name_key(&branch.name)).or_default() += 1;
    }
    let mut duplicated: Vec<String> = names
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(name, _)| name)
        .collect();
    duplicated.sort();
    issues.extend(
        duplicated
            .into_iter()
            .map(|name| IntegrityIssue::DuplicateBranchName { name }),
    );

    issues
}
