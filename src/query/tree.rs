use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt::Write;
use tracing::{debug, warn};

use crate::error::{LineageError, LineageResult};
use crate::model::branch::Branch;
use crate::model::version::{ImageVersion, VersionId, VersionStatus, VersionType};
use crate::store::branches::BranchManager;
use crate::store::versions::VersionStore;

// ---------------------------------------------------------------------------
// Tree projection of a lineage
// ---------------------------------------------------------------------------

/// Branch annotation on a node that some branch is headed at.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchTag {
    pub id: String,
    pub name: String,
    pub color: String,
    pub is_active: bool,
}

impl From<&Branch> for BranchTag {
    fn from(branch: &Branch) -> Self {
        Self {
            id: branch.id.clone(),
            name: branch.name.clone(),
            color: branch.color.clone(),
            is_active: branch.is_active,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeNode {
    pub version_id: VersionId,
    pub version_number: u32,
    pub title: String,
    pub status: VersionStatus,
    pub version_type: VersionType,
    pub created_at: DateTime<Utc>,
    /// Distance from the tree root (root = 0).
    pub depth: usize,
    pub branch: Option<BranchTag>,
    /// In `child_version_ids` insertion order.
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    fn leaf(version: &ImageVersion, depth: usize, branch: Option<BranchTag>) -> Self {
        Self {
            version_id: version.id.clone(),
            version_number: version.version_number,
            title: version.metadata.title.clone(),
            status: version.status,
            version_type: version.version_type,
            created_at: version.metadata.created_at,
            depth,
            branch,
            children: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionTree {
    pub root: TreeNode,
    /// Count of every version sharing the root's `root_version_id`.
    pub total_versions: usize,
    /// Deepest ancestor chain in the lineage, independent of the depth limit.
    pub max_depth: usize,
    /// Nodes actually present in `root`.
    pub node_count: usize,
}

impl VersionTree {
    /// Pre-order walk of the rendered nodes.
    pub fn nodes(&self) -> Vec<&TreeNode> {
        let mut out = Vec::with_capacity(self.node_count);
        let mut stack = vec![&self.root];
        while let Some(node) = stack.pop() {
            out.push(node);
            stack.extend(node.children.iter().rev());
        }
        out
    }

    pub fn find(&self, version_id: &str) -> Option<&TreeNode> {
        self.nodes().into_iter().find(|n| n.version_id == version_id)
    }

    /// Indented text rendering, one node per line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for node in self.nodes() {
            let title = if node.title.is_empty() { "Untitled" } else { &node.title };
            let _ = write!(
                out,
                "{}- v{} {} [{}]",
                "  ".repeat(node.depth),
                node.version_number,
                title,
                node.version_id
            );
            if let Some(branch) = &node.branch {
                let marker = if branch.is_active { "*" } else { "" };
                let _ = write!(out, " <{}{}>", marker, branch.name);
            }
            let _ = writeln!(out);
        }
        out
    }
}

/// Length of the parent chain from `version` to its lineage root, or `None`
/// when the chain dangles or loops.
fn chain_length(versions: &VersionStore, version: &ImageVersion) -> Option<usize> {
    let mut depth = 0;
    let mut current = version;
    while let Some(parent_id) = &current.parent_version_id {
        current = versions.get(parent_id)?;
        depth += 1;
        if depth > versions.len() {
            return None;
        }
    }
    (current.id == version.root_version_id).then_some(depth)
}

/// Project `root_id` and its descendants into a tree.
///
/// Nodes deeper than `max_depth` are left out. Children that are missing
/// from the store, or whose parent link does not point back, are skipped
/// together with their subtrees.
pub fn build_version_tree(
    versions: &VersionStore,
    branches: &BranchManager,
    root_id: &str,
    max_depth: Option<usize>,
) -> LineageResult<VersionTree> {
    let root = versions.require(root_id)?;
    let annotate = |id: &str| branches.head_branch_for(id).map(BranchTag::from);

    // Flat arena first; parents always precede their children.
    let mut flat: Vec<(TreeNode, Vec<usize>)> = Vec::new();
    let mut visited: HashSet<&str> = HashSet::new();
    let mut stack: Vec<(&ImageVersion, usize, Option<usize>)> = vec![(root, 0, None)];

    while let Some((version, depth, parent_slot)) = stack.pop() {
        if !visited.insert(version.id.as_str()) {
            warn!(version_id = %version.id, "cycle in version graph, skipping");
            continue;
        }

        let slot = flat.len();
        flat.push((TreeNode::leaf(version, depth, annotate(&version.id)), Vec::new()));
        if let Some(parent) = parent_slot {
            flat[parent].1.push(slot);
        }

        if max_depth.is_some_and(|limit| depth >= limit) {
            continue;
        }

        for child_id in version.child_version_ids.iter().rev() {
            match versions.get(child_id) {
                Some(child) if child.parent_version_id.as_deref() == Some(version.id.as_str()) => {
                    stack.push((child, depth + 1, Some(slot)));
                }
                Some(_) => {
                    warn!(parent = %version.id, child = %child_id, "child does not link back to parent, skipping");
                }
                None => {
                    warn!(parent = %version.id, child = %child_id, "child version missing, skipping");
                }
            }
        }
    }

    let node_count = flat.len();
    let mut built: Vec<Option<TreeNode>> = (0..node_count).map(|_| None).collect();
    for (slot, (mut node, child_slots)) in flat.into_iter().enumerate().rev() {
        node.children = child_slots
            .iter()
            .filter_map(|child| built[*child].take())
            .collect();
        built[slot] = Some(node);
    }
    let root_node = built
        .into_iter()
        .next()
        .flatten()
        .ok_or_else(|| LineageError::Internal("tree root was not built".into()))?;

    let members = versions.lineage_members(&root.root_version_id);
    let max_depth_seen = members
        .iter()
        .filter_map(|v| chain_length(versions, v))
        .max()
        .unwrap_or(0);

    debug!(root = %root_id, nodes = node_count, total = members.len(), "built version tree");

    Ok(VersionTree {
        root: root_node,
        total_versions: members.len(),
        max_depth: max_depth_seen,
        node_count,
    })
}
