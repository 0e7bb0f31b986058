//! Read-side computations over a store snapshot: tree projection,
//! version comparison, history and statistics. All functions here take
//! shared references and never mutate.

pub mod comparison;
pub mod history;
pub mod tree;

pub use comparison::{
    find_conflicts, find_differences, generate_comparison_report, ComparisonEngine,
};
pub use history::{
    compute_statistics, version_history, CreationFrequency, RankedVersion, Statistics,
    StatisticsScope, VersionHistory,
};
pub use tree::{build_version_tree, BranchTag, TreeNode, VersionTree};
