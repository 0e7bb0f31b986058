use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::{LineageError, LineageResult};
use crate::model::branch::Branch;
use crate::model::version::{
    ImageVersion, UsageKind, VersionId, VersionStatus, VersionType,
};
use crate::store::branches::BranchManager;
use crate::store::versions::VersionStore;

// ---------------------------------------------------------------------------
// Statistics over a set of versions
// ---------------------------------------------------------------------------

pub const DAILY_BUCKETS: usize = 30;
pub const WEEKLY_BUCKETS: usize = 12;
pub const MONTHLY_BUCKETS: usize = 12;

/// Which versions a statistics request covers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StatisticsScope {
    #[default]
    All,
    /// One image: every version sharing this root.
    Lineage(VersionId),
}

/// Sliding-window creation histograms, oldest bucket first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreationFrequency {
    pub daily: Vec<usize>,
    pub weekly: Vec<usize>,
    pub monthly: Vec<usize>,
}

impl Default for CreationFrequency {
    fn default() -> Self {
        Self {
            daily: vec![0; DAILY_BUCKETS],
            weekly: vec![0; WEEKLY_BUCKETS],
            monthly: vec![0; MONTHLY_BUCKETS],
        }
    }
}

impl CreationFrequency {
    /// Count `created_at` into each window it falls inside. Timestamps
    /// outside a window (or in the future) are not counted there.
    fn record(&mut self, created_at: DateTime<Utc>, now: DateTime<Utc>) {
        if created_at > now {
            return;
        }
        let days = (now - created_at).num_days();
        if let Some(offset) = window_offset(days, DAILY_BUCKETS) {
            self.daily[DAILY_BUCKETS - 1 - offset] += 1;
        }
        if let Some(offset) = window_offset(days / 7, WEEKLY_BUCKETS) {
            self.weekly[WEEKLY_BUCKETS - 1 - offset] += 1;
        }
        let months = (now.year() as i64 * 12 + now.month0() as i64)
            - (created_at.year() as i64 * 12 + created_at.month0() as i64);
        if let Some(offset) = window_offset(months, MONTHLY_BUCKETS) {
            self.monthly[MONTHLY_BUCKETS - 1 - offset] += 1;
        }
    }
}

fn window_offset(offset: i64, buckets: usize) -> Option<usize> {
    usize::try_from(offset).ok().filter(|o| *o < buckets)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedVersion {
    pub version_id: VersionId,
    pub title: String,
    pub count: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    pub total_versions: usize,
    pub by_status: BTreeMap<VersionStatus, usize>,
    pub by_type: BTreeMap<VersionType, usize>,
    pub model_usage: BTreeMap<String, usize>,
    pub provider_usage: BTreeMap<String, usize>,
    pub creation_frequency: CreationFrequency,
    pub most_viewed: Vec<RankedVersion>,
    pub most_liked: Vec<RankedVersion>,
    pub most_exported: Vec<RankedVersion>,
    /// Milliseconds, averaged over versions that recorded a duration.
    pub average_generation_time: f64,
    pub total_generation_time: u64,
    /// Bytes, averaged over versions that recorded a size.
    pub average_file_size: f64,
    pub total_storage_used: u64,
}

fn top_by(versions: &[&ImageVersion], kind: UsageKind, top_n: usize) -> Vec<RankedVersion> {
    let mut ranked: Vec<&ImageVersion> = versions.to_vec();
    ranked.sort_by(|a, b| {
        b.usage_count(kind)
            .cmp(&a.usage_count(kind))
            .then_with(|| b.metadata.created_at.cmp(&a.metadata.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
    ranked
        .into_iter()
        .take(top_n)
        .map(|v| RankedVersion {
            version_id: v.id.clone(),
            title: v.metadata.title.clone(),
            count: v.usage_count(kind),
            created_at: v.metadata.created_at,
        })
        .collect()
}

fn mean(total: u128, count: usize) -> f64 {
    if count == 0 {
        0.0
    } else {
        total as f64 / count as f64
    }
}

fn clamp_u64(total: u128) -> u64 {
    u64::try_from(total).unwrap_or(u64::MAX)
}

/// Aggregate statistics over `versions` as of `now`.
pub fn compute_statistics(versions: &[&ImageVersion], now: DateTime<Utc>, top_n: usize) -> Statistics {
    let mut by_status: BTreeMap<VersionStatus, usize> =
        VersionStatus::ALL.iter().map(|s| (*s, 0)).collect();
    let mut by_type: BTreeMap<VersionType, usize> =
        VersionType::ALL.iter().map(|t| (*t, 0)).collect();
    let mut model_usage: BTreeMap<String, usize> = BTreeMap::new();
    let mut provider_usage: BTreeMap<String, usize> = BTreeMap::new();
    let mut creation_frequency = CreationFrequency::default();

    // Summed wide so averages stay exact; reported totals clamp at u64::MAX.
    let (mut total_generation_time, mut timed) = (0u128, 0usize);
    let (mut total_storage_used, mut sized) = (0u128, 0usize);

    for version in versions {
        *by_status.entry(version.status).or_default() += 1;
        *by_type.entry(version.version_type).or_default() += 1;

        let params = &version.metadata.ai_parameters;
        if let Some(model) = &params.model {
            *model_usage.entry(model.clone()).or_default() += 1;
        }
        if let Some(provider) = &params.provider {
            *provider_usage.entry(provider.clone()).or_default() += 1;
        }

        creation_frequency.record(version.metadata.created_at, now);

        if let Some(ms) = version.metadata.generation_duration_ms {
            total_generation_time += u128::from(ms);
            timed += 1;
        }
        if let Some(bytes) = version.metadata.file_size {
            total_storage_used += u128::from(bytes);
            sized += 1;
        }
    }

    Statistics {
        total_versions: versions.len(),
        by_status,
        by_type,
        model_usage,
        provider_usage,
        creation_frequency,
        most_viewed: top_by(versions, UsageKind::View, top_n),
        most_liked: top_by(versions, UsageKind::Like, top_n),
        most_exported: top_by(versions, UsageKind::Export, top_n),
        average_generation_time: mean(total_generation_time, timed),
        total_generation_time: clamp_u64(total_generation_time),
        average_file_size: mean(total_storage_used, sized),
        total_storage_used: clamp_u64(total_storage_used),
    }
}

/// Versions covered by `scope`.
pub fn scoped_versions<'a>(
    versions: &'a VersionStore,
    scope: &StatisticsScope,
) -> LineageResult<Vec<&'a ImageVersion>> {
    match scope {
        StatisticsScope::All => Ok(versions.iter().collect()),
        StatisticsScope::Lineage(root_id) => {
            let root = versions.require(root_id)?;
            if !root.is_root() {
                return Err(LineageError::Validation(format!(
                    "{} is not a root version",
                    root_id
                )));
            }
            Ok(versions.lineage_members(root_id))
        }
    }
}

// ---------------------------------------------------------------------------
// Per-image history bundle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionHistory {
    pub root_version_id: VersionId,
    /// Oldest first.
    pub versions: Vec<ImageVersion>,
    pub branches: Vec<Branch>,
    /// Head of the active branch when it belongs to this lineage, otherwise
    /// the most recently created version.
    pub current_version_id: Option<VersionId>,
    pub statistics: Statistics,
}

pub fn version_history(
    versions: &VersionStore,
    branches: &BranchManager,
    root_id: &str,
    now: DateTime<Utc>,
    top_n: usize,
) -> LineageResult<VersionHistory> {
    let members = scoped_versions(versions, &StatisticsScope::Lineage(root_id.to_string()))?;
    let statistics = compute_statistics(&members, now, top_n);

    let current_version_id = branches
        .active()
        .filter(|b| b.root_version_id == root_id)
        .map(|b| b.head_version_id.clone())
        .or_else(|| {
            members
                .iter()
                .max_by(|a, b| {
                    a.metadata
                        .created_at
                        .cmp(&b.metadata.created_at)
                        .then_with(|| b.id.cmp(&a.id))
                })
                .map(|v| v.id.clone())
        });

    debug!(root = %root_id, versions = members.len(), "assembled version history");

    Ok(VersionHistory {
        root_version_id: root_id.to_string(),
        versions: members.into_iter().cloned().collect(),
        branches: branches.for_root(root_id).into_iter().cloned().collect(),
        current_version_id,
        statistics,
    })
}
