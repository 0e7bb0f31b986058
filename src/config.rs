use crate::error::{LineageError, LineageResult};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub similarity: SimilarityConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Behavioural knobs for the version graph engine.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Branch created on the first root version.
    #[serde(default = "default_branch_name")]
    pub default_branch: String,
    /// Branch names (case-insensitive) that can be neither renamed nor deleted.
    #[serde(default = "default_protected_branches")]
    pub protected_branches: Vec<String>,
    /// Depth limit applied when a tree request does not pass one.
    #[serde(default)]
    pub default_tree_depth: Option<usize>,
    /// Length of the most-viewed / most-liked / most-exported rankings.
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    #[serde(default = "default_true")]
    pub auto_create_default_branch: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_branch: default_branch_name(),
            protected_branches: default_protected_branches(),
            default_tree_depth: None,
            top_n: default_top_n(),
            auto_create_default_branch: true,
        }
    }
}

/// Tolerances used when comparing AI generation parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct SimilarityConfig {
    #[serde(default = "default_guidance_tolerance")]
    pub guidance_tolerance: f64,
    #[serde(default = "default_steps_tolerance")]
    pub steps_tolerance: u32,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            guidance_tolerance: default_guidance_tolerance(),
            steps_tolerance: default_steps_tolerance(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            snapshot_path: default_snapshot_path(),
        }
    }
}

fn default_branch_name() -> String {
    "main".to_string()
}

fn default_protected_branches() -> Vec<String> {
    vec!["main".to_string(), "master".to_string()]
}

fn default_top_n() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_guidance_tolerance() -> f64 {
    0.5
}

fn default_steps_tolerance() -> u32 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from("lineage.json")
}

pub fn load_config(path: Option<&Path>) -> LineageResult<AppConfig> {
    let mut builder = Config::builder()
        .add_source(File::with_name("lineage").required(false))
        .add_source(Environment::with_prefix("LINEAGE").separator("__"));

    if let Some(path) = path {
        builder = builder.add_source(File::from(path).required(false));
    }

    let config = builder
        .build()
        .map_err(|err| LineageError::Config(err.to_string()))?;

    let parsed: AppConfig = config
        .try_deserialize()
        .map_err(|err| LineageError::Config(err.to_string()))?;

    if parsed.engine.default_branch.trim().is_empty() {
        return Err(LineageError::Config(
            "engine.default_branch must not be blank".to_string(),
        ));
    }
    if parsed.engine.top_n == 0 {
        return Err(LineageError::Config(
            "engine.top_n must be at least 1".to_string(),
        ));
    }

    Ok(parsed)
}
