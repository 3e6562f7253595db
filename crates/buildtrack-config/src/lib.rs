use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const BUILDTRACK_DIR_NAME: &str = ".buildtrack";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const DEFAULT_DATABASE_FILE: &str = "progress.sqlite";
pub const DEFAULT_DEADLINE_WINDOW_DAYS: i64 = 7;
pub const DEFAULT_NAME_CACHE_TTL_SECS: u64 = 3600;
pub const DEFAULT_ACTOR: &str = "reconciler";
pub const DEFAULT_COMPOSITE_MILESTONE: &str = "Design Documentation Development";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BuildtrackConfig {
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_deadline_window_days")]
    pub deadline_window_days: i64,
    #[serde(default = "default_name_cache_ttl_secs")]
    pub name_cache_ttl_secs: u64,
    #[serde(default = "default_actor")]
    pub actor: String,
    #[serde(default = "default_composite_milestone")]
    pub composite_milestone: String,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            deadline_window_days: default_deadline_window_days(),
            name_cache_ttl_secs: default_name_cache_ttl_secs(),
            actor: default_actor(),
            composite_milestone: default_composite_milestone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_file")]
    pub database: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database_file(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("failed to serialize config TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

pub fn buildtrack_dir(workspace_root: impl AsRef<Path>) -> PathBuf {
    workspace_root.as_ref().join(BUILDTRACK_DIR_NAME)
}

pub fn config_path(workspace_root: impl AsRef<Path>) -> PathBuf {
    buildtrack_dir(workspace_root).join(CONFIG_FILE_NAME)
}

pub fn database_path(workspace_root: impl AsRef<Path>, config: &BuildtrackConfig) -> PathBuf {
    buildtrack_dir(workspace_root).join(&config.storage.database)
}

pub fn load_workspace_config(
    workspace_root: impl AsRef<Path>,
) -> Result<BuildtrackConfig, ConfigError> {
    let path = config_path(workspace_root);
    if !path.exists() {
        return Ok(BuildtrackConfig::default());
    }

    let raw = fs::read_to_string(path)?;
    let parsed: BuildtrackConfig = toml::from_str(&raw)?;
    Ok(normalize_config(parsed))
}

pub fn ensure_workspace_config(
    workspace_root: impl AsRef<Path>,
) -> Result<BuildtrackConfig, ConfigError> {
    let workspace_root = workspace_root.as_ref();
    fs::create_dir_all(buildtrack_dir(workspace_root))?;

    let path = config_path(workspace_root);
    if path.exists() {
        return load_workspace_config(workspace_root);
    }

    let config = BuildtrackConfig::default();
    let content = toml::to_string_pretty(&config)?;
    fs::write(path, content)?;

    Ok(config)
}

pub fn validate_config(config: &BuildtrackConfig) -> Vec<ConfigWarning> {
    let mut warnings = Vec::new();

    if config.reconcile.deadline_window_days < 0 {
        warnings.push(ConfigWarning {
            code: "reconcile.deadline_window_negative",
            message: format!(
                "[reconcile].deadline_window_days = {} never colors a pending point yellow",
                config.reconcile.deadline_window_days
            ),
        });
    }

    if config.reconcile.name_cache_ttl_secs == 0 {
        warnings.push(ConfigWarning {
            code: "reconcile.name_cache_disabled",
            message: "[reconcile].name_cache_ttl_secs = 0 disables library name caching"
                .to_owned(),
        });
    }

    warnings
}

fn default_deadline_window_days() -> i64 {
    DEFAULT_DEADLINE_WINDOW_DAYS
}

fn default_name_cache_ttl_secs() -> u64 {
    DEFAULT_NAME_CACHE_TTL_SECS
}

fn default_actor() -> String {
    DEFAULT_ACTOR.to_owned()
}

fn default_composite_milestone() -> String {
    DEFAULT_COMPOSITE_MILESTONE.to_owned()
}

fn default_database_file() -> String {
    DEFAULT_DATABASE_FILE.to_owned()
}

fn normalize_required(input: &str, fallback: fn() -> String) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        fallback()
    } else {
        trimmed.to_owned()
    }
}

fn normalize_config(mut config: BuildtrackConfig) -> BuildtrackConfig {
    config.reconcile.actor = normalize_required(&config.reconcile.actor, default_actor);
    config.reconcile.composite_milestone = normalize_required(
        &config.reconcile.composite_milestone,
        default_composite_milestone,
    );
    config.storage.database = normalize_required(&config.storage.database, default_database_file);
    config
}
