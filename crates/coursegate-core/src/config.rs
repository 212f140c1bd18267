//! Engine configuration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::scoring::GradeTable;

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Hide every resource of a level while its test is in progress, not
    /// only resources flagged `lock_during_test`.
    #[serde(default)]
    pub lock_resources_during_test: bool,
    /// Trim whitespace from single answers before comparing.
    #[serde(default = "default_true")]
    pub trim_answers: bool,
    /// Grade table for tests that don't define one.
    #[serde(default)]
    pub default_grade_table: GradeTable,
    /// Buffered lifecycle events per subscriber before the slowest lags.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Cache group-gating lookups per principal.
    #[serde(default = "default_true")]
    pub cache_access: bool,
}

fn default_true() -> bool {
    true
}

fn default_event_capacity() -> usize {
    64
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_resources_during_test: false,
            trim_answers: true,
            default_grade_table: GradeTable::default(),
            event_capacity: default_event_capacity(),
            cache_access: true,
        }
    }
}

/// Load configuration from well-known paths.
///
/// Search order:
/// 1. `coursegate.toml` in the current directory
/// 2. `~/.config/coursegate/config.toml`
///
/// Environment overrides: `COURSEGATE_LOCK_RESOURCES`, `COURSEGATE_TRIM_ANSWERS`.
pub fn load_config() -> Result<EngineConfig> {
    load_config_from(None)
}

/// Load config from an explicit path, or search the default locations.
pub fn load_config_from(path: Option<&Path>) -> Result<EngineConfig> {
    let config_path = if let Some(p) = path {
        if p.exists() {
            Some(p.to_path_buf())
        } else {
            anyhow::bail!("config file not found: {}", p.display());
        }
    } else {
        let local = PathBuf::from("coursegate.toml");
        if local.exists() {
            Some(local)
        } else {
            dirs_path()
                .map(|home| home.join("config.toml"))
                .filter(|global| global.exists())
        }
    };

    let mut config = match config_path {
        Some(path) => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config: {}", path.display()))?;
            parse_config(&content)
                .with_context(|| format!("failed to parse config: {}", path.display()))?
        }
        None => EngineConfig::default(),
    };

    if let Some(lock) = env_flag("COURSEGATE_LOCK_RESOURCES")? {
        config.lock_resources_during_test = lock;
    }
    if let Some(trim) = env_flag("COURSEGATE_TRIM_ANSWERS")? {
        config.trim_answers = trim;
    }

    Ok(config)
}

/// Parse a TOML config document.
pub fn parse_config(content: &str) -> Result<EngineConfig> {
    Ok(toml::from_str::<EngineConfig>(content)?)
}

fn env_flag(name: &str) -> Result<Option<bool>> {
    match std::env::var(name) {
        Ok(value) => parse_flag(&value)
            .map(Some)
            .with_context(|| format!("invalid value for {name}")),
        Err(_) => Ok(None),
    }
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("expected a boolean, got '{other}'"),
    }
}

fn dirs_path() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|h| PathBuf::from(h).join(".config").join("coursegate"))
}
