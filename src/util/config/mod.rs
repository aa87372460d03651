//! flowtask configuration system
//!
//! # Configuration hierarchy
//!
//! ```text
//! Priority (high → low):
//! 1. CLI arguments
//! 2. Environment variables (FLOWTASK_WORKERS)
//! 3. Configuration file (flowtask.toml)
//! 4. Default values
//! ```
//!
//! # Usage
//!
//! ```rust
//! use flowtask::util::config::{load_config_or_default, FlowtaskConfig};
//! use std::path::Path;
//!
//! let config = load_config_or_default(Path::new("flowtask.toml")).unwrap();
//! assert!(config.scheduler.num_workers >= 1);
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::runtime::scheduler::SchedulerConfig;
use crate::util::logger::LogLevel;

/// Environment variable overriding `scheduler.num_workers`.
pub const WORKERS_ENV: &str = "FLOWTASK_WORKERS";

/// Default configuration file name.
pub const CONFIG_FILE: &str = "flowtask.toml";

/// Top-level configuration file layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowtaskConfig {
    /// Worker pool settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Logging settings
    #[serde(default)]
    pub log: LogConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Minimum level printed by the CLI
    #[serde(default)]
    pub level: LogLevel,
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Load and validate a configuration file.
pub fn load_config(path: &Path) -> Result<FlowtaskConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config: FlowtaskConfig = toml::from_str(&content)?;
    config.scheduler.validate()?;
    debug!(path = %path.display(), "configuration loaded");
    Ok(config)
}

/// Load a configuration file, falling back to defaults when it does not exist.
pub fn load_config_or_default(path: &Path) -> Result<FlowtaskConfig, ConfigError> {
    if !path.exists() {
        debug!(path = %path.display(), "no configuration file, using defaults");
        return Ok(FlowtaskConfig::default());
    }
    load_config(path)
}

/// Save a configuration file.
pub fn save_config(
    config: &FlowtaskConfig,
    path: &Path,
) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            fs::create_dir_all(dir)?;
        }
    }
    let content = toml::to_string_pretty(config)?;
    fs::write(path, content)?;
    Ok(())
}

/// Apply environment overrides on top of a loaded configuration.
pub fn apply_env_overrides(config: &mut FlowtaskConfig) -> Result<(), ConfigError> {
    apply_workers_override(config, std::env::var(WORKERS_ENV).ok().as_deref())
}

/// Apply a `FLOWTASK_WORKERS`-style value; `None` leaves the config untouched.
pub fn apply_workers_override(
    config: &mut FlowtaskConfig,
    value: Option<&str>,
) -> Result<(), ConfigError> {
    let Some(value) = value else {
        return Ok(());
    };
    let workers: usize = value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{WORKERS_ENV}={value:?} is not a number")))?;
    config.scheduler.num_workers = workers;
    config.scheduler.validate()
}
