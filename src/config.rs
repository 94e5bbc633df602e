//! Configuration System
//!
//! Layered engine configuration: built-in defaults, then an optional TOML
//! file, then `MESHSTORE__`-prefixed environment variables. Tests included.

use crate::error::EngineError;
use crate::logging::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

mod defaults;
mod sources;

pub use sources::default_config_path;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub live: LiveConfig,

    #[serde(default)]
    pub reach: ReachConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Live view engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    /// First delay between open attempts (milliseconds)
    #[serde(default = "default_open_retry_initial_ms")]
    pub open_retry_initial_ms: u64,

    /// Upper bound of the exponential open backoff (milliseconds)
    #[serde(default = "default_open_retry_max_ms")]
    pub open_retry_max_ms: u64,
}

fn default_open_retry_initial_ms() -> u64 {
    50
}

fn default_open_retry_max_ms() -> u64 {
    5_000
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            open_retry_initial_ms: default_open_retry_initial_ms(),
            open_retry_max_ms: default_open_retry_max_ms(),
        }
    }
}

/// Reachability tracker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReachConfig {
    /// Keys whose values are never followed (copy back-references)
    #[serde(default = "default_excluded_keys")]
    pub excluded_keys: Vec<String>,
}

fn default_excluded_keys() -> Vec<String> {
    vec!["copiedFrom".to_string()]
}

impl Default for ReachConfig {
    fn default() -> Self {
        Self {
            excluded_keys: default_excluded_keys(),
        }
    }
}

/// Follow memoization settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// On-disk locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of persisted logs and slot pointers
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Persist logs with sled; otherwise everything stays in memory
    #[serde(default)]
    pub persist: bool,
}

impl StorageConfig {
    pub fn logs_path(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn pointers_path(&self) -> PathBuf {
        self.data_dir.join("pointers")
    }
}

pub(crate) fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "meshstore")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".meshstore"))
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            persist: false,
        }
    }
}

impl EngineConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), EngineError> {
        let mut errors = Vec::new();

        if self.live.open_retry_initial_ms == 0 {
            errors.push("live.open_retry_initial_ms must be greater than zero".to_string());
        }
        if self.live.open_retry_max_ms < self.live.open_retry_initial_ms {
            errors.push(format!(
                "live.open_retry_max_ms ({}) must not be below live.open_retry_initial_ms ({})",
                self.live.open_retry_max_ms, self.live.open_retry_initial_ms
            ));
        }
        if self.reach.excluded_keys.iter().any(|k| k.is_empty()) {
            errors.push("reach.excluded_keys cannot contain an empty key".to_string());
        }
        if self.storage.persist && self.storage.data_dir.as_os_str().is_empty() {
            errors.push("storage.data_dir cannot be empty when persistence is enabled".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(EngineError::ConfigError(format!(
                "Configuration validation failed:\n{}",
                errors.join("\n")
            )))
        }
    }
}

/// Builds an [`EngineConfig`] from every configuration layer.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Defaults, the default config file (if present) and the environment.
    pub fn load() -> Result<EngineConfig, EngineError> {
        Self::load_layers(default_config_path())
    }

    /// Defaults, `path` (required) and the environment.
    pub fn load_from(path: &Path) -> Result<EngineConfig, EngineError> {
        let builder = defaults::builder_with_defaults()?;
        let builder = sources::add_required_file(builder, path)?;
        Self::finish(builder)
    }

    fn load_layers(path: Option<PathBuf>) -> Result<EngineConfig, EngineError> {
        let builder = defaults::builder_with_defaults()?;
        let builder = sources::add_optional_file(builder, path)?;
        Self::finish(builder)
    }

    fn finish(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<EngineConfig, EngineError> {
        let config: EngineConfig = sources::add_environment(builder)
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }
}
