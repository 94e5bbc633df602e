//! File and environment configuration sources.

use config::builder::DefaultState;
use config::{ConfigBuilder, ConfigError, Environment, File, FileFormat};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Prefix of configuration environment variables (`MESHSTORE__LIVE__OPEN_RETRY_MAX_MS`).
pub const ENV_PREFIX: &str = "MESHSTORE";

/// Platform config file: `$XDG_CONFIG_HOME/meshstore/config.toml` on Linux.
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "meshstore")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Add `path` if it exists; a missing file is not an error.
pub fn add_optional_file(
    builder: ConfigBuilder<DefaultState>,
    path: Option<PathBuf>,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    match path {
        Some(path) if path.exists() => add_required_file(builder, &path),
        Some(path) => {
            debug!(
                config_path = %path.display(),
                "No configuration file found, using defaults"
            );
            Ok(builder)
        }
        None => Ok(builder),
    }
}

pub fn add_required_file(
    builder: ConfigBuilder<DefaultState>,
    path: &Path,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.display().to_string()));
    }
    Ok(builder.add_source(File::from(path).format(FileFormat::Toml).required(true)))
}

pub fn add_environment(builder: ConfigBuilder<DefaultState>) -> ConfigBuilder<DefaultState> {
    builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("reach.excluded_keys"),
    )
}
