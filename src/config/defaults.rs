//! Built-in defaults, the lowest configuration layer.

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError};

/// Create a Config builder with every default applied.
pub fn builder_with_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    let data_dir = super::default_data_dir();
    Config::builder()
        .set_default("live.open_retry_initial_ms", 50)?
        .set_default("live.open_retry_max_ms", 5_000)?
        .set_default("reach.excluded_keys", vec!["copiedFrom".to_string()])?
        .set_default("cache.enabled", true)?
        .set_default("storage.data_dir", data_dir.to_string_lossy().to_string())?
        .set_default("storage.persist", false)?
        .set_default("logging.level", "info")?
        .set_default("logging.format", "text")?
        .set_default("logging.output", "stdout")
}
