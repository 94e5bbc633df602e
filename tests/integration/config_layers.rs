//! Integration tests for layered configuration

use meshstore::config::{ConfigLoader, EngineConfig};
use meshstore::{Engine, EngineError};
use std::io::Write;
use tempfile::TempDir;

fn write_config(dir: &TempDir, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join("config.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    path
}

/// Keys missing from the file keep their defaults
#[test]
fn test_partial_file_keeps_defaults() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "[storage]\npersist = false\n\n[logging]\nlevel = \"debug\"\n");

    let config = ConfigLoader::load_from(&path).unwrap();
    let defaults = EngineConfig::default();
    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.reach.excluded_keys, defaults.reach.excluded_keys);
    assert_eq!(config.live.open_retry_initial_ms, defaults.live.open_retry_initial_ms);
}

/// A file that fails validation is rejected by the loader
#[test]
fn test_invalid_file_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "[reach]\nexcluded_keys = [\"\"]\n");

    let err = ConfigLoader::load_from(&path).unwrap_err();
    assert!(matches!(err, EngineError::ConfigError(_)));
}

/// Malformed TOML surfaces as a configuration error
#[test]
fn test_malformed_file_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "[live\nopen_retry_initial_ms = ");

    assert!(matches!(
        ConfigLoader::load_from(&path),
        Err(EngineError::ConfigError(_))
    ));
}

/// Environment variables override the file
#[test]
fn test_environment_overrides_file() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "[live]\nopen_retry_initial_ms = 5\nopen_retry_max_ms = 20\n");

    std::env::set_var("MESHSTORE__LIVE__OPEN_RETRY_MAX_MS", "400");
    let loaded = ConfigLoader::load_from(&path);
    std::env::remove_var("MESHSTORE__LIVE__OPEN_RETRY_MAX_MS");

    let config = loaded.unwrap();
    assert_eq!(config.live.open_retry_initial_ms, 5);
    assert_eq!(config.live.open_retry_max_ms, 400);
}

/// Engines refuse configurations that fail validation
#[test]
fn test_engine_rejects_invalid_config() {
    let mut config = EngineConfig::default();
    config.live.open_retry_max_ms = 0;
    let err = Engine::local("alice", config).err().unwrap();
    assert!(matches!(err, EngineError::ConfigError(_)));
}
