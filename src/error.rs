//! Error types for the replicated-store engine.

use crate::store::StoreKind;
use thiserror::Error;

/// Store-level errors, raised by the store provider or by a store handle.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Invalid store address: {0:?}")]
    AddressInvalid(String),

    #[error("Failed to open store {address}: {reason}")]
    OpenFailed { address: String, reason: String },

    #[error("Permission denied: {identity} may not write to {address}")]
    PermissionDenied { address: String, identity: String },

    #[error("Type mismatch for {address}: expected {expected}, found {actual}")]
    TypeMismatch {
        address: String,
        expected: StoreKind,
        actual: StoreKind,
    },

    #[error("Store not found: {0}")]
    NotFound(String),

    #[error("Malformed log entry: {0}")]
    MalformedEntry(String),

    #[error("Storage I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl StoreError {
    /// Transient failures are retried by the live view engine; everything else is final.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::OpenFailed { .. })
    }
}

/// Engine-level errors (live views, reachability, merges, configuration).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid element: {0}")]
    InvalidElement(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Subscription cancelled: {0}")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::ConfigError(err.to_string())
    }
}
