//! Persistence layer for store logs
//!
//! Sled database with two trees: `manifests` (address → bincode-encoded
//! [`Manifest`]) and `entries` (`address/hash` → JSON-encoded [`LogEntry`]).
//! Entries go through JSON because payload values are dynamically typed.

use crate::error::StoreError;
use crate::store::entry::LogEntry;
use crate::store::Manifest;
use crate::types::Address;
use std::path::Path;

fn storage_error(kind: std::io::ErrorKind, message: String) -> StoreError {
    StoreError::IoError(std::io::Error::new(kind, message))
}

/// Sled-backed storage for manifests and log entries
#[derive(Clone)]
pub struct SledLogStorage {
    db: sled::Db,
    manifests: sled::Tree,
    entries: sled::Tree,
}

impl SledLogStorage {
    /// Open (or create) the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(|e| {
            storage_error(
                std::io::ErrorKind::Other,
                format!("Failed to open sled database: {}", e),
            )
        })?;
        let manifests = db.open_tree("manifests").map_err(|e| {
            storage_error(
                std::io::ErrorKind::Other,
                format!("Failed to open manifests tree: {}", e),
            )
        })?;
        let entries = db.open_tree("entries").map_err(|e| {
            storage_error(
                std::io::ErrorKind::Other,
                format!("Failed to open entries tree: {}", e),
            )
        })?;
        Ok(Self {
            db,
            manifests,
            entries,
        })
    }

    pub fn db(&self) -> &sled::Db {
        &self.db
    }

    pub fn save_manifest(&self, address: &Address, manifest: &Manifest) -> Result<(), StoreError> {
        let value = bincode::serialize(manifest).map_err(|e| {
            storage_error(
                std::io::ErrorKind::InvalidData,
                format!("Failed to serialize manifest: {}", e),
            )
        })?;
        self.manifests
            .insert(address.as_str().as_bytes(), value)
            .map_err(|e| {
                storage_error(
                    std::io::ErrorKind::Other,
                    format!("Failed to store manifest: {}", e),
                )
            })?;
        Ok(())
    }

    pub fn load_manifest(&self, address: &Address) -> Result<Option<Manifest>, StoreError> {
        match self.manifests.get(address.as_str().as_bytes()).map_err(|e| {
            storage_error(
                std::io::ErrorKind::Other,
                format!("Failed to get manifest: {}", e),
            )
        })? {
            Some(value) => {
                let manifest: Manifest = bincode::deserialize(&value).map_err(|e| {
                    storage_error(
                        std::io::ErrorKind::InvalidData,
                        format!("Failed to deserialize manifest: {}", e),
                    )
                })?;
                Ok(Some(manifest))
            }
            None => Ok(None),
        }
    }

    fn entry_key(address: &Address, entry: &LogEntry) -> String {
        format!("{}/{}", address.as_str(), entry.hash_hex())
    }

    fn entry_prefix(address: &Address) -> String {
        format!("{}/", address.as_str())
    }

    pub fn save_entry(&self, address: &Address, entry: &LogEntry) -> Result<(), StoreError> {
        let value = serde_json::to_vec(entry).map_err(|e| {
            storage_error(
                std::io::ErrorKind::InvalidData,
                format!("Failed to serialize log entry: {}", e),
            )
        })?;
        self.entries
            .insert(Self::entry_key(address, entry).as_bytes(), value)
            .map_err(|e| {
                storage_error(
                    std::io::ErrorKind::Other,
                    format!("Failed to store log entry: {}", e),
                )
            })?;
        Ok(())
    }

    /// All stored entries of one store, in no particular order.
    pub fn load_entries(&self, address: &Address) -> Result<Vec<LogEntry>, StoreError> {
        let mut entries = Vec::new();
        for item in self.entries.scan_prefix(Self::entry_prefix(address).as_bytes()) {
            let (_, value) = item.map_err(|e| {
                storage_error(
                    std::io::ErrorKind::Other,
                    format!("Failed to iterate log entries: {}", e),
                )
            })?;
            let entry: LogEntry = serde_json::from_slice(&value).map_err(|e| {
                storage_error(
                    std::io::ErrorKind::InvalidData,
                    format!("Failed to deserialize log entry: {}", e),
                )
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Remove the manifest and every entry of one store.
    pub fn delete(&self, address: &Address) -> Result<(), StoreError> {
        self.manifests
            .remove(address.as_str().as_bytes())
            .map_err(|e| {
                storage_error(
                    std::io::ErrorKind::Other,
                    format!("Failed to delete manifest: {}", e),
                )
            })?;
        let keys: Vec<sled::IVec> = self
            .entries
            .scan_prefix(Self::entry_prefix(address).as_bytes())
            .keys()
            .filter_map(Result::ok)
            .collect();
        for key in keys {
            self.entries.remove(key).map_err(|e| {
                storage_error(
                    std::io::ErrorKind::Other,
                    format!("Failed to delete log entry: {}", e),
                )
            })?;
        }
        Ok(())
    }

    /// Flush pending writes to disk
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush().map_err(|e| {
            storage_error(
                std::io::ErrorKind::Other,
                format!("Failed to flush database: {}", e),
            )
        })?;
        Ok(())
    }
}
