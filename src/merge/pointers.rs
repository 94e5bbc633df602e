//! Local slot pointer cache
//!
//! Remembers which child store this replica last resolved for a
//! `(parent, slot)` pair, so a diverging canonical value can be detected and
//! healed. Purely local state; never replicated.

use crate::error::StoreError;
use crate::store::persistence::SledLogStorage;
use crate::types::Address;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;

pub trait PointerCache: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Address>, StoreError>;
    fn set(&self, key: &str, address: &Address) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct MemoryPointerCache {
    pointers: Mutex<HashMap<String, Address>>,
}

impl MemoryPointerCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PointerCache for MemoryPointerCache {
    fn get(&self, key: &str) -> Result<Option<Address>, StoreError> {
        Ok(self.pointers.lock().get(key).cloned())
    }

    fn set(&self, key: &str, address: &Address) -> Result<(), StoreError> {
        self.pointers.lock().insert(key.to_string(), address.clone());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.pointers.lock().remove(key);
        Ok(())
    }
}

fn sled_error(action: &str, e: sled::Error) -> StoreError {
    StoreError::IoError(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("Failed to {} slot pointer: {}", action, e),
    ))
}

/// Sled tree `pointers`: slot key → address string.
#[derive(Clone)]
pub struct SledPointerCache {
    tree: sled::Tree,
}

impl SledPointerCache {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(|e| sled_error("open database for", e))?;
        Self::from_db(&db)
    }

    /// Share the database of an existing log storage.
    pub fn from_storage(storage: &SledLogStorage) -> Result<Self, StoreError> {
        Self::from_db(storage.db())
    }

    fn from_db(db: &sled::Db) -> Result<Self, StoreError> {
        let tree = db
            .open_tree("pointers")
            .map_err(|e| sled_error("open tree for", e))?;
        Ok(SledPointerCache { tree })
    }
}

impl PointerCache for SledPointerCache {
    fn get(&self, key: &str) -> Result<Option<Address>, StoreError> {
        let Some(raw) = self.tree.get(key).map_err(|e| sled_error("read", e))? else {
            return Ok(None);
        };
        let text = String::from_utf8(raw.to_vec()).map_err(|e| {
            StoreError::IoError(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Slot pointer is not UTF-8: {}", e),
            ))
        })?;
        Address::parse(&text).map(Some)
    }

    fn set(&self, key: &str, address: &Address) -> Result<(), StoreError> {
        self.tree
            .insert(key, address.as_str().as_bytes())
            .map_err(|e| sled_error("write", e))?;
        self.tree.flush().map_err(|e| sled_error("flush", e))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.tree.remove(key).map_err(|e| sled_error("remove", e))?;
        Ok(())
    }
}
