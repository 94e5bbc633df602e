//! Feed store: append-only list, entries removable by hash.

use crate::error::StoreError;
use crate::store::entry::{LogEntry, Op, Payload};
use crate::store::set::ListEntry;
use crate::store::Store;
use crate::types::{Hash, Value};
use std::collections::HashSet;

/// Materialize a traversal (newest first) into the surviving entries, oldest first.
pub fn materialize_feed(entries: &[LogEntry]) -> Vec<ListEntry> {
    let mut removed: HashSet<&str> = HashSet::new();
    let mut present = Vec::new();

    for entry in entries {
        match entry.payload.op {
            Op::Del => {
                if let Some(target) = entry.payload.key.as_deref() {
                    removed.insert(target);
                }
            }
            Op::Add => {
                if removed.contains(entry.hash_hex().as_str()) {
                    continue;
                }
                if let Some(value) = entry.payload.value.as_ref() {
                    present.push(ListEntry {
                        value: value.clone(),
                        hash: entry.hash,
                    });
                }
            }
            Op::Put | Op::Move => {}
        }
    }

    present.reverse();
    present
}

#[derive(Debug, Clone)]
pub struct FeedStore {
    store: Store,
}

impl FeedStore {
    pub(crate) fn new(store: Store) -> Self {
        FeedStore { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Append a value; returns the hash that identifies it for `del`.
    pub async fn add(&self, value: Value) -> Result<Hash, StoreError> {
        Ok(self.store.log().append(Payload::add(value)).await?.hash)
    }

    pub async fn del(&self, hash: &Hash) -> Result<Hash, StoreError> {
        Ok(self
            .store
            .log()
            .append(Payload::del(hex::encode(hash)))
            .await?
            .hash)
    }

    pub async fn all(&self) -> Result<Vec<ListEntry>, StoreError> {
        Ok(materialize_feed(&self.store.entries().await?))
    }

    pub async fn values(&self) -> Result<Vec<Value>, StoreError> {
        Ok(self.all().await?.into_iter().map(|e| e.value).collect())
    }
}
