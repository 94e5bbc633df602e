//! Set store: elements identified by deep value equality.

use crate::error::StoreError;
use crate::store::entry::{LogEntry, Op, Payload};
use crate::store::Store;
use crate::types::{Hash, Value};
use std::collections::HashSet;

/// A list element together with the hash of the entry that put it there.
#[derive(Debug, Clone, PartialEq)]
pub struct ListEntry {
    pub value: Value,
    pub hash: Hash,
}

/// Canonical identity of an element. `serde_json` maps are key-sorted, so equal
/// values always encode identically.
pub(crate) fn element_key(value: &Value) -> String {
    value.to_string()
}

/// Materialize a traversal (newest first). The most recent `ADD`/`DEL` of an
/// element decides it; present elements come out ordered by the age of their
/// deciding `ADD`, oldest first.
pub fn materialize_set(entries: &[LogEntry]) -> Vec<ListEntry> {
    let mut decided: HashSet<String> = HashSet::new();
    let mut present = Vec::new();

    for entry in entries {
        let Some(value) = entry.payload.value.as_ref() else {
            continue;
        };
        match entry.payload.op {
            Op::Add => {
                if decided.insert(element_key(value)) {
                    present.push(ListEntry {
                        value: value.clone(),
                        hash: entry.hash,
                    });
                }
            }
            Op::Del => {
                decided.insert(element_key(value));
            }
            Op::Put | Op::Move => {}
        }
    }

    present.reverse();
    present
}

#[derive(Debug, Clone)]
pub struct SetStore {
    store: Store,
}

impl SetStore {
    pub(crate) fn new(store: Store) -> Self {
        SetStore { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub async fn add(&self, value: Value) -> Result<Hash, StoreError> {
        Ok(self.store.log().append(Payload::add(value)).await?.hash)
    }

    pub async fn del(&self, value: Value) -> Result<Hash, StoreError> {
        Ok(self.store.log().append(Payload::del_value(value)).await?.hash)
    }

    pub async fn contains(&self, value: &Value) -> Result<bool, StoreError> {
        Ok(self.all().await?.iter().any(|e| &e.value == value))
    }

    pub async fn all(&self) -> Result<Vec<ListEntry>, StoreError> {
        Ok(materialize_set(&self.store.entries().await?))
    }

    pub async fn values(&self) -> Result<Vec<Value>, StoreError> {
        Ok(self.all().await?.into_iter().map(|e| e.value).collect())
    }
}
