//! Plain key-value store: the most recent `PUT`/`DEL` of a key decides it.

use crate::error::StoreError;
use crate::store::entry::{LogEntry, Op, Payload};
use crate::store::Store;
use crate::types::{Hash, Map, Value};
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, PartialEq)]
pub struct KvEntry {
    pub key: String,
    pub value: Value,
    pub hash: Hash,
}

/// Materialize a traversal (newest first) into entries sorted by key.
pub fn materialize_key_value(entries: &[LogEntry]) -> Vec<KvEntry> {
    let mut decided: HashSet<&str> = HashSet::new();
    let mut present: BTreeMap<String, KvEntry> = BTreeMap::new();

    for entry in entries {
        let Some(key) = entry.payload.key.as_deref() else {
            continue;
        };
        if decided.contains(key) {
            continue;
        }
        match entry.payload.op {
            Op::Put => {
                decided.insert(key);
                present.insert(
                    key.to_string(),
                    KvEntry {
                        key: key.to_string(),
                        value: entry.payload.value.clone().unwrap_or(Value::Null),
                        hash: entry.hash,
                    },
                );
            }
            Op::Del => {
                decided.insert(key);
            }
            Op::Move | Op::Add => {}
        }
    }

    present.into_values().collect()
}

pub fn to_map(entries: Vec<KvEntry>) -> Map {
    entries.into_iter().map(|e| (e.key, e.value)).collect()
}

/// Key-value view over an open store.
#[derive(Debug, Clone)]
pub struct KeyValueStore {
    store: Store,
}

impl KeyValueStore {
    pub(crate) fn new(store: Store) -> Self {
        KeyValueStore { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub async fn put(&self, key: &str, value: Value) -> Result<Hash, StoreError> {
        Ok(self.store.log().append(Payload::put(key, value)).await?.hash)
    }

    pub async fn del(&self, key: &str) -> Result<Hash, StoreError> {
        Ok(self.store.log().append(Payload::del(key)).await?.hash)
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        for entry in self.store.entries().await? {
            if entry.payload.key.as_deref() != Some(key) {
                continue;
            }
            match entry.payload.op {
                Op::Put => return Ok(Some(entry.payload.value.unwrap_or(Value::Null))),
                Op::Del => return Ok(None),
                Op::Move | Op::Add => {}
            }
        }
        Ok(None)
    }

    pub async fn all(&self) -> Result<Vec<KvEntry>, StoreError> {
        Ok(materialize_key_value(&self.store.entries().await?))
    }

    pub async fn as_map(&self) -> Result<Map, StoreError> {
        Ok(to_map(self.all().await?))
    }
}
