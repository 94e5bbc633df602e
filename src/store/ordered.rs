//! Ordered key-value store
//!
//! `PUT` carries an optional position, `MOVE` repositions a key, `DEL` removes
//! it. Materialization walks the log newest first:
//!
//! - the first `PUT` or `DEL` seen for a key decides it;
//! - a `MOVE` seen before the deciding `PUT` overrides that `PUT`'s position;
//!   older moves overwrite newer ones, so the move applied last wins;
//! - each decided key is spliced into the output as soon as it is decided, at
//!   its resolved position, or appended when it has none. Older keys spliced
//!   later shift the ones already placed.

use crate::error::StoreError;
use crate::store::entry::{LogEntry, Op, Payload};
use crate::store::Store;
use crate::types::{Hash, Value};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Value as stored by `PUT`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionedValue {
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<i64>,
}

/// Materialized element: `{key, value, hash}`.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderedEntry {
    pub key: String,
    pub value: Value,
    pub hash: Hash,
}

/// A decided key with its resolved position (`None`: append).
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEntry {
    pub key: String,
    pub value: Value,
    pub position: Option<i64>,
    pub hash: Hash,
}

fn decode_put(value: Option<&Value>) -> PositionedValue {
    match value {
        Some(raw) => serde_json::from_value::<PositionedValue>(raw.clone()).unwrap_or_else(|_| {
            PositionedValue {
                value: raw.clone(),
                position: None,
            }
        }),
        None => PositionedValue {
            value: Value::Null,
            position: None,
        },
    }
}

/// Decided keys in traversal order, at most `amount` of them.
pub fn iterate_ordered(entries: &[LogEntry], amount: Option<usize>) -> Vec<ResolvedEntry> {
    let mut decided: HashSet<&str> = HashSet::new();
    let mut overlay: HashMap<&str, i64> = HashMap::new();
    let mut out = Vec::new();

    for entry in entries {
        if amount.is_some_and(|limit| out.len() >= limit) {
            break;
        }
        let Some(key) = entry.payload.key.as_deref() else {
            continue;
        };
        if decided.contains(key) {
            continue;
        }
        match entry.payload.op {
            Op::Put => {
                decided.insert(key);
                let put = decode_put(entry.payload.value.as_ref());
                let position = overlay.get(key).copied().or(put.position);
                out.push(ResolvedEntry {
                    key: key.to_string(),
                    value: put.value,
                    position,
                    hash: entry.hash,
                });
            }
            Op::Move => {
                if let Some(position) = entry.payload.value.as_ref().and_then(Value::as_i64) {
                    overlay.insert(key, position);
                }
            }
            Op::Del => {
                decided.insert(key);
            }
            Op::Add => {}
        }
    }

    out
}

/// Array-splice index: past the end appends, negative counts from the end.
pub(crate) fn splice_index(position: i64, len: usize) -> usize {
    let len_i = len as i64;
    if position < 0 {
        (len_i + position).max(0) as usize
    } else {
        position.min(len_i) as usize
    }
}

/// Materialize a traversal (newest first) into the ordered sequence.
pub fn materialize_ordered(entries: &[LogEntry]) -> Vec<OrderedEntry> {
    let resolved = iterate_ordered(entries, None);
    let mut out: Vec<OrderedEntry> = Vec::with_capacity(resolved.len());
    for entry in resolved {
        let index = match entry.position {
            Some(position) => splice_index(position, out.len()),
            None => out.len(),
        };
        out.insert(
            index,
            OrderedEntry {
                key: entry.key,
                value: entry.value,
                hash: entry.hash,
            },
        );
    }
    out
}

#[derive(Debug, Clone)]
pub struct OrderedKeyValueStore {
    store: Store,
}

impl OrderedKeyValueStore {
    pub(crate) fn new(store: Store) -> Self {
        OrderedKeyValueStore { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub async fn put(
        &self,
        key: &str,
        value: Value,
        position: Option<i64>,
    ) -> Result<Hash, StoreError> {
        let encoded = serde_json::to_value(PositionedValue { value, position })
            .map_err(|e| StoreError::MalformedEntry(e.to_string()))?;
        Ok(self.store.log().append(Payload::put(key, encoded)).await?.hash)
    }

    pub async fn move_to(&self, key: &str, position: i64) -> Result<Hash, StoreError> {
        Ok(self
            .store
            .log()
            .append(Payload::move_to(key, position))
            .await?
            .hash)
    }

    pub async fn del(&self, key: &str) -> Result<Hash, StoreError> {
        Ok(self.store.log().append(Payload::del(key)).await?.hash)
    }

    /// Current value and resolved position of `key`.
    pub async fn get(&self, key: &str) -> Result<Option<PositionedValue>, StoreError> {
        Ok(iterate_ordered(&self.store.entries().await?, None)
            .into_iter()
            .find(|e| e.key == key)
            .map(|e| PositionedValue {
                value: e.value,
                position: e.position,
            }))
    }

    pub async fn iterator(&self, amount: Option<usize>) -> Result<Vec<ResolvedEntry>, StoreError> {
        Ok(iterate_ordered(&self.store.entries().await?, amount))
    }

    pub async fn all(&self) -> Result<Vec<OrderedEntry>, StoreError> {
        Ok(materialize_ordered(&self.store.entries().await?))
    }
}
