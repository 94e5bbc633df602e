//! Causal log entries
//!
//! An entry is immutable once created. Its hash covers the Lamport clock, the
//! causal predecessors and the payload, so two replicas that hold the same
//! entries agree on every hash.

use crate::error::StoreError;
use crate::types::{Hash, Value};
use blake3::Hasher;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Operation carried by a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Op {
    Put,
    Del,
    Move,
    Add,
}

/// Entry payload: `{op, key?, value?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub op: Op,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl Payload {
    pub fn put(key: impl Into<String>, value: Value) -> Self {
        Payload {
            op: Op::Put,
            key: Some(key.into()),
            value: Some(value),
        }
    }

    pub fn del(key: impl Into<String>) -> Self {
        Payload {
            op: Op::Del,
            key: Some(key.into()),
            value: None,
        }
    }

    pub fn move_to(key: impl Into<String>, position: i64) -> Self {
        Payload {
            op: Op::Move,
            key: Some(key.into()),
            value: Some(Value::from(position)),
        }
    }

    pub fn add(value: Value) -> Self {
        Payload {
            op: Op::Add,
            key: None,
            value: Some(value),
        }
    }

    /// Removal of a set element, identified by value.
    pub fn del_value(value: Value) -> Self {
        Payload {
            op: Op::Del,
            key: None,
            value: Some(value),
        }
    }
}

/// Lamport clock: ordered by `time`, ties broken by writer `id`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Clock {
    pub time: u64,
    pub id: String,
}

/// One immutable record of a store's causal log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub hash: Hash,
    pub clock: Clock,
    /// Causal predecessors (the heads at the time of the append).
    pub next: Vec<Hash>,
    pub payload: Payload,
}

#[derive(Serialize)]
struct HashInput<'a> {
    clock: &'a Clock,
    next: Vec<String>,
    payload: &'a Payload,
}

/// Compute an entry hash: blake3 over the canonical JSON of clock, sorted predecessors and payload.
pub fn compute_entry_hash(
    clock: &Clock,
    next: &[Hash],
    payload: &Payload,
) -> Result<Hash, StoreError> {
    let mut next: Vec<String> = next.iter().map(hex::encode).collect();
    next.sort();
    let input = HashInput {
        clock,
        next,
        payload,
    };
    let bytes = serde_json::to_vec(&input)
        .map_err(|e| StoreError::MalformedEntry(format!("Failed to encode entry: {}", e)))?;

    let mut hasher = Hasher::new();
    hasher.update(b"entry:");
    hasher.update(&bytes);
    Ok(*hasher.finalize().as_bytes())
}

impl LogEntry {
    pub fn new(clock: Clock, next: Vec<Hash>, payload: Payload) -> Result<Self, StoreError> {
        let hash = compute_entry_hash(&clock, &next, &payload)?;
        Ok(LogEntry {
            hash,
            clock,
            next,
            payload,
        })
    }

    /// Recompute the hash and compare (corruption / forgery detection on replication).
    pub fn verify(&self) -> bool {
        compute_entry_hash(&self.clock, &self.next, &self.payload)
            .map(|h| h == self.hash)
            .unwrap_or(false)
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }
}

/// Most-recent-first ordering: clock descending, then hash descending.
pub fn traversal_order(a: &LogEntry, b: &LogEntry) -> Ordering {
    b.clock.cmp(&a.clock).then_with(|| b.hash.cmp(&a.hash))
}

/// Sort entries into traversal order (newest first).
///
/// A predecessor always has a strictly smaller clock time than its successors,
/// so the result is a linear extension of causal order that does not depend on
/// arrival order.
pub fn sort_for_traversal(entries: &mut [LogEntry]) {
    entries.sort_by(traversal_order);
}
