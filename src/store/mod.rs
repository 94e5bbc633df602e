//! Mutable Stores
//!
//! CRDT-backed stores materialized from an append-only causal log. The log
//! itself (storage, replication, causal ordering) belongs to a store provider;
//! this module defines the provider boundary and the four store variants.

pub mod entry;
pub mod feed;
pub mod kv;
pub mod memory;
pub mod ordered;
pub mod persistence;
pub mod set;

pub use entry::{Clock, LogEntry, Op, Payload};
pub use feed::FeedStore;
pub use kv::{KeyValueStore, KvEntry};
pub use memory::{LocalProvider, ProviderStats};
pub use ordered::{OrderedEntry, OrderedKeyValueStore, PositionedValue};
pub use persistence::SledLogStorage;
pub use set::{ListEntry, SetStore};

use crate::error::StoreError;
use crate::types::{is_valid_address, Address, Map};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::broadcast;

/// The closed set of store variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreKind {
    #[serde(rename = "keyvalue")]
    KeyValue,
    #[serde(rename = "feed")]
    Feed,
    #[serde(rename = "set")]
    Set,
    #[serde(rename = "ordered-keyvalue")]
    OrderedKeyValue,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::KeyValue => "keyvalue",
            StoreKind::Feed => "feed",
            StoreKind::Set => "set",
            StoreKind::OrderedKeyValue => "ordered-keyvalue",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keyvalue" => Ok(StoreKind::KeyValue),
            "feed" => Ok(StoreKind::Feed),
            "set" => Ok(StoreKind::Set),
            "ordered-keyvalue" => Ok(StoreKind::OrderedKeyValue),
            other => Err(format!("Unknown store kind: {}", other)),
        }
    }
}

/// Wildcard writer identity.
pub const ANY_WRITER: &str = "*";

/// Writer list attached to a store at creation.
///
/// Authorization decisions beyond this list belong to the access-control
/// collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPolicy {
    writers: BTreeSet<String>,
}

impl AccessPolicy {
    /// Anyone may write.
    pub fn open() -> Self {
        Self::writers([ANY_WRITER])
    }

    pub fn writers<I, S>(writers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AccessPolicy {
            writers: writers.into_iter().map(Into::into).collect(),
        }
    }

    pub fn grant(&mut self, identity: impl Into<String>) {
        self.writers.insert(identity.into());
    }

    pub fn allows(&self, identity: &str) -> bool {
        self.writers.contains(ANY_WRITER) || self.writers.contains(identity)
    }
}

/// Immutable description of a store, fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub kind: StoreKind,
    pub access: AccessPolicy,
    pub creator: String,
    pub nonce: u64,
}

/// One open handle on a store's causal log, supplied by the provider.
#[async_trait]
pub trait OpLog: Send + Sync {
    /// Append one entry whose predecessors are the current heads.
    async fn append(&self, payload: Payload) -> Result<LogEntry, StoreError>;

    /// All entries, most recent first.
    async fn traverse(&self) -> Result<Vec<LogEntry>, StoreError>;

    async fn heads(&self) -> Result<Vec<LogEntry>, StoreError>;

    /// Notification fired after every successful append or replicated join.
    fn updates(&self) -> broadcast::Receiver<()>;

    /// Release the handle. Idempotent.
    async fn close(&self);
}

/// Store provider capability: the boundary with the replicated-log layer.
#[async_trait]
pub trait StoreProvider: Send + Sync {
    /// Identity appends are attributed to.
    fn identity(&self) -> &str;

    async fn open(&self, address: &Address) -> Result<Store, StoreError>;

    async fn create(&self, kind: StoreKind, access: AccessPolicy) -> Result<Address, StoreError>;

    async fn delete(&self, address: &Address) -> Result<(), StoreError>;

    async fn access_policy(&self, address: &Address) -> Result<AccessPolicy, StoreError>;

    async fn can_write(&self, address: &Address) -> Result<bool, StoreError> {
        let identity = self.identity().to_string();
        Ok(self.access_policy(address).await?.allows(&identity))
    }

    /// Open and check the variant. The handle is closed again on mismatch.
    async fn open_as(&self, address: &Address, kind: StoreKind) -> Result<Store, StoreError> {
        let store = self.open(address).await?;
        if let Err(e) = store.expect_kind(kind) {
            store.close().await;
            return Err(e);
        }
        Ok(store)
    }

    fn is_valid_address(&self, raw: &str) -> bool {
        is_valid_address(raw)
    }
}

/// An open store: address, variant and a log handle.
///
/// Clones share the same handle; `close` releases it for every clone.
#[derive(Clone)]
pub struct Store {
    address: Address,
    kind: StoreKind,
    log: Arc<dyn OpLog>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("address", &self.address)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Materialized content of any variant.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Dict(Map),
    Ordered(Vec<OrderedEntry>),
    List(Vec<ListEntry>),
}

impl Store {
    pub fn new(address: Address, kind: StoreKind, log: Arc<dyn OpLog>) -> Self {
        Store { address, kind, log }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    pub fn log(&self) -> &Arc<dyn OpLog> {
        &self.log
    }

    pub fn updates(&self) -> broadcast::Receiver<()> {
        self.log.updates()
    }

    pub async fn heads(&self) -> Result<Vec<LogEntry>, StoreError> {
        self.log.heads().await
    }

    pub async fn entries(&self) -> Result<Vec<LogEntry>, StoreError> {
        self.log.traverse().await
    }

    pub async fn close(&self) {
        self.log.close().await
    }

    pub fn expect_kind(&self, expected: StoreKind) -> Result<(), StoreError> {
        if self.kind == expected {
            Ok(())
        } else {
            Err(StoreError::TypeMismatch {
                address: self.address.to_string(),
                expected,
                actual: self.kind,
            })
        }
    }

    pub fn key_value(&self) -> Result<KeyValueStore, StoreError> {
        self.expect_kind(StoreKind::KeyValue)?;
        Ok(KeyValueStore::new(self.clone()))
    }

    pub fn feed(&self) -> Result<FeedStore, StoreError> {
        self.expect_kind(StoreKind::Feed)?;
        Ok(FeedStore::new(self.clone()))
    }

    pub fn set(&self) -> Result<SetStore, StoreError> {
        self.expect_kind(StoreKind::Set)?;
        Ok(SetStore::new(self.clone()))
    }

    pub fn ordered_key_value(&self) -> Result<OrderedKeyValueStore, StoreError> {
        self.expect_kind(StoreKind::OrderedKeyValue)?;
        Ok(OrderedKeyValueStore::new(self.clone()))
    }

    /// Materialize whatever variant this store is.
    pub async fn materialize(&self) -> Result<Content, StoreError> {
        let entries = self.entries().await?;
        Ok(match self.kind {
            StoreKind::KeyValue => Content::Dict(kv::to_map(kv::materialize_key_value(&entries))),
            StoreKind::OrderedKeyValue => Content::Ordered(ordered::materialize_ordered(&entries)),
            StoreKind::Set => Content::List(set::materialize_set(&entries)),
            StoreKind::Feed => Content::List(feed::materialize_feed(&entries)),
        })
    }
}
