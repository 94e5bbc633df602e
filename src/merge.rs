//! Merge Engine
//!
//! Folds an independently evolved store into a base store of the same
//! variant, recursing into nested stores wherever both sides hold an address
//! under the same key or field.
//!
//! Conflict policy: when both sides hold different values that are not both
//! addresses, the base value stays and nothing is written. Merges are not
//! transactional; a failure part-way leaves earlier writes in place.

pub mod pointers;
mod slots;

pub use pointers::{MemoryPointerCache, PointerCache, SledPointerCache};

use crate::error::{EngineError, StoreError};
use crate::registry::KeyedLocks;
use crate::store::{FeedStore, KeyValueStore, OrderedKeyValueStore, SetStore, Store, StoreKind, StoreProvider};
use crate::types::{Address, Map, Value};
use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::ops::AddAssign;
use std::sync::Arc;
use tracing::{debug, info};

/// One merge request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeTask {
    pub base: Address,
    pub incoming: Address,
    /// Expected variant of both stores; taken from `base` when absent.
    pub kind: Option<StoreKind>,
    /// Fields that identify a structured set element.
    pub identity_fields: Option<Vec<String>>,
}

impl MergeTask {
    pub fn new(base: Address, incoming: Address) -> Self {
        MergeTask {
            base,
            incoming,
            kind: None,
            identity_fields: None,
        }
    }

    pub fn with_kind(mut self, kind: StoreKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_identity_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.identity_fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }
}

/// What a merge did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Entries appended to base stores (nested ones included).
    pub writes: usize,
    /// Nested store pairs merged recursively.
    pub nested: usize,
    /// Differing values where the base was kept.
    pub conflicts: usize,
}

impl MergeReport {
    fn wrote(n: usize) -> Self {
        MergeReport {
            writes: n,
            ..Default::default()
        }
    }
}

impl AddAssign for MergeReport {
    fn add_assign(&mut self, other: Self) {
        self.writes += other.writes;
        self.nested += other.nested;
        self.conflicts += other.conflicts;
    }
}

/// Handles opened during one operation; closed together on every path.
#[derive(Default)]
pub(crate) struct OpenStores {
    stores: Vec<Store>,
}

impl OpenStores {
    pub(crate) async fn open(
        &mut self,
        provider: &Arc<dyn StoreProvider>,
        address: &Address,
        kind: Option<StoreKind>,
    ) -> Result<Store, StoreError> {
        let store = match kind {
            Some(kind) => provider.open_as(address, kind).await?,
            None => provider.open(address).await?,
        };
        self.stores.push(store.clone());
        Ok(store)
    }

    pub(crate) async fn close_all(self) {
        for store in self.stores {
            store.close().await;
        }
    }
}

type Visited = HashSet<(Address, Address)>;

/// Merge engine of one engine instance.
#[derive(Clone)]
pub struct Merger {
    provider: Arc<dyn StoreProvider>,
    locks: Arc<KeyedLocks>,
    pointers: Arc<dyn PointerCache>,
}

impl Merger {
    pub fn new(
        provider: Arc<dyn StoreProvider>,
        locks: Arc<KeyedLocks>,
        pointers: Arc<dyn PointerCache>,
    ) -> Self {
        Merger {
            provider,
            locks,
            pointers,
        }
    }

    pub fn pointers(&self) -> &Arc<dyn PointerCache> {
        &self.pointers
    }

    /// Merge `incoming` into `base`, dispatching on the base variant.
    pub async fn merge_into(&self, base: &str, incoming: &str) -> Result<MergeReport, EngineError> {
        let task = MergeTask::new(Address::parse(base)?, Address::parse(incoming)?);
        self.merge(task).await
    }

    pub async fn merge(&self, task: MergeTask) -> Result<MergeReport, EngineError> {
        let (base, incoming) = (task.base.clone(), task.incoming.clone());
        let mut visited = Visited::new();
        let report = self.merge_task(task, &mut visited).await?;
        info!(
            base = %base,
            incoming = %incoming,
            writes = report.writes,
            nested = report.nested,
            conflicts = report.conflicts,
            "Merged stores"
        );
        Ok(report)
    }

    fn merge_task<'a>(
        &'a self,
        task: MergeTask,
        visited: &'a mut Visited,
    ) -> BoxFuture<'a, Result<MergeReport, EngineError>> {
        Box::pin(async move {
            if task.base == task.incoming {
                debug!(address = %task.base, "Merging a store into itself, nothing to do");
                return Ok(MergeReport::default());
            }
            if !visited.insert((task.base.clone(), task.incoming.clone())) {
                return Ok(MergeReport::default());
            }

            let mut stores = OpenStores::default();
            let result = self.merge_opened(&task, &mut stores, visited).await;
            stores.close_all().await;
            result
        })
    }

    async fn merge_opened(
        &self,
        task: &MergeTask,
        stores: &mut OpenStores,
        visited: &mut Visited,
    ) -> Result<MergeReport, EngineError> {
        let base = stores.open(&self.provider, &task.base, task.kind).await?;
        let incoming = stores.open(&self.provider, &task.incoming, Some(base.kind())).await?;

        match base.kind() {
            StoreKind::KeyValue => {
                self.merge_key_value(base.key_value()?, incoming.key_value()?, visited)
                    .await
            }
            StoreKind::OrderedKeyValue => {
                self.merge_ordered(base.ordered_key_value()?, incoming.ordered_key_value()?, visited)
                    .await
            }
            StoreKind::Set => match &task.identity_fields {
                Some(fields) => {
                    self.merge_indexed_set(base.set()?, incoming.set()?, fields, visited)
                        .await
                }
                None => merge_set(base.set()?, incoming.set()?).await,
            },
            StoreKind::Feed => merge_feed(base.feed()?, incoming.feed()?).await,
        }
    }

    /// Both values differ. Recurse if both are addresses, otherwise keep the base.
    async fn reconcile(
        &self,
        label: &str,
        current: &Value,
        incoming: &Value,
        visited: &mut Visited,
    ) -> Result<MergeReport, EngineError> {
        match (Address::from_value(current), Address::from_value(incoming)) {
            (Some(base), Some(other)) => {
                let mut report = self.merge_task(MergeTask::new(base, other), visited).await?;
                report.nested += 1;
                Ok(report)
            }
            _ => {
                debug!(key = label, "Values differ, keeping base");
                Ok(MergeReport {
                    conflicts: 1,
                    ..Default::default()
                })
            }
        }
    }

    async fn merge_key_value(
        &self,
        base: KeyValueStore,
        incoming: KeyValueStore,
        visited: &mut Visited,
    ) -> Result<MergeReport, EngineError> {
        let existing = base.as_map().await?;
        let mut report = MergeReport::default();
        for (key, value) in incoming.as_map().await? {
            match existing.get(&key) {
                Some(current) if *current == value => {}
                None | Some(Value::Null) => {
                    if value.is_null() {
                        continue;
                    }
                    base.put(&key, value).await?;
                    report.writes += 1;
                }
                Some(current) => report += self.reconcile(&key, current, &value, visited).await?,
            }
        }
        Ok(report)
    }

    async fn merge_ordered(
        &self,
        base: OrderedKeyValueStore,
        incoming: OrderedKeyValueStore,
        visited: &mut Visited,
    ) -> Result<MergeReport, EngineError> {
        let existing: HashMap<String, Value> = base
            .all()
            .await?
            .into_iter()
            .map(|entry| (entry.key, entry.value))
            .collect();
        let mut report = MergeReport::default();
        for (index, entry) in incoming.all().await?.into_iter().enumerate() {
            match existing.get(&entry.key) {
                Some(current) if *current == entry.value => {}
                None | Some(Value::Null) => {
                    if entry.value.is_null() {
                        continue;
                    }
                    base.put(&entry.key, entry.value, Some(index as i64)).await?;
                    report.writes += 1;
                }
                Some(current) => {
                    report += self
                        .reconcile(&entry.key, current, &entry.value, visited)
                        .await?
                }
            }
        }
        Ok(report)
    }

    async fn merge_indexed_set(
        &self,
        base: SetStore,
        incoming: SetStore,
        fields: &[String],
        visited: &mut Visited,
    ) -> Result<MergeReport, EngineError> {
        let mut existing = base.values().await?;
        let mut report = MergeReport::default();

        for element in incoming.values().await? {
            let Some(other) = element.as_object() else {
                return Err(EngineError::InvalidElement(format!(
                    "set elements matched by identity fields must be dictionaries, found {}",
                    element
                )));
            };
            let found = existing.iter().position(|candidate| {
                candidate
                    .as_object()
                    .map(|current| same_identity(current, other, fields))
                    .unwrap_or(false)
            });

            let Some(index) = found else {
                base.add(element.clone()).await?;
                existing.push(element);
                report.writes += 1;
                continue;
            };
            if existing[index] == element {
                continue;
            }

            let current = existing[index].clone();
            let mut combined = current.as_object().cloned().unwrap_or_default();
            for (name, value) in other {
                match field(&combined, name).cloned() {
                    None => {
                        if !value.is_null() {
                            combined.insert(name.clone(), value.clone());
                        }
                    }
                    Some(have) if have == *value => {}
                    Some(have) => report += self.reconcile(name, &have, value, visited).await?,
                }
            }

            let combined = Value::Object(combined);
            if combined != current {
                base.del(current).await?;
                base.add(combined.clone()).await?;
                existing.remove(index);
                existing.push(combined);
                report.writes += 2;
            }
        }
        Ok(report)
    }
}

/// Null and missing fields are the same thing.
fn field<'a>(element: &'a Map, name: &str) -> Option<&'a Value> {
    element.get(name).filter(|v| !v.is_null())
}

fn same_identity(current: &Map, other: &Map, fields: &[String]) -> bool {
    fields.iter().all(|f| field(current, f) == field(other, f))
}

async fn merge_set(base: SetStore, incoming: SetStore) -> Result<MergeReport, EngineError> {
    let mut existing = base.values().await?;
    let mut writes = 0;
    for value in incoming.values().await? {
        if !existing.contains(&value) {
            base.add(value.clone()).await?;
            existing.push(value);
            writes += 1;
        }
    }
    Ok(MergeReport::wrote(writes))
}

async fn merge_feed(base: FeedStore, incoming: FeedStore) -> Result<MergeReport, EngineError> {
    let mut existing = base.values().await?;
    let mut writes = 0;
    for value in incoming.values().await? {
        if !existing.contains(&value) {
            base.add(value.clone()).await?;
            existing.push(value);
            writes += 1;
        }
    }
    Ok(MergeReport::wrote(writes))
}
