//! Named child stores
//!
//! A slot is a key of a parent key-value store whose value is the address of
//! a child store. Two replicas may each create the child before they
//! converge; the loser is folded into the canonical child the next time this
//! replica resolves the slot.

use super::{MergeTask, Merger, OpenStores};
use crate::error::EngineError;
use crate::store::{KeyValueStore, StoreKind};
use crate::types::Address;
use tracing::{debug, info, warn};

fn slot_key(parent: &Address, name: &str) -> String {
    format!("slot:{}:{}", parent, name)
}

impl Merger {
    /// Get or create the child store named `name` under `parent`.
    ///
    /// Without `kind`, only an existing child is returned. With `kind`, an
    /// existing child must be of that variant, and a missing one is created
    /// if the local identity may write the parent. `Ok(None)` means there is
    /// no child and none could be created.
    pub async fn resolve_slot(
        &self,
        parent: &str,
        name: &str,
        kind: Option<StoreKind>,
    ) -> Result<Option<Address>, EngineError> {
        let parent = Address::parse(parent)?;
        let key = slot_key(&parent, name);
        let _guard = self.locks.acquire(key.clone()).await;

        let mut stores = OpenStores::default();
        let result = self.resolve_opened(&parent, name, &key, kind, &mut stores).await;
        stores.close_all().await;
        result
    }

    async fn resolve_opened(
        &self,
        parent: &Address,
        name: &str,
        key: &str,
        kind: Option<StoreKind>,
        stores: &mut OpenStores,
    ) -> Result<Option<Address>, EngineError> {
        let root = stores
            .open(&self.provider, parent, Some(StoreKind::KeyValue))
            .await?
            .key_value()?;
        let mut current = root
            .get(name)
            .await?
            .and_then(|value| Address::from_value(&value));

        if let Some(canonical) = &current {
            if let Some(stale) = self.pointers.get(key)? {
                if &stale != canonical {
                    self.heal(canonical, &stale, key).await;
                }
            }
        }

        match (&current, kind) {
            (Some(address), Some(kind)) => {
                let child = self.provider.open_as(address, kind).await?;
                child.close().await;
            }
            (None, Some(kind)) => {
                current = self.create_child(parent, name, kind, &root).await?;
            }
            _ => {}
        }

        if let Some(address) = &current {
            self.pointers.set(key, address)?;
        }
        Ok(current)
    }

    async fn create_child(
        &self,
        parent: &Address,
        name: &str,
        kind: StoreKind,
        root: &KeyValueStore,
    ) -> Result<Option<Address>, EngineError> {
        if !self.provider.can_write(parent).await? {
            debug!(parent = %parent, slot = name, "Parent not writable, leaving slot empty");
            return Ok(None);
        }
        let access = self.provider.access_policy(parent).await?;
        let child = self.provider.create(kind, access).await?;
        root.put(name, child.to_value()).await?;
        info!(parent = %parent, slot = name, child = %child, kind = %kind, "Created slot store");
        Ok(Some(child))
    }

    /// Fold the locally remembered `stale` child into `canonical` and delete it.
    /// Failures leave both stores in place.
    async fn heal(&self, canonical: &Address, stale: &Address, key: &str) {
        match self
            .merge(MergeTask::new(canonical.clone(), stale.clone()))
            .await
        {
            Ok(report) => {
                if let Err(e) = self.provider.delete(stale).await {
                    warn!(stale = %stale, error = %e, "Failed to delete stale slot store");
                }
                if let Err(e) = self.pointers.set(key, canonical) {
                    warn!(key, error = %e, "Failed to update slot pointer");
                }
                info!(
                    canonical = %canonical,
                    stale = %stale,
                    writes = report.writes,
                    "Folded stale slot store"
                );
            }
            Err(e) => {
                warn!(canonical = %canonical, stale = %stale, error = %e, "Failed to fold stale slot store");
            }
        }
    }

    /// Copy every pair of the dictionary under `key` in `base_parent` into the
    /// dictionary under `key` in `new_parent`. Returns the number of pairs written.
    pub async fn copy_dict_content(
        &self,
        base_parent: &str,
        new_parent: &str,
        key: &str,
    ) -> Result<usize, EngineError> {
        let base_parent = Address::parse(base_parent)?;
        let new_parent = Address::parse(new_parent)?;
        let mut stores = OpenStores::default();
        let result = self
            .copy_opened(&base_parent, &new_parent, key, &mut stores)
            .await;
        stores.close_all().await;
        result
    }

    async fn copy_opened(
        &self,
        base_parent: &Address,
        new_parent: &Address,
        key: &str,
        stores: &mut OpenStores,
    ) -> Result<usize, EngineError> {
        let kind = Some(StoreKind::KeyValue);
        let source_parent = stores.open(&self.provider, base_parent, kind).await?.key_value()?;
        let Some(source) = source_parent.get(key).await?.and_then(|v| Address::from_value(&v)) else {
            return Ok(0);
        };

        let target_parent = stores.open(&self.provider, new_parent, kind).await?.key_value()?;
        let target = match target_parent.get(key).await? {
            Some(value) => Address::from_value(&value).ok_or_else(|| {
                EngineError::InvalidElement(format!("{} under {:?} is not a store address", value, key))
            })?,
            None => {
                return Err(EngineError::InvalidElement(format!(
                    "{} has no dictionary under {:?}",
                    new_parent, key
                )))
            }
        };

        let source = stores.open(&self.provider, &source, kind).await?.key_value()?;
        let target = stores.open(&self.provider, &target, kind).await?.key_value()?;
        let pairs = source.as_map().await?;
        for (name, value) in &pairs {
            target.put(name, value.clone()).await?;
        }
        debug!(source = %base_parent, target = %new_parent, key, pairs = pairs.len(), "Copied dictionary");
        Ok(pairs.len())
    }
}
