//! Engine-owned registry
//!
//! Per-key mutual exclusion and the follow cache. One registry belongs to one
//! [`crate::engine::Engine`]; nothing here is process-global.

use crate::live::cache::FollowCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::trace;

type Slot = Arc<tokio::sync::Mutex<()>>;

/// Semaphore-by-key: at most one holder per key at a time.
///
/// Slots are created on demand and dropped once nobody holds or waits on them.
#[derive(Default)]
pub struct KeyedLocks {
    slots: Mutex<HashMap<String, Slot>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn acquire(self: &Arc<Self>, key: impl Into<String>) -> KeyedGuard {
        let key = key.into();
        let slot = {
            let mut slots = self.slots.lock();
            slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        trace!(key = %key, "Waiting for keyed lock");
        let guard = slot.clone().lock_owned().await;
        KeyedGuard {
            locks: self.clone(),
            key,
            slot,
            guard: Some(guard),
        }
    }

    /// Number of keys currently held or awaited.
    pub fn active_keys(&self) -> usize {
        self.slots.lock().len()
    }
}

/// Exclusive access to one key; released on drop.
pub struct KeyedGuard {
    locks: Arc<KeyedLocks>,
    key: String,
    slot: Slot,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut slots = self.locks.slots.lock();
        // Map entry plus our own clone: nobody else is waiting.
        let idle = Arc::strong_count(&self.slot) == 2;
        let same = slots
            .get(&self.key)
            .map(|s| Arc::ptr_eq(s, &self.slot))
            .unwrap_or(false);
        if idle && same {
            slots.remove(&self.key);
        }
    }
}

/// Lock table and follow cache of one engine instance.
#[derive(Clone, Default)]
pub struct Registry {
    locks: Arc<KeyedLocks>,
    cache: FollowCache,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn locks(&self) -> &Arc<KeyedLocks> {
        &self.locks
    }

    pub fn cache(&self) -> &FollowCache {
        &self.cache
    }
}
