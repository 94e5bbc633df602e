//! In-process store provider
//!
//! `LocalProvider` keeps every log in memory (optionally backed by
//! [`SledLogStorage`]) and stands in for the replicated-log layer: one provider
//! is one replica with one writer identity, and `replicate_from` plays the
//! role of gossip between replicas.

use crate::error::StoreError;
use crate::store::entry::{sort_for_traversal, Clock, LogEntry, Payload};
use crate::store::persistence::SledLogStorage;
use crate::store::{AccessPolicy, Manifest, OpLog, Store, StoreKind, StoreProvider};
use crate::types::{Address, Hash};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tracing::{debug, warn};

const UPDATE_CHANNEL_CAPACITY: usize = 64;

fn next_nonce() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    now.wrapping_add(COUNTER.fetch_add(1, Ordering::Relaxed))
}

fn derive_address(manifest: &Manifest) -> Result<Address, StoreError> {
    let bytes = bincode::serialize(manifest).map_err(|e| {
        StoreError::IoError(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Failed to serialize manifest: {}", e),
        ))
    })?;
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"manifest:");
    hasher.update(&bytes);
    Ok(Address::from_hash(hasher.finalize().as_bytes()))
}

#[derive(Default)]
struct LogState {
    entries: HashMap<Hash, LogEntry>,
    heads: HashSet<Hash>,
    time: u64,
    deleted: bool,
}

impl LogState {
    fn insert(&mut self, entry: LogEntry) -> bool {
        if self.entries.contains_key(&entry.hash) {
            return false;
        }
        self.time = self.time.max(entry.clock.time);
        self.entries.insert(entry.hash, entry);
        true
    }

    fn recompute_heads(&mut self) {
        let referenced: HashSet<Hash> = self
            .entries
            .values()
            .flat_map(|e| e.next.iter().copied())
            .collect();
        self.heads = self
            .entries
            .keys()
            .filter(|h| !referenced.contains(*h))
            .copied()
            .collect();
    }

    fn sorted(&self, hashes: impl Iterator<Item = Hash>) -> Vec<LogEntry> {
        let mut out: Vec<LogEntry> = hashes
            .filter_map(|h| self.entries.get(&h).cloned())
            .collect();
        sort_for_traversal(&mut out);
        out
    }
}

/// One store's log, shared by every handle opened on it.
struct MemoryLog {
    address: Address,
    manifest: Manifest,
    state: Mutex<LogState>,
    updates: broadcast::Sender<()>,
}

impl MemoryLog {
    fn new(address: Address, manifest: Manifest, entries: Vec<LogEntry>) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let mut state = LogState::default();
        for entry in entries {
            state.insert(entry);
        }
        state.recompute_heads();
        MemoryLog {
            address,
            manifest,
            state: Mutex::new(state),
            updates,
        }
    }

    fn snapshot(&self) -> Vec<LogEntry> {
        let state = self.state.lock();
        state.entries.values().cloned().collect()
    }

    fn notify(&self) {
        let _ = self.updates.send(());
    }
}

/// Counters exposed for tests and diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderStats {
    pub opens_total: u64,
    pub opens_by_address: HashMap<Address, u64>,
    pub open_handles: HashMap<Address, usize>,
}

struct ProviderInner {
    identity: String,
    logs: RwLock<HashMap<Address, Arc<MemoryLog>>>,
    stats: Mutex<ProviderStats>,
    fail_opens: AtomicUsize,
    persistence: Option<SledLogStorage>,
}

impl ProviderInner {
    fn lookup(&self, address: &Address) -> Result<Option<Arc<MemoryLog>>, StoreError> {
        if let Some(log) = self.logs.read().get(address) {
            return Ok(Some(log.clone()));
        }
        let Some(storage) = self.persistence.as_ref() else {
            return Ok(None);
        };
        let Some(manifest) = storage.load_manifest(address)? else {
            return Ok(None);
        };
        let entries = storage.load_entries(address)?;
        debug!(address = %address, entries = entries.len(), "Loaded store from persistence");

        let mut logs = self.logs.write();
        let log = logs
            .entry(address.clone())
            .or_insert_with(|| Arc::new(MemoryLog::new(address.clone(), manifest, entries)));
        Ok(Some(log.clone()))
    }

    fn persist_entry(&self, address: &Address, entry: &LogEntry) {
        if let Some(storage) = self.persistence.as_ref() {
            if let Err(e) = storage.save_entry(address, entry) {
                warn!(address = %address, error = %e, "Failed to persist log entry");
            }
        }
    }

    fn handle_closed(&self, address: &Address) {
        let mut stats = self.stats.lock();
        if let Some(count) = stats.open_handles.get_mut(address) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                stats.open_handles.remove(address);
            }
        }
    }
}

/// In-process replica implementing [`StoreProvider`].
#[derive(Clone)]
pub struct LocalProvider {
    inner: Arc<ProviderInner>,
}

impl LocalProvider {
    pub fn new(identity: impl Into<String>) -> Self {
        Self::build(identity.into(), None)
    }

    /// Provider whose logs survive restarts through `storage`.
    pub fn with_persistence(identity: impl Into<String>, storage: SledLogStorage) -> Self {
        Self::build(identity.into(), Some(storage))
    }

    fn build(identity: String, persistence: Option<SledLogStorage>) -> Self {
        LocalProvider {
            inner: Arc::new(ProviderInner {
                identity,
                logs: RwLock::new(HashMap::new()),
                stats: Mutex::new(ProviderStats::default()),
                fail_opens: AtomicUsize::new(0),
                persistence,
            }),
        }
    }

    /// Join every entry `other` holds for `address` into this replica.
    ///
    /// Returns the number of entries that were new here.
    pub fn replicate_from(&self, other: &LocalProvider, address: &Address) -> Result<usize, StoreError> {
        let Some(source) = other.inner.lookup(address)? else {
            return Err(StoreError::NotFound(address.to_string()));
        };
        let incoming = source.snapshot();

        let target = match self.inner.lookup(address)? {
            Some(log) => log,
            None => {
                if let Some(storage) = self.inner.persistence.as_ref() {
                    storage.save_manifest(address, &source.manifest)?;
                }
                let mut logs = self.inner.logs.write();
                logs.entry(address.clone())
                    .or_insert_with(|| {
                        Arc::new(MemoryLog::new(
                            address.clone(),
                            source.manifest.clone(),
                            Vec::new(),
                        ))
                    })
                    .clone()
            }
        };

        let mut added = Vec::new();
        {
            let mut state = target.state.lock();
            for entry in incoming {
                if !entry.verify() {
                    warn!(address = %address, hash = %entry.hash_hex(), "Rejecting entry with bad hash");
                    continue;
                }
                if state.insert(entry.clone()) {
                    added.push(entry);
                }
            }
            if !added.is_empty() {
                state.recompute_heads();
            }
        }

        for entry in &added {
            self.inner.persist_entry(address, entry);
        }
        if !added.is_empty() {
            debug!(address = %address, added = added.len(), "Joined replicated entries");
            target.notify();
        }
        Ok(added.len())
    }

    /// Make the next `n` calls to `open` fail with `OpenFailed`.
    pub fn fail_next_opens(&self, n: usize) {
        self.inner.fail_opens.store(n, Ordering::SeqCst);
    }

    pub fn stats(&self) -> ProviderStats {
        self.inner.stats.lock().clone()
    }

    /// Total number of `open` calls, failed ones included.
    pub fn open_count(&self) -> u64 {
        self.inner.stats.lock().opens_total
    }

    pub fn opens_for(&self, address: &Address) -> u64 {
        self.inner
            .stats
            .lock()
            .opens_by_address
            .get(address)
            .copied()
            .unwrap_or(0)
    }

    /// Handles currently open (not yet closed) on `address`.
    pub fn open_handles(&self, address: &Address) -> usize {
        self.inner
            .stats
            .lock()
            .open_handles
            .get(address)
            .copied()
            .unwrap_or(0)
    }

    /// Handles currently open across every address.
    pub fn total_open_handles(&self) -> usize {
        self.inner.stats.lock().open_handles.values().sum()
    }
}

#[async_trait]
impl StoreProvider for LocalProvider {
    fn identity(&self) -> &str {
        &self.inner.identity
    }

    async fn open(&self, address: &Address) -> Result<Store, StoreError> {
        {
            let mut stats = self.inner.stats.lock();
            stats.opens_total += 1;
            *stats.opens_by_address.entry(address.clone()).or_insert(0) += 1;
        }

        let injected = self
            .inner
            .fail_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::OpenFailed {
                address: address.to_string(),
                reason: "injected failure".to_string(),
            });
        }

        let log = self
            .inner
            .lookup(address)?
            .ok_or_else(|| StoreError::OpenFailed {
                address: address.to_string(),
                reason: "store not available locally".to_string(),
            })?;

        *self
            .inner
            .stats
            .lock()
            .open_handles
            .entry(address.clone())
            .or_insert(0) += 1;

        let kind = log.manifest.kind;
        let handle = LocalHandle {
            log,
            provider: self.inner.clone(),
            closed: AtomicBool::new(false),
        };
        Ok(Store::new(address.clone(), kind, Arc::new(handle)))
    }

    async fn create(&self, kind: StoreKind, access: AccessPolicy) -> Result<Address, StoreError> {
        let manifest = Manifest {
            kind,
            access,
            creator: self.inner.identity.clone(),
            nonce: next_nonce(),
        };
        let address = derive_address(&manifest)?;
        if let Some(storage) = self.inner.persistence.as_ref() {
            storage.save_manifest(&address, &manifest)?;
        }
        self.inner.logs.write().insert(
            address.clone(),
            Arc::new(MemoryLog::new(address.clone(), manifest, Vec::new())),
        );
        debug!(address = %address, kind = %kind, "Created store");
        Ok(address)
    }

    async fn delete(&self, address: &Address) -> Result<(), StoreError> {
        let removed = self.inner.logs.write().remove(address);
        if let Some(log) = removed {
            log.state.lock().deleted = true;
            log.notify();
        }
        if let Some(storage) = self.inner.persistence.as_ref() {
            storage.delete(address)?;
        }
        debug!(address = %address, "Deleted store");
        Ok(())
    }

    async fn access_policy(&self, address: &Address) -> Result<AccessPolicy, StoreError> {
        self.inner
            .lookup(address)?
            .map(|log| log.manifest.access.clone())
            .ok_or_else(|| StoreError::NotFound(address.to_string()))
    }
}

/// One open handle. Closing it only releases the handle; the log stays.
struct LocalHandle {
    log: Arc<MemoryLog>,
    provider: Arc<ProviderInner>,
    closed: AtomicBool,
}

impl LocalHandle {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::OpenFailed {
                address: self.log.address.to_string(),
                reason: "handle is closed".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl OpLog for LocalHandle {
    async fn append(&self, payload: Payload) -> Result<LogEntry, StoreError> {
        self.ensure_open()?;
        let identity = &self.provider.identity;
        if !self.log.manifest.access.allows(identity) {
            return Err(StoreError::PermissionDenied {
                address: self.log.address.to_string(),
                identity: identity.clone(),
            });
        }

        let entry = {
            let mut state = self.log.state.lock();
            if state.deleted {
                return Err(StoreError::OpenFailed {
                    address: self.log.address.to_string(),
                    reason: "store was deleted".to_string(),
                });
            }
            let mut next: Vec<Hash> = state.heads.iter().copied().collect();
            next.sort();
            let clock = Clock {
                time: state.time + 1,
                id: identity.clone(),
            };
            let entry = LogEntry::new(clock, next, payload)?;
            state.insert(entry.clone());
            state.heads.clear();
            state.heads.insert(entry.hash);
            entry
        };

        self.provider.persist_entry(&self.log.address, &entry);
        self.log.notify();
        Ok(entry)
    }

    async fn traverse(&self) -> Result<Vec<LogEntry>, StoreError> {
        self.ensure_open()?;
        let state = self.log.state.lock();
        Ok(state.sorted(state.entries.keys().copied()))
    }

    async fn heads(&self) -> Result<Vec<LogEntry>, StoreError> {
        self.ensure_open()?;
        let state = self.log.state.lock();
        Ok(state.sorted(state.heads.iter().copied()))
    }

    fn updates(&self) -> broadcast::Receiver<()> {
        self.log.updates.subscribe()
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.provider.handle_closed(&self.log.address);
        }
    }
}

impl Drop for LocalHandle {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.provider.handle_closed(&self.log.address);
        }
    }
}
