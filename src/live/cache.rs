//! Follow memoization
//!
//! Identical `(method, arguments)` calls share one upstream subscription.
//! Every caller gets its own [`Forget`]; the upstream is torn down exactly once,
//! when the last caller leaves. Joins and departures for one key are serialized
//! by a keyed lock, so concurrent arrivals never observe a half-torn-down entry.

use crate::error::EngineError;
use crate::live::callback::{source, Callback, Forget, Source};
use crate::live::dispatch::InFlight;
use crate::live::Live;
use crate::registry::KeyedLocks;
use crate::store::{ListEntry, OrderedEntry, Store, StoreKind};
use crate::types::{Map, Value};
use parking_lot::Mutex;
use serde_json::json;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Cache key: calling method plus the canonical JSON of its arguments.
///
/// `serde_json` maps keep keys sorted, so argument objects encode the same
/// regardless of construction order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    method: &'static str,
    args: String,
}

impl CacheKey {
    pub fn new(method: &'static str, args: &Value) -> Self {
        CacheKey {
            method,
            args: args.to_string(),
        }
    }

    fn lock_key(&self) -> String {
        format!("cache:{}:{}", self.method, self.args)
    }
}

struct Listener<V> {
    callback: Callback<V>,
    inflight: Arc<InFlight>,
}

struct SharedFollow<V> {
    listeners: Mutex<HashMap<u64, Listener<V>>>,
    next_listener: AtomicU64,
    last: Mutex<Option<V>>,
    upstream: Mutex<Option<Forget>>,
}

impl<V: Clone + Send + 'static> SharedFollow<V> {
    fn new() -> Self {
        SharedFollow {
            listeners: Mutex::new(HashMap::new()),
            next_listener: AtomicU64::new(1),
            last: Mutex::new(None),
            upstream: Mutex::new(None),
        }
    }

    fn publish(&self, value: V) {
        *self.last.lock() = Some(value.clone());
        let listeners = self.listeners.lock();
        for listener in listeners.values() {
            listener
                .inflight
                .dispatch(listener.callback.call(value.clone()));
        }
    }

    fn join(&self, callback: Callback<V>) -> (u64, Arc<InFlight>) {
        let id = self.next_listener.fetch_add(1, Ordering::SeqCst);
        let inflight = InFlight::new();
        let mut listeners = self.listeners.lock();
        if let Some(last) = self.last.lock().clone() {
            inflight.dispatch(callback.call(last));
        }
        listeners.insert(
            id,
            Listener {
                callback,
                inflight: inflight.clone(),
            },
        );
        (id, inflight)
    }

    /// Remove one listener; true if it was the last.
    fn leave(&self, id: u64) -> bool {
        let mut listeners = self.listeners.lock();
        listeners.remove(&id);
        listeners.is_empty()
    }
}

type Entry = Arc<dyn Any + Send + Sync>;

#[derive(Default)]
struct CacheInner {
    entries: Mutex<HashMap<CacheKey, Entry>>,
    locks: Arc<KeyedLocks>,
}

/// Shared subscriptions of one engine instance.
#[derive(Clone, Default)]
pub struct FollowCache {
    inner: Arc<CacheInner>,
}

impl FollowCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live shared subscriptions.
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup<V: Send + Sync + 'static>(&self, key: &CacheKey) -> Option<Arc<SharedFollow<V>>> {
        let entry = self.inner.entries.lock().get(key).cloned()?;
        entry.downcast::<SharedFollow<V>>().ok()
    }

    /// Join the shared subscription for `key`, starting it with `start` if needed.
    pub async fn subscribe<V>(
        &self,
        key: CacheKey,
        f: Callback<V>,
        start: Source<V>,
    ) -> Result<Forget, EngineError>
    where
        V: Clone + Send + Sync + 'static,
    {
        let guard = self.inner.locks.acquire(key.lock_key()).await;

        let shared = match self.lookup::<V>(&key) {
            Some(shared) => {
                trace!(method = key.method, "Joining shared follow");
                shared
            }
            None => {
                let shared = Arc::new(SharedFollow::<V>::new());
                let publisher = {
                    let shared = shared.clone();
                    Callback::sync(move |value: V| shared.publish(value))
                };
                let upstream = start(publisher).await?;
                *shared.upstream.lock() = Some(upstream);
                self.inner
                    .entries
                    .lock()
                    .insert(key.clone(), shared.clone() as Entry);
                debug!(method = key.method, "Started shared follow");
                shared
            }
        };
        let (id, inflight) = shared.join(f);
        drop(guard);

        let cache = self.clone();
        Ok(Forget::new(move || async move {
            let _guard = cache.inner.locks.acquire(key.lock_key()).await;
            let last = shared.leave(id);
            inflight.drain().await;
            if !last {
                return;
            }
            cache.inner.entries.lock().remove(&key);
            let upstream = shared.upstream.lock().take();
            if let Some(upstream) = upstream {
                debug!(method = key.method, "Tearing down shared follow");
                upstream.forget().await;
            }
        }))
    }
}

/// Memoized facade over [`Live`].
#[derive(Clone)]
pub struct SharedLive {
    live: Live,
    enabled: bool,
}

impl SharedLive {
    pub(crate) fn new(live: Live, enabled: bool) -> Self {
        SharedLive { live, enabled }
    }

    pub fn live(&self) -> &Live {
        &self.live
    }

    /// Memoize `start` under `(method, args)`, or call it directly when disabled.
    pub async fn memoize<V>(
        &self,
        method: &'static str,
        args: Value,
        f: Callback<V>,
        start: Source<V>,
    ) -> Result<Forget, EngineError>
    where
        V: Clone + Send + Sync + 'static,
    {
        if !self.enabled {
            return start(f).await;
        }
        self.live
            .registry()
            .cache()
            .subscribe(CacheKey::new(method, &args), f, start)
            .await
    }

    /// Memoize `follow` over a clone of the underlying [`Live`].
    async fn share<V, F, Fut>(
        &self,
        method: &'static str,
        args: Value,
        f: Callback<V>,
        follow: F,
    ) -> Result<Forget, EngineError>
    where
        V: Clone + Send + Sync + 'static,
        F: FnOnce(Live, Callback<V>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Forget, EngineError>> + Send + 'static,
    {
        let live = self.live.clone();
        self.memoize(method, args, f, source(move |cb| follow(live, cb))).await
    }

    pub async fn follow(
        &self,
        address: &str,
        kind: Option<StoreKind>,
        f: Callback<Store>,
    ) -> Result<Forget, EngineError> {
        let target = address.to_string();
        let args = json!({ "address": address, "kind": kind.map(|k| k.as_str()) });
        self.share("follow", args, f, move |live, cb| async move {
            live.follow(&target, kind, cb).await
        })
        .await
    }

    pub async fn follow_dict(&self, address: &str, f: Callback<Map>) -> Result<Forget, EngineError> {
        let target = address.to_string();
        self.share("follow_dict", json!({ "address": address }), f, move |live, cb| async move {
            live.follow_dict(&target, cb).await
        })
        .await
    }

    pub async fn follow_ordered_dict(
        &self,
        address: &str,
        f: Callback<Vec<OrderedEntry>>,
    ) -> Result<Forget, EngineError> {
        let target = address.to_string();
        self.share("follow_ordered_dict", json!({ "address": address }), f, move |live, cb| async move {
            live.follow_ordered_dict(&target, cb).await
        })
        .await
    }

    pub async fn follow_list(&self, address: &str, f: Callback<Vec<Value>>) -> Result<Forget, EngineError> {
        let target = address.to_string();
        self.share("follow_list", json!({ "address": address }), f, move |live, cb| async move {
            live.follow_list(&target, cb).await
        })
        .await
    }

    pub async fn follow_list_entries(
        &self,
        address: &str,
        f: Callback<Vec<ListEntry>>,
    ) -> Result<Forget, EngineError> {
        let target = address.to_string();
        self.share("follow_list_entries", json!({ "address": address }), f, move |live, cb| async move {
            live.follow_list_entries(&target, cb).await
        })
        .await
    }

    pub async fn follow_dict_by_key(
        &self,
        address: &str,
        key: &str,
        f: Callback<Map>,
    ) -> Result<Forget, EngineError> {
        let (target, slot) = (address.to_string(), key.to_string());
        let args = json!({ "address": address, "key": key });
        self.share("follow_dict_by_key", args, f, move |live, cb| async move {
            live.follow_dict_by_key(&target, &slot, cb).await
        })
        .await
    }

    pub async fn follow_ordered_dict_by_key(
        &self,
        address: &str,
        key: &str,
        f: Callback<Vec<OrderedEntry>>,
    ) -> Result<Forget, EngineError> {
        let (target, slot) = (address.to_string(), key.to_string());
        let args = json!({ "address": address, "key": key });
        self.share("follow_ordered_dict_by_key", args, f, move |live, cb| async move {
            live.follow_ordered_dict_by_key(&target, &slot, cb).await
        })
        .await
    }

    pub async fn follow_list_by_key(
        &self,
        address: &str,
        key: &str,
        f: Callback<Vec<Value>>,
    ) -> Result<Forget, EngineError> {
        let (target, slot) = (address.to_string(), key.to_string());
        let args = json!({ "address": address, "key": key });
        self.share("follow_list_by_key", args, f, move |live, cb| async move {
            live.follow_list_by_key(&target, &slot, cb).await
        })
        .await
    }
}
