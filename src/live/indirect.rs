//! Address indirection
//!
//! Follow whatever store a root subscription currently points at. Each time
//! the root delivers a different address, the previous nested subscription is
//! torn down completely before the next one is mounted.

use crate::error::EngineError;
use crate::live::callback::{mount, source, Callback, Forget, Mount, Source};
use crate::live::Live;
use crate::store::OrderedEntry;
use crate::types::{Address, Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

#[derive(Default)]
struct Indirection {
    /// `None` until the root first delivers.
    current: Option<Option<Address>>,
    /// Sequence number of the newest root delivery applied.
    applied: u64,
    inner: Option<Forget>,
    stopped: bool,
}

/// Generic indirection: `root` produces an address (or nothing), `mount`
/// subscribes to it, and `f` receives the nested values or `None` when the
/// root points nowhere.
pub async fn follow_indirect<T>(
    root: Source<Option<String>>,
    mount_target: Mount<Address, T>,
    f: Callback<Option<T>>,
) -> Result<Forget, EngineError>
where
    T: Send + 'static,
{
    let state = Arc::new(tokio::sync::Mutex::new(Indirection::default()));
    let generation = Arc::new(AtomicU64::new(0));
    let deliveries = Arc::new(AtomicU64::new(0));

    let on_root = {
        let state = state.clone();
        let generation = generation.clone();
        let f = f.clone();
        Callback::new(move |raw: Option<String>| {
            let sequence = deliveries.fetch_add(1, Ordering::SeqCst) + 1;
            let state = state.clone();
            let generation = generation.clone();
            let mount_target = mount_target.clone();
            let f = f.clone();
            async move {
                let target = raw.as_deref().and_then(|s| match Address::parse(s) {
                    Ok(address) => Some(address),
                    Err(_) => {
                        debug!(value = s, "Indirection value is not an address");
                        None
                    }
                });

                let mut state = state.lock().await;
                if sequence < state.applied {
                    trace!(sequence, applied = state.applied, "Dropping stale indirection delivery");
                    return;
                }
                state.applied = sequence;
                if state.stopped || state.current.as_ref() == Some(&target) {
                    return;
                }
                if let Some(previous) = state.inner.take() {
                    previous.forget().await;
                }
                let this_generation = generation.fetch_add(1, Ordering::SeqCst) + 1;
                state.current = Some(target.clone());

                match target {
                    Some(address) => {
                        let forward = {
                            let generation = generation.clone();
                            let f = f.clone();
                            Callback::new(move |value: T| {
                                let live = generation.load(Ordering::SeqCst) == this_generation;
                                let delivery = live.then(|| f.call(Some(value)));
                                async move {
                                    if let Some(delivery) = delivery {
                                        delivery.await;
                                    }
                                }
                            })
                        };
                        match mount_target(address.clone(), forward).await {
                            Ok(inner) => state.inner = Some(inner),
                            Err(e) => {
                                warn!(address = %address, error = %e, "Failed to mount indirection target")
                            }
                        }
                    }
                    None => f.call(None).await,
                }
            }
        })
    };

    let root_forget = root(on_root).await?;

    Ok(Forget::new(move || async move {
        root_forget.forget().await;
        let inner = {
            let mut state = state.lock().await;
            state.stopped = true;
            state.inner.take()
        };
        generation.fetch_add(1, Ordering::SeqCst);
        if let Some(inner) = inner {
            inner.forget().await;
        }
    }))
}

/// Follow the address stored under `key` of the dictionary at `address`.
pub async fn follow_by_key<T>(
    live: &Live,
    address: &str,
    key: &str,
    mount_target: Mount<Address, T>,
    f: Callback<Option<T>>,
) -> Result<Forget, EngineError>
where
    T: Send + 'static,
{
    Address::parse(address)?;
    let root = {
        let live = live.clone();
        let address = address.to_string();
        let key = key.to_string();
        source(move |cb: Callback<Option<String>>| async move {
            let pick = cb.map(move |map: Map| map.get(&key).and_then(Value::as_str).map(String::from));
            live.follow_dict(&address, pick).await
        })
    };
    follow_indirect(root, mount_target, f).await
}

/// Deliver the root's address only while `condition` reports true for it.
pub async fn follow_by_condition(
    root: Source<Option<String>>,
    condition: Mount<Address, bool>,
    f: Callback<Option<Address>>,
) -> Result<Forget, EngineError> {
    let gated: Mount<Address, Option<Address>> = mount(move |address: Address, cb: Callback<Option<Address>>| {
        let condition = condition.clone();
        async move {
            let target = address.clone();
            condition(address, cb.map(move |ok: bool| ok.then(|| target.clone()))).await
        }
    });
    follow_indirect(root, gated, f.map(|value: Option<Option<Address>>| value.flatten())).await
}

impl Live {
    pub async fn follow_by_key<T>(
        &self,
        address: &str,
        key: &str,
        mount_target: Mount<Address, T>,
        f: Callback<Option<T>>,
    ) -> Result<Forget, EngineError>
    where
        T: Send + 'static,
    {
        follow_by_key(self, address, key, mount_target, f).await
    }

    /// Dictionary referenced by `key`; an absent key delivers an empty map.
    pub async fn follow_dict_by_key(
        &self,
        address: &str,
        key: &str,
        f: Callback<Map>,
    ) -> Result<Forget, EngineError> {
        let live = self.clone();
        let target = mount(move |address: Address, cb: Callback<Map>| {
            let live = live.clone();
            async move { live.follow_dict(address.as_str(), cb).await }
        });
        self.follow_by_key(address, key, target, f.map(|m: Option<Map>| m.unwrap_or_default()))
            .await
    }

    /// Ordered dictionary referenced by `key`; an absent key delivers an empty list.
    pub async fn follow_ordered_dict_by_key(
        &self,
        address: &str,
        key: &str,
        f: Callback<Vec<OrderedEntry>>,
    ) -> Result<Forget, EngineError> {
        let live = self.clone();
        let target = mount(move |address: Address, cb: Callback<Vec<OrderedEntry>>| {
            let live = live.clone();
            async move { live.follow_ordered_dict(address.as_str(), cb).await }
        });
        self.follow_by_key(
            address,
            key,
            target,
            f.map(|entries: Option<Vec<OrderedEntry>>| entries.unwrap_or_default()),
        )
        .await
    }

    /// List referenced by `key`; an absent key delivers an empty list.
    pub async fn follow_list_by_key(
        &self,
        address: &str,
        key: &str,
        f: Callback<Vec<Value>>,
    ) -> Result<Forget, EngineError> {
        let live = self.clone();
        let target = mount(move |address: Address, cb: Callback<Vec<Value>>| {
            let live = live.clone();
            async move { live.follow_list(address.as_str(), cb).await }
        });
        self.follow_by_key(
            address,
            key,
            target,
            f.map(|values: Option<Vec<Value>>| values.unwrap_or_default()),
        )
        .await
    }

    pub async fn follow_by_condition(
        &self,
        root: Source<Option<String>>,
        condition: Mount<Address, bool>,
        f: Callback<Option<Address>>,
    ) -> Result<Forget, EngineError> {
        follow_by_condition(root, condition, f).await
    }
}
