//! Live View Engine
//!
//! Turns addressable, append-only stores into continuously updated values.
//! Every `follow*` call delivers once as soon as the store is open and again
//! after every update notification, and returns a [`Forget`] capability.
//! Once `forget()` has resolved, no callback of that subscription is running
//! and none will run again.

pub mod branches;
pub mod cache;
pub mod callback;
pub mod dispatch;
pub mod indirect;
pub mod once;

pub use branches::{reduce_flatten_unique, BranchSpec};
pub use cache::{FollowCache, SharedLive};
pub use callback::{mount, source, Callback, Forget, Mount, Source};
pub use dispatch::InFlight;
pub use once::{once, once_matching};

use crate::config::{CacheConfig, LiveConfig};
use crate::error::{EngineError, StoreError};
use crate::registry::Registry;
use crate::store::{Content, ListEntry, OrderedEntry, Store, StoreKind, StoreProvider};
use crate::types::{Address, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, warn};

/// Which variants a follow accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KindCheck {
    Any,
    Exactly(StoreKind),
    /// Set or Feed.
    List,
}

impl KindCheck {
    fn verify(&self, store: &Store) -> Result<(), StoreError> {
        match self {
            KindCheck::Any => Ok(()),
            KindCheck::Exactly(kind) => store.expect_kind(*kind),
            KindCheck::List => match store.kind() {
                StoreKind::Set | StoreKind::Feed => Ok(()),
                _ => store.expect_kind(StoreKind::Set),
            },
        }
    }
}

/// Resolves once the subscription is cancelled (or its capability dropped).
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

/// Live view engine bound to one provider and one registry.
#[derive(Clone)]
pub struct Live {
    provider: Arc<dyn StoreProvider>,
    registry: Registry,
    config: LiveConfig,
    cache_enabled: bool,
}

impl Live {
    pub fn new(
        provider: Arc<dyn StoreProvider>,
        registry: Registry,
        config: LiveConfig,
        cache: &CacheConfig,
    ) -> Self {
        Live {
            provider,
            registry,
            config,
            cache_enabled: cache.enabled,
        }
    }

    pub fn provider(&self) -> &Arc<dyn StoreProvider> {
        &self.provider
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Memoized facade: identical calls share one underlying subscription.
    pub fn shared(&self) -> SharedLive {
        SharedLive::new(self.clone(), self.cache_enabled)
    }

    /// Follow the raw store handle, of any variant unless `kind` is given.
    pub async fn follow(
        &self,
        address: &str,
        kind: Option<StoreKind>,
        f: Callback<Store>,
    ) -> Result<Forget, EngineError> {
        let check = kind.map(KindCheck::Exactly).unwrap_or(KindCheck::Any);
        self.follow_checked(address, check, f)
    }

    /// Follow a key-value store as a dictionary.
    pub async fn follow_dict(&self, address: &str, f: Callback<Map>) -> Result<Forget, EngineError> {
        self.follow_content(
            address,
            KindCheck::Exactly(StoreKind::KeyValue),
            move |content| match content {
                Content::Dict(map) => Some(map),
                _ => None,
            },
            f,
        )
    }

    /// Follow an ordered key-value store as its ordered `{key, value, hash}` list.
    pub async fn follow_ordered_dict(
        &self,
        address: &str,
        f: Callback<Vec<OrderedEntry>>,
    ) -> Result<Forget, EngineError> {
        self.follow_content(
            address,
            KindCheck::Exactly(StoreKind::OrderedKeyValue),
            move |content| match content {
                Content::Ordered(entries) => Some(entries),
                _ => None,
            },
            f,
        )
    }

    /// Follow a set or feed as its plain values.
    pub async fn follow_list(&self, address: &str, f: Callback<Vec<Value>>) -> Result<Forget, EngineError> {
        self.follow_content(
            address,
            KindCheck::List,
            move |content| match content {
                Content::List(entries) => Some(entries.into_iter().map(|e| e.value).collect()),
                _ => None,
            },
            f,
        )
    }

    /// Follow a set or feed as `{value, hash}` entries.
    pub async fn follow_list_entries(
        &self,
        address: &str,
        f: Callback<Vec<ListEntry>>,
    ) -> Result<Forget, EngineError> {
        self.follow_content(
            address,
            KindCheck::List,
            move |content| match content {
                Content::List(entries) => Some(entries),
                _ => None,
            },
            f,
        )
    }

    fn follow_content<T, P>(
        &self,
        address: &str,
        check: KindCheck,
        project: P,
        f: Callback<T>,
    ) -> Result<Forget, EngineError>
    where
        T: Send + 'static,
        P: Fn(Content) -> Option<T> + Send + Sync + 'static,
    {
        let project = Arc::new(project);
        self.follow_checked(
            address,
            check,
            Callback::new(move |store: Store| {
                let f = f.clone();
                let project = project.clone();
                async move {
                    match store.materialize().await {
                        Ok(content) => {
                            if let Some(value) = project(content) {
                                f.call(value).await;
                            }
                        }
                        Err(e) => {
                            warn!(address = %store.address(), error = %e, "Failed to materialize store");
                        }
                    }
                }
            }),
        )
    }

    pub(crate) fn follow_checked(
        &self,
        address: &str,
        check: KindCheck,
        f: Callback<Store>,
    ) -> Result<Forget, EngineError> {
        let address = Address::parse(address)?;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let inflight = InFlight::new();

        let driver = tokio::spawn(drive(
            self.clone(),
            address.clone(),
            check,
            f,
            inflight.clone(),
            cancel_rx,
        ));

        Ok(Forget::new(move || async move {
            let _ = cancel_tx.send(true);
            let store = match driver.await {
                Ok(store) => store,
                Err(e) => {
                    error!(address = %address, error = %e, "Follow driver failed");
                    None
                }
            };
            inflight.drain().await;
            if let Some(store) = store {
                store.close().await;
            }
            debug!(address = %address, "Follow torn down");
        }))
    }

    /// Open `address`, retrying transient failures with exponential backoff.
    ///
    /// `Ok(None)` means the subscription was cancelled first.
    async fn open_with_retry(
        &self,
        address: &Address,
        check: KindCheck,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Option<Store>, StoreError> {
        let max_delay = Duration::from_millis(self.config.open_retry_max_ms);
        let mut delay = Duration::from_millis(self.config.open_retry_initial_ms).min(max_delay);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let opened = tokio::select! {
                biased;
                _ = cancelled(cancel) => return Ok(None),
                opened = self.provider.open(address) => opened,
            };

            match opened {
                Ok(store) => {
                    if let Err(e) = check.verify(&store) {
                        store.close().await;
                        return Err(e);
                    }
                    return Ok(Some(store));
                }
                Err(e) if e.is_transient() => {
                    debug!(
                        address = %address,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Store open failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = cancelled(cancel) => return Ok(None),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = (delay * 2).min(max_delay);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

enum Step {
    Updated,
    Cancelled,
    Closed,
}

/// Background driver of one follow. Returns the open store, if any, for closing.
async fn drive(
    live: Live,
    address: Address,
    check: KindCheck,
    f: Callback<Store>,
    inflight: Arc<InFlight>,
    mut cancel: watch::Receiver<bool>,
) -> Option<Store> {
    let store = match live.open_with_retry(&address, check, &mut cancel).await {
        Ok(Some(store)) => store,
        Ok(None) => return None,
        Err(e) => {
            error!(address = %address, error = %e, "Follow cannot proceed, going inert");
            cancelled(&mut cancel).await;
            return None;
        }
    };

    let mut updates = store.updates();
    inflight.dispatch(f.call(store.clone()));

    loop {
        let step = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => Step::Cancelled,
            update = updates.recv() => match update {
                Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => Step::Updated,
                Err(broadcast::error::RecvError::Closed) => Step::Closed,
            },
        };
        match step {
            Step::Updated => {
                inflight.dispatch(f.call(store.clone()));
            }
            Step::Cancelled => break,
            Step::Closed => {
                cancelled(&mut cancel).await;
                break;
            }
        }
    }

    Some(store)
}
