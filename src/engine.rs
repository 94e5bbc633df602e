//! Engine instance
//!
//! One [`Engine`] owns a provider, a registry (keyed locks and the follow
//! cache), and the three engines built on them. Independent instances share
//! nothing, so tests and embedders can run several side by side.

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::live::{Live, SharedLive};
use crate::merge::{MemoryPointerCache, Merger, PointerCache, SledPointerCache};
use crate::reach::Tracker;
use crate::registry::Registry;
use crate::store::{LocalProvider, SledLogStorage, StoreProvider};
use std::sync::Arc;
use tracing::{info, warn};

pub struct Engine {
    provider: Arc<dyn StoreProvider>,
    registry: Registry,
    config: EngineConfig,
    live: Live,
    tracker: Tracker,
    merger: Merger,
    storage: Option<SledLogStorage>,
}

impl Engine {
    /// Engine over `provider` with in-memory slot pointers.
    pub fn new(provider: Arc<dyn StoreProvider>, config: EngineConfig) -> Result<Self, EngineError> {
        Self::with_pointers(provider, config, Arc::new(MemoryPointerCache::new()))
    }

    pub fn with_pointers(
        provider: Arc<dyn StoreProvider>,
        config: EngineConfig,
        pointers: Arc<dyn PointerCache>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let registry = Registry::new();
        let live = Live::new(
            provider.clone(),
            registry.clone(),
            config.live.clone(),
            &config.cache,
        );
        let tracker = Tracker::new(live.clone(), &config.reach);
        let merger = Merger::new(provider.clone(), registry.locks().clone(), pointers);
        info!(
            identity = provider.identity(),
            cache = config.cache.enabled,
            "Engine started"
        );
        Ok(Engine {
            provider,
            registry,
            config,
            live,
            tracker,
            merger,
            storage: None,
        })
    }

    /// Engine over a [`LocalProvider`] for `identity`. With `storage.persist`,
    /// logs and slot pointers are kept in sled under `storage.data_dir`.
    pub fn local(identity: &str, config: EngineConfig) -> Result<Self, EngineError> {
        if !config.storage.persist {
            return Self::new(Arc::new(LocalProvider::new(identity)), config);
        }
        let storage = SledLogStorage::open(config.storage.logs_path())?;
        let pointers = SledPointerCache::open(config.storage.pointers_path())?;
        let mut engine = Self::with_pointers(
            Arc::new(LocalProvider::with_persistence(identity, storage.clone())),
            config,
            Arc::new(pointers),
        )?;
        engine.storage = Some(storage);
        Ok(engine)
    }

    pub fn provider(&self) -> &Arc<dyn StoreProvider> {
        &self.provider
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn live(&self) -> &Live {
        &self.live
    }

    /// Memoized follows, unless `cache.enabled` is off.
    pub fn shared(&self) -> SharedLive {
        self.live.shared()
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    pub fn merger(&self) -> &Merger {
        &self.merger
    }

    /// Shared subscriptions still alive in this instance.
    pub fn active_shared_follows(&self) -> usize {
        self.registry.cache().len()
    }

    /// Flush persisted logs and report what is still held. Subscriptions
    /// belong to their callers and must be forgotten by them first.
    pub fn shutdown(self) {
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.flush() {
                warn!(error = %e, "Failed to flush store logs");
            }
        }
        let shared = self.registry.cache().len();
        let locks = self.registry.locks().active_keys();
        if shared > 0 || locks > 0 {
            warn!(shared, locks, "Engine shut down with live subscriptions");
        } else {
            info!("Engine shut down");
        }
    }
}
