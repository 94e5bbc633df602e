//! Reachability Tracker
//!
//! Follows every store transitively referenced, by value, from a root store
//! and delivers the set of their addresses whenever the discovered graph
//! changes. Graph bookkeeping lives in [`graph::DependencyGraph`]; this module
//! wires it to live follows.

pub mod graph;

pub use graph::{Attach, DependencyGraph, Drained, NodeState, Referrer};

use crate::config::ReachConfig;
use crate::error::EngineError;
use crate::live::{mount, source, BranchSpec, Callback, Forget, InFlight, Live};
use crate::registry::KeyedLocks;
use crate::store::{Content, Store};
use crate::types::{Address, Value};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Addresses referenced by materialized content, one level deep.
///
/// String values that pass the address predicate count, as do the string
/// elements of list and dictionary values. Dictionary keys that are addresses
/// count too. Entries under an excluded key are skipped at both levels.
pub fn extract_addresses(content: &Content, excluded: &HashSet<String>) -> BTreeSet<Address> {
    let mut found = BTreeSet::new();
    match content {
        Content::Dict(map) => {
            for (key, value) in map {
                scan_pair(key, value, excluded, &mut found);
            }
        }
        Content::Ordered(entries) => {
            for entry in entries {
                scan_pair(&entry.key, &entry.value, excluded, &mut found);
            }
        }
        Content::List(entries) => {
            for entry in entries {
                scan_value(&entry.value, excluded, true, &mut found);
            }
        }
    }
    found
}

fn scan_pair(key: &str, value: &Value, excluded: &HashSet<String>, found: &mut BTreeSet<Address>) {
    if excluded.contains(key) {
        return;
    }
    if let Ok(address) = Address::parse(key) {
        found.insert(address);
    }
    scan_value(value, excluded, true, found);
}

fn scan_value(value: &Value, excluded: &HashSet<String>, descend: bool, found: &mut BTreeSet<Address>) {
    match value {
        Value::String(_) => {
            if let Some(address) = Address::from_value(value) {
                found.insert(address);
            }
        }
        Value::Array(items) if descend => {
            for item in items {
                scan_value(item, excluded, false, found);
            }
        }
        Value::Object(map) if descend => {
            for (key, item) in map {
                if !excluded.contains(key) {
                    scan_value(item, excluded, false, found);
                }
            }
        }
        _ => {}
    }
}

/// Reachability tracker of one engine instance.
#[derive(Clone)]
pub struct Tracker {
    live: Live,
    excluded: Arc<HashSet<String>>,
    next_session: Arc<AtomicU64>,
}

impl Tracker {
    pub fn new(live: Live, config: &ReachConfig) -> Self {
        Tracker {
            live,
            excluded: Arc::new(config.excluded_keys.iter().cloned().collect()),
            next_session: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn live(&self) -> &Live {
        &self.live
    }

    /// Follow the stores reachable from `root`, delivering their sorted
    /// addresses (root included) on every structural change.
    pub async fn follow_reachable(
        &self,
        root: &str,
        f: Callback<Vec<Address>>,
    ) -> Result<Forget, EngineError> {
        let root = Address::parse(root)?;
        let session = Arc::new(Session {
            id: self.next_session.fetch_add(1, Ordering::SeqCst),
            live: self.live.clone(),
            locks: self.live.registry().locks().clone(),
            excluded: self.excluded.clone(),
            graph: Mutex::new(DependencyGraph::new()),
            last: Mutex::new(None),
            tasks: InFlight::new(),
            stopped: AtomicBool::new(false),
            f,
        });

        session.graph.lock().attach(&root, Referrer::Root);
        debug!(session = session.id, root = %root, "Tracking reachability");
        session.clone().mount(root.clone()).await;

        Ok(Forget::new(move || async move { session.teardown().await }))
    }

    /// Follow a fingerprint of the newest heads of every store reachable from
    /// `root`: blake3 hex over the sorted head hashes. Memoized per root.
    pub async fn follow_heads_fingerprint(
        &self,
        root: &str,
        f: Callback<String>,
    ) -> Result<Forget, EngineError> {
        Address::parse(root)?;
        let tracker = self.clone();
        let target = root.to_string();
        self.live
            .shared()
            .memoize(
                "follow_heads_fingerprint",
                json!({ "root": root }),
                f,
                source(move |cb| async move { tracker.follow_heads_fingerprint_direct(&target, cb).await }),
            )
            .await
    }

    async fn follow_heads_fingerprint_direct(
        &self,
        root: &str,
        f: Callback<String>,
    ) -> Result<Forget, EngineError> {
        let tracker = self.clone();
        let root = root.to_string();
        let list = source(move |cb: Callback<Vec<Address>>| async move {
            tracker.follow_reachable(&root, cb).await
        });

        let live = self.live.clone();
        let spec = BranchSpec {
            key: Arc::new(|address: &Address| address.to_string()),
            mount: mount(move |address: Address, cb: Callback<Vec<String>>| {
                let live = live.clone();
                async move {
                    live.follow(
                        address.as_str(),
                        None,
                        Callback::new(move |store: Store| {
                            let cb = cb.clone();
                            async move {
                                match store.heads().await {
                                    Ok(heads) => cb.call(heads.iter().map(|h| h.hash_hex()).collect()).await,
                                    Err(e) => warn!(address = %store.address(), error = %e, "Failed to read heads"),
                                }
                            }
                        }),
                    )
                    .await
                }
            }),
            reduce: Arc::new(|branches: Vec<Vec<String>>| fingerprint(branches.into_iter().flatten())),
        };
        self.live.follow_branches(list, spec, f).await
    }
}

/// blake3 hex over the sorted, de-duplicated head hashes.
pub fn fingerprint(heads: impl IntoIterator<Item = String>) -> String {
    let sorted: BTreeSet<String> = heads.into_iter().collect();
    let mut hasher = blake3::Hasher::new();
    for head in &sorted {
        hasher.update(head.as_bytes());
        hasher.update(b"\n");
    }
    hasher.finalize().to_hex().to_string()
}

/// One `follow_reachable` subscription.
struct Session {
    id: u64,
    live: Live,
    locks: Arc<KeyedLocks>,
    excluded: Arc<HashSet<String>>,
    graph: Mutex<DependencyGraph<Forget>>,
    last: Mutex<Option<Vec<Address>>>,
    /// Child mounts and teardowns started from node callbacks.
    tasks: Arc<InFlight>,
    stopped: AtomicBool,
    f: Callback<Vec<Address>>,
}

impl Session {
    fn mount(self: Arc<Self>, address: Address) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let _guard = self
                .locks
                .acquire(format!("reach:{}:{}", self.id, address))
                .await;
            if self.graph.lock().state(&address) != Some(NodeState::Mounting) {
                return;
            }

            let on_store = {
                let session = self.clone();
                let address = address.clone();
                Callback::new(move |store: Store| session.clone().on_store(address.clone(), store))
            };
            match self.live.follow(address.as_str(), None, on_store).await {
                Ok(forget) => {
                    let rejected = self.graph.lock().mounted(&address, forget);
                    if let Err(forget) = rejected {
                        trace!(session = self.id, address = %address, "Node drained while mounting");
                        forget.forget().await;
                        return;
                    }
                    trace!(session = self.id, address = %address, "Node mounted");
                }
                Err(e) => {
                    warn!(session = self.id, address = %address, error = %e, "Failed to mount node");
                }
            }
            drop(_guard);
            self.emit().await;
        })
    }

    fn on_store(self: Arc<Self>, address: Address, store: Store) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let content = match store.materialize().await {
                Ok(content) => content,
                Err(e) => {
                    warn!(address = %address, error = %e, "Failed to materialize node");
                    return;
                }
            };
            let mut children = extract_addresses(&content, &self.excluded);
            children.remove(&address);

            let changed = self.graph.lock().replace_children(&address, children);
            let Some((created, drained)) = changed else {
                return;
            };
            let structural = !created.is_empty() || !drained.is_empty();

            for node in drained {
                debug!(session = self.id, address = %node.address, "Draining node");
                if let Some(forget) = node.subscription {
                    self.tasks.dispatch(Box::pin(async move { forget.forget().await }));
                }
            }
            for child in created {
                self.tasks.dispatch(self.clone().mount(child));
            }
            if structural {
                self.emit().await;
            }
        })
    }

    async fn emit(&self) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let addresses = self.graph.lock().addresses();
        let changed = {
            let mut last = self.last.lock();
            if last.as_ref() == Some(&addresses) {
                false
            } else {
                *last = Some(addresses.clone());
                true
            }
        };
        if changed {
            self.f.call(addresses).await;
        }
    }

    async fn teardown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let drained = self.graph.lock().drain_all();
        for node in drained {
            if let Some(forget) = node.subscription {
                forget.forget().await;
            }
        }
        self.tasks.drain().await;
        debug!(session = self.id, "Reachability tracking stopped");
    }
}
