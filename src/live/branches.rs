//! List-of-branches combinator
//!
//! Follows a list, keeps exactly one branch subscription per distinct element
//! key, and folds the latest output of every branch (in list order) into one
//! delivered value.

use crate::error::EngineError;
use crate::live::callback::{mount, source, Callback, Forget, Mount, Source};
use crate::live::Live;
use crate::types::{Address, Map, Value};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// How elements become branches and how branch outputs are combined.
pub struct BranchSpec<E, B, R> {
    /// Stable identity of an element; one branch per distinct key.
    pub key: Arc<dyn Fn(&E) -> String + Send + Sync>,
    pub mount: Mount<E, B>,
    pub reduce: Arc<dyn Fn(Vec<B>) -> R + Send + Sync>,
}

impl<E, B, R> Clone for BranchSpec<E, B, R> {
    fn clone(&self) -> Self {
        BranchSpec {
            key: self.key.clone(),
            mount: self.mount.clone(),
            reduce: self.reduce.clone(),
        }
    }
}

/// Concatenate branch outputs, dropping later duplicates.
pub fn reduce_flatten_unique<T: PartialEq>(branches: Vec<Vec<T>>) -> Vec<T> {
    let mut out: Vec<T> = Vec::new();
    for item in branches.into_iter().flatten() {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

struct Outputs<B> {
    order: Vec<String>,
    active: HashSet<String>,
    values: HashMap<String, B>,
    listed: bool,
    stopped: bool,
}

impl<B: Clone> Outputs<B> {
    /// Reported branch outputs in list order; `None` before the list arrives.
    fn snapshot(&self) -> Option<Vec<B>> {
        if !self.listed || self.stopped {
            return None;
        }
        Some(
            self.order
                .iter()
                .filter_map(|key| self.values.get(key).cloned())
                .collect(),
        )
    }
}

struct Branches {
    forgets: HashMap<String, Forget>,
    stopped: bool,
}

pub async fn follow_branches<E, B, R>(
    list: Source<Vec<E>>,
    spec: BranchSpec<E, B, R>,
    f: Callback<R>,
) -> Result<Forget, EngineError>
where
    E: Send + 'static,
    B: Clone + Send + 'static,
    R: Send + 'static,
{
    let outputs = Arc::new(Mutex::new(Outputs::<B> {
        order: Vec::new(),
        active: HashSet::new(),
        values: HashMap::new(),
        listed: false,
        stopped: false,
    }));
    let branches = Arc::new(tokio::sync::Mutex::new(Branches {
        forgets: HashMap::new(),
        stopped: false,
    }));

    let emit = {
        let outputs = outputs.clone();
        let reduce = spec.reduce.clone();
        let f = f.clone();
        Arc::new(move || {
            let snapshot = outputs.lock().snapshot();
            let delivery = snapshot.map(|values| f.call(reduce(values)));
            async move {
                if let Some(delivery) = delivery {
                    delivery.await;
                }
            }
        })
    };

    let on_list = {
        let outputs = outputs.clone();
        let branches = branches.clone();
        let emit = emit.clone();
        Callback::new(move |elements: Vec<E>| {
            let outputs = outputs.clone();
            let branches = branches.clone();
            let emit = emit.clone();
            let spec = spec.clone();
            async move {
                let mut branches = branches.lock().await;
                if branches.stopped {
                    return;
                }

                let mut order = Vec::new();
                let mut fresh = Vec::new();
                let mut seen = HashSet::new();
                for element in elements {
                    let key = (spec.key)(&element);
                    if !seen.insert(key.clone()) {
                        continue;
                    }
                    if !branches.forgets.contains_key(&key) {
                        fresh.push((key.clone(), element));
                    }
                    order.push(key);
                }

                let removed: Vec<String> = branches
                    .forgets
                    .keys()
                    .filter(|key| !seen.contains(*key))
                    .cloned()
                    .collect();
                {
                    let mut outputs = outputs.lock();
                    for key in &removed {
                        outputs.active.remove(key);
                        outputs.values.remove(key);
                    }
                    for (key, _) in &fresh {
                        outputs.active.insert(key.clone());
                    }
                    outputs.order = order;
                    outputs.listed = true;
                }
                for key in removed {
                    if let Some(forget) = branches.forgets.remove(&key) {
                        debug!(branch = %key, "Tearing down branch");
                        forget.forget().await;
                    }
                }

                for (key, element) in fresh {
                    let on_branch = {
                        let outputs = outputs.clone();
                        let emit = emit.clone();
                        let key = key.clone();
                        Callback::new(move |value: B| {
                            let accepted = {
                                let mut outputs = outputs.lock();
                                if outputs.active.contains(&key) {
                                    outputs.values.insert(key.clone(), value);
                                    true
                                } else {
                                    false
                                }
                            };
                            let delivery = accepted.then(|| emit());
                            async move {
                                if let Some(delivery) = delivery {
                                    delivery.await;
                                }
                            }
                        })
                    };
                    match (spec.mount)(element, on_branch).await {
                        Ok(forget) => {
                            branches.forgets.insert(key, forget);
                        }
                        Err(e) => {
                            warn!(branch = %key, error = %e, "Failed to mount branch");
                            outputs.lock().active.remove(&key);
                        }
                    }
                }
                drop(branches);

                emit().await;
            }
        })
    };

    let list_forget = list(on_list).await?;

    Ok(Forget::new(move || async move {
        list_forget.forget().await;
        let forgets: Vec<Forget> = {
            let mut branches = branches.lock().await;
            branches.stopped = true;
            branches.forgets.drain().map(|(_, forget)| forget).collect()
        };
        outputs.lock().stopped = true;
        for forget in forgets {
            forget.forget().await;
        }
    }))
}

/// Keep the addresses of `list` whose `condition` currently reports true.
pub async fn follow_all_by_condition(
    list: Source<Vec<Address>>,
    condition: Mount<Address, bool>,
    f: Callback<Vec<Address>>,
) -> Result<Forget, EngineError> {
    let spec = BranchSpec {
        key: Arc::new(|address: &Address| address.to_string()),
        mount: mount(move |address: Address, cb: Callback<(Address, bool)>| {
            let condition = condition.clone();
            async move {
                let target = address.clone();
                condition(address, cb.map(move |ok: bool| (target.clone(), ok))).await
            }
        }),
        reduce: Arc::new(|results: Vec<(Address, bool)>| {
            results
                .into_iter()
                .filter_map(|(address, ok)| ok.then_some(address))
                .collect()
        }),
    };
    follow_branches(list, spec, f).await
}

fn branch_spec_for_addresses<B, R>(
    branch: Mount<Address, B>,
    reduce: Arc<dyn Fn(Vec<B>) -> R + Send + Sync>,
) -> BranchSpec<Address, B, R> {
    BranchSpec {
        key: Arc::new(|address: &Address| address.to_string()),
        mount: branch,
        reduce,
    }
}

fn addresses_in(values: impl IntoIterator<Item = Value>) -> Vec<Address> {
    values
        .into_iter()
        .filter_map(|value| Address::from_value(&value))
        .collect()
}

impl Live {
    pub async fn follow_branches<E, B, R>(
        &self,
        list: Source<Vec<E>>,
        spec: BranchSpec<E, B, R>,
        f: Callback<R>,
    ) -> Result<Forget, EngineError>
    where
        E: Send + 'static,
        B: Clone + Send + 'static,
        R: Send + 'static,
    {
        follow_branches(list, spec, f).await
    }

    /// One branch per address stored in the set or feed at `address`.
    pub async fn follow_branches_of_list<B, R>(
        &self,
        address: &str,
        branch: Mount<Address, B>,
        reduce: Arc<dyn Fn(Vec<B>) -> R + Send + Sync>,
        f: Callback<R>,
    ) -> Result<Forget, EngineError>
    where
        B: Clone + Send + 'static,
        R: Send + 'static,
    {
        Address::parse(address)?;
        let live = self.clone();
        let address = address.to_string();
        let list = source(move |cb: Callback<Vec<Address>>| async move {
            live.follow_list(&address, cb.map(|values: Vec<Value>| addresses_in(values)))
                .await
        });
        follow_branches(list, branch_spec_for_addresses(branch, reduce), f).await
    }

    /// One branch per address stored as a value of the dictionary at `address`.
    pub async fn follow_branches_of_dict<B, R>(
        &self,
        address: &str,
        branch: Mount<Address, B>,
        reduce: Arc<dyn Fn(Vec<B>) -> R + Send + Sync>,
        f: Callback<R>,
    ) -> Result<Forget, EngineError>
    where
        B: Clone + Send + 'static,
        R: Send + 'static,
    {
        Address::parse(address)?;
        let live = self.clone();
        let address = address.to_string();
        let list = source(move |cb: Callback<Vec<Address>>| async move {
            live.follow_dict(&address, cb.map(|map: Map| addresses_in(map.into_iter().map(|(_, v)| v))))
                .await
        });
        follow_branches(list, branch_spec_for_addresses(branch, reduce), f).await
    }

    pub async fn follow_all_by_condition(
        &self,
        list: Source<Vec<Address>>,
        condition: Mount<Address, bool>,
        f: Callback<Vec<Address>>,
    ) -> Result<Forget, EngineError> {
        follow_all_by_condition(list, condition, f).await
    }
}
