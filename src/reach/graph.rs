//! Dependency graph arena
//!
//! Pure bookkeeping for the reachability tracker. Nodes live in an arena keyed
//! by [`NodeKey`] and indexed by address. A node exists while something refers
//! to it: the root referrer or another node that lists it as a child.
//! Teardown is a graph operation: detach edges, then sweep every node no
//! longer reachable from a root-referenced node (orphaned cycles included).

use crate::types::Address;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey(u64);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Referrer {
    Root,
    Node(Address),
}

/// Lifecycle: `Mounting → Mounted`, then removed from the arena when drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Mounting,
    Mounted,
}

#[derive(Debug)]
struct Node<F> {
    address: Address,
    referrers: HashSet<Referrer>,
    children: BTreeSet<Address>,
    state: NodeState,
    subscription: Option<F>,
}

/// A node removed from the graph, with its subscription if it had one.
#[derive(Debug)]
pub struct Drained<F> {
    pub address: Address,
    pub subscription: Option<F>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attach {
    /// The node is new and must be mounted.
    Created,
    /// The node already existed; only the referrer was added.
    Existing,
}

#[derive(Debug)]
pub struct DependencyGraph<F> {
    nodes: HashMap<NodeKey, Node<F>>,
    index: HashMap<Address, NodeKey>,
    next_key: u64,
}

impl<F> Default for DependencyGraph<F> {
    fn default() -> Self {
        DependencyGraph {
            nodes: HashMap::new(),
            index: HashMap::new(),
            next_key: 0,
        }
    }
}

impl<F> DependencyGraph<F> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.index.contains_key(address)
    }

    pub fn state(&self, address: &Address) -> Option<NodeState> {
        self.node(address).map(|n| n.state)
    }

    pub fn referrers(&self, address: &Address) -> Option<&HashSet<Referrer>> {
        self.node(address).map(|n| &n.referrers)
    }

    pub fn children(&self, address: &Address) -> Option<&BTreeSet<Address>> {
        self.node(address).map(|n| &n.children)
    }

    fn node(&self, address: &Address) -> Option<&Node<F>> {
        self.index.get(address).and_then(|k| self.nodes.get(k))
    }

    fn node_mut(&mut self, address: &Address) -> Option<&mut Node<F>> {
        let key = *self.index.get(address)?;
        self.nodes.get_mut(&key)
    }

    /// Every node address, sorted.
    pub fn addresses(&self) -> Vec<Address> {
        let mut out: Vec<Address> = self.index.keys().cloned().collect();
        out.sort();
        out
    }

    /// Record that `referrer` points at `address`, creating the node if needed.
    pub fn attach(&mut self, address: &Address, referrer: Referrer) -> Attach {
        if let Some(node) = self.node_mut(address) {
            node.referrers.insert(referrer);
            return Attach::Existing;
        }
        let key = NodeKey(self.next_key);
        self.next_key += 1;
        let mut referrers = HashSet::new();
        referrers.insert(referrer);
        self.nodes.insert(
            key,
            Node {
                address: address.clone(),
                referrers,
                children: BTreeSet::new(),
                state: NodeState::Mounting,
                subscription: None,
            },
        );
        self.index.insert(address.clone(), key);
        Attach::Created
    }

    /// Store the subscription of a mounting node. Hands it back if the node
    /// was drained in the meantime, so the caller can tear it down.
    pub fn mounted(&mut self, address: &Address, subscription: F) -> Result<(), F> {
        match self.node_mut(address) {
            Some(node) if node.state == NodeState::Mounting => {
                node.subscription = Some(subscription);
                node.state = NodeState::Mounted;
                Ok(())
            }
            _ => Err(subscription),
        }
    }

    /// Replace the children of `address`.
    ///
    /// Returns the newly created children (to be mounted) and every node the
    /// change drained, or `None` if `address` is no longer in the graph.
    pub fn replace_children(
        &mut self,
        address: &Address,
        children: BTreeSet<Address>,
    ) -> Option<(Vec<Address>, Vec<Drained<F>>)> {
        let node = self.node_mut(address)?;
        let previous = std::mem::replace(&mut node.children, children.clone());

        let referrer = Referrer::Node(address.clone());
        for removed in previous.difference(&children) {
            if let Some(child) = self.node_mut(removed) {
                child.referrers.remove(&referrer);
            }
        }
        let mut created = Vec::new();
        for added in children.difference(&previous) {
            if self.attach(added, referrer.clone()) == Attach::Created {
                created.push(added.clone());
            }
        }

        let drained = if previous.difference(&children).next().is_some() {
            self.sweep()
        } else {
            Vec::new()
        };
        Some((created, drained))
    }

    /// Remove one referrer from `address` and sweep.
    pub fn detach(&mut self, address: &Address, referrer: &Referrer) -> Vec<Drained<F>> {
        if let Some(node) = self.node_mut(address) {
            node.referrers.remove(referrer);
        }
        self.sweep()
    }

    /// Remove every node not reachable from a root-referenced node.
    pub fn sweep(&mut self) -> Vec<Drained<F>> {
        let mut reachable: HashSet<NodeKey> = HashSet::new();
        let mut queue: VecDeque<NodeKey> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.referrers.contains(&Referrer::Root))
            .map(|(k, _)| *k)
            .collect();
        while let Some(key) = queue.pop_front() {
            if !reachable.insert(key) {
                continue;
            }
            if let Some(node) = self.nodes.get(&key) {
                for child in &node.children {
                    if let Some(child_key) = self.index.get(child) {
                        // Only follow edges the child still acknowledges.
                        let acknowledged = self
                            .nodes
                            .get(child_key)
                            .map(|c| c.referrers.contains(&Referrer::Node(node.address.clone())))
                            .unwrap_or(false);
                        if acknowledged {
                            queue.push_back(*child_key);
                        }
                    }
                }
            }
        }

        let orphaned: Vec<NodeKey> = self
            .nodes
            .keys()
            .filter(|k| !reachable.contains(*k))
            .copied()
            .collect();
        let mut drained = Vec::with_capacity(orphaned.len());
        for key in orphaned {
            if let Some(node) = self.nodes.remove(&key) {
                self.index.remove(&node.address);
                drained.push(Drained {
                    address: node.address,
                    subscription: node.subscription,
                });
            }
        }
        if !drained.is_empty() {
            let gone: HashSet<Referrer> = drained
                .iter()
                .map(|d| Referrer::Node(d.address.clone()))
                .collect();
            for node in self.nodes.values_mut() {
                node.referrers.retain(|r| !gone.contains(r));
            }
        }
        drained
    }

    /// Remove every node.
    pub fn drain_all(&mut self) -> Vec<Drained<F>> {
        self.index.clear();
        self.nodes
            .drain()
            .map(|(_, node)| Drained {
                address: node.address,
                subscription: node.subscription,
            })
            .collect()
    }
}
