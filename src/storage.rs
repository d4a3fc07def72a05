//! Keyed storage for nodes.

use std::collections::HashMap;

use slab::Slab;

use crate::key::ResourceKey;
use crate::node::{Node, NodeId};
use crate::value::Hold;

struct Slot {
    serial: u64,
    node: Node,
}

/// Arena of nodes indexed by their [`ResourceKey`].
///
/// Nodes live in a slab and are addressed by generation-tagged [`NodeId`]s.
/// A key may not be a strict prefix of another key in the map: `/n` with
/// `(1,)` and `/n` with `(1, 2)` conflict and panic, while `(1,)` and `(2, 3)`
/// coexist.
#[derive(Default)]
pub struct NodeMap {
    nodes: Slab<Slot>,
    index: HashMap<ResourceKey, NodeId, ahash::RandomState>,
    /// Strict prefixes of stored keys, with the number of keys extending each.
    prefixes: HashMap<ResourceKey, usize, ahash::RandomState>,
    next_serial: u64,
    released: Vec<Hold>,
}

impl NodeMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes in the map.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the map holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Look up the node for a key.
    pub fn get(&self, key: &ResourceKey) -> Option<NodeId> {
        self.index.get(key).copied()
    }

    /// Returns true if the id refers to a live node.
    pub fn contains(&self, id: NodeId) -> bool {
        self.node(id).is_some()
    }

    /// The node for an id, if it is still in the map.
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes
            .get(id.slot)
            .filter(|slot| slot.serial == id.serial)
            .map(|slot| &slot.node)
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes
            .get_mut(id.slot)
            .filter(|slot| slot.serial == id.serial)
            .map(|slot| &mut slot.node)
    }

    /// Store a node under its key. Returns the node's id and whether the key
    /// was newly inserted; a replaced node gets a fresh id.
    pub(crate) fn set(&mut self, node: Node) -> (NodeId, bool) {
        let key = node.key().clone();
        let serial = self.next_serial;
        self.next_serial += 1;
        match self.index.get(&key).copied() {
            Some(old) => {
                self.nodes[old.slot] = Slot { serial, node };
                let id = NodeId {
                    slot: old.slot,
                    serial,
                };
                self.index.insert(key, id);
                (id, false)
            }
            None => {
                self.add_prefixes(&key);
                let slot = self.nodes.insert(Slot { serial, node });
                let id = NodeId { slot, serial };
                self.index.insert(key, id);
                (id, true)
            }
        }
    }

    /// Remove the node stored under a key without freeing it.
    pub fn delete(&mut self, key: &ResourceKey) -> Option<Node> {
        let id = self.index.remove(key)?;
        self.remove_prefixes(key);
        Some(self.nodes.remove(id.slot).node)
    }

    /// Remove a node by id without freeing it.
    pub fn remove(&mut self, id: NodeId) -> Option<Node> {
        self.node(id)?;
        let slot = self.nodes.remove(id.slot);
        self.index.remove(slot.node.key());
        self.remove_prefixes(slot.node.key());
        Some(slot.node)
    }

    fn add_prefixes(&mut self, key: &ResourceKey) {
        assert!(
            !self.prefixes.contains_key(key),
            "resource path conflict: {} is a prefix of a stored key",
            key.debug_name(),
        );
        for prefix in strict_prefixes(key) {
            assert!(
                !self.index.contains_key(&prefix),
                "resource path conflict: {} extends stored key {}",
                key.debug_name(),
                prefix.debug_name(),
            );
        }
        for prefix in strict_prefixes(key) {
            *self.prefixes.entry(prefix).or_default() += 1;
        }
    }

    fn remove_prefixes(&mut self, key: &ResourceKey) {
        for prefix in strict_prefixes(key) {
            if let Some(count) = self.prefixes.get_mut(&prefix) {
                *count -= 1;
                if *count == 0 {
                    self.prefixes.remove(&prefix);
                }
            }
        }
    }

    /// Iterate over all nodes in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter().map(|(slot, s)| {
            (
                NodeId {
                    slot,
                    serial: s.serial,
                },
                &s.node,
            )
        })
    }

    /// Ids of all nodes.
    pub fn ids(&self) -> Vec<NodeId> {
        self.iter().map(|(id, _)| id).collect()
    }

    /// Detach a node from the subscriber sets of its dependencies, reset its
    /// dependencies to those of its cached result, drop its subscribers and
    /// bump its requested generation.
    pub fn clear_node(&mut self, id: NodeId) {
        let Some(node) = self.node_mut(id) else {
            return;
        };
        let reset = node.cache_deps.clone();
        let deps = std::mem::replace(&mut node.deps, reset);
        node.subs.clear();
        node.request += 1;
        for dep in deps {
            if let Some(dep) = self.node_mut(dep) {
                dep.subs.swap_remove(&id);
            }
        }
    }

    /// Clear a node and release everything it caches. The node stays in the
    /// map; use [`NodeMap::remove`] to drop it.
    pub fn free_node(&mut self, id: NodeId) {
        self.clear_node(id);
        let Some(node) = self.node_mut(id) else {
            return;
        };
        let value = node.value.take();
        node.cache = None;
        node.cache_deps.clear();
        node.deps.clear();
        // Released values are dropped by the owner once it no longer borrows
        // the map, so cleanup hooks never run against a borrowed map.
        self.released.extend(value);
    }

    /// Free and remove every node.
    pub fn clear(&mut self) {
        for id in self.ids() {
            self.free_node(id);
        }
        self.nodes.clear();
        self.index.clear();
        self.prefixes.clear();
    }

    pub(crate) fn take_released(&mut self) -> Vec<Hold> {
        std::mem::take(&mut self.released)
    }
}

fn strict_prefixes(key: &ResourceKey) -> impl Iterator<Item = ResourceKey> + '_ {
    let args = key.args();
    (0..args.len()).map(move |len| ResourceKey::new(key.path(), &args[..len]))
}

impl std::fmt::Debug for NodeMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.iter().map(|(_, node)| (node.key(), node)))
            .finish()
    }
}
