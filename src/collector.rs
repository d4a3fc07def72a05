//! Garbage collection of unused nodes.
//!
//! Collection is mark-and-sweep over the node graph. Every node touched since
//! the last collection is a root; roots and everything they transitively
//! depend on are kept, and all other nodes are freed and removed.

use std::collections::HashSet;

use crate::node::{Node, NodeId};
use crate::storage::NodeMap;

/// A strategy for deciding which nodes survive a collection.
pub trait NodeCollector {
    /// Called whenever a node is looked up through the public API or a build.
    fn preserve(&mut self, id: NodeId);

    /// Called from [`Resources::collect`](crate::Resources::collect). May free
    /// and remove nodes from `nodes`.
    fn collect(&mut self, nodes: &mut NodeMap);
}

/// The marking and sweeping half of a collector.
#[derive(Debug, Default)]
pub struct KeepPurger {
    todo: Vec<NodeId>,
    keep: HashSet<NodeId, ahash::RandomState>,
}

impl KeepPurger {
    /// Create a purger with nothing marked.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes currently marked to keep.
    pub fn keep_size(&self) -> usize {
        self.keep.len()
    }

    /// Queue a node to be marked.
    pub fn preserve(&mut self, id: NodeId) {
        self.todo.push(id);
    }

    /// Mark every queued node and its transitive dependencies.
    pub fn preserve_to_keep(&mut self, nodes: &NodeMap) {
        self.preserve_to_keep_with(nodes, |_, _| {});
    }

    /// Like [`KeepPurger::preserve_to_keep`], calling `on_keep` for each newly
    /// kept node. Queued ids that no longer resolve are skipped.
    pub fn preserve_to_keep_with(&mut self, nodes: &NodeMap, mut on_keep: impl FnMut(NodeId, &Node)) {
        while let Some(id) = self.todo.pop() {
            if self.keep.contains(&id) {
                continue;
            }
            let Some(node) = nodes.node(id) else {
                continue;
            };
            self.keep.insert(id);
            on_keep(id, node);
            self.todo.extend(node.deps());
        }
    }

    /// Free and remove every node that is not marked, then reset the marks.
    pub fn purge(&mut self, nodes: &mut NodeMap) {
        let _span = tracing::debug_span!("resources_purge").entered();
        let before = nodes.len();
        let doomed: Vec<NodeId> = nodes
            .ids()
            .into_iter()
            .filter(|id| !self.keep.contains(id))
            .collect();
        for &id in &doomed {
            nodes.free_node(id);
        }
        for &id in &doomed {
            nodes.remove(id);
        }
        tracing::debug!(
            before,
            kept = self.keep.len(),
            purged = doomed.len(),
            "purged resources"
        );
        self.keep.clear();
    }
}

/// Collects once the number of kept nodes reaches `capacity`.
///
/// Nodes touched between collections are marked eagerly on every
/// [`NodeCollector::collect`] call; the sweep only happens when the mark set
/// is at least `capacity` large. A capacity of zero purges on every call.
#[derive(Debug)]
pub struct DefaultNodeCollector {
    capacity: usize,
    keep_purger: KeepPurger,
}

impl DefaultNodeCollector {
    /// Create a collector with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            keep_purger: KeepPurger::new(),
        }
    }

    /// A collector that never purges.
    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    /// The configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of nodes currently marked to keep.
    pub fn keep_size(&self) -> usize {
        self.keep_purger.keep_size()
    }
}

impl Default for DefaultNodeCollector {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl NodeCollector for DefaultNodeCollector {
    fn preserve(&mut self, id: NodeId) {
        self.keep_purger.preserve(id);
    }

    fn collect(&mut self, nodes: &mut NodeMap) {
        self.keep_purger.preserve_to_keep(nodes);
        if self.keep_purger.keep_size() >= self.capacity {
            self.keep_purger.purge(nodes);
        }
    }
}
