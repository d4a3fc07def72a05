//! Nodes: the persistent identity and build state of one resource instance.

use std::any::Any;
use std::rc::Rc;

use indexmap::IndexSet;

use crate::key::{Arg, ResourceKey};
use crate::output::ErasedOutput;
use crate::runtime::ResourceDeps;
use crate::value::{Hold, OutputType, Value};

/// Identifies a node in a [`NodeMap`](crate::NodeMap).
///
/// Ids are generation-tagged: once a node is removed, its id never resolves
/// again, even if the slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    pub(crate) slot: usize,
    pub(crate) serial: u64,
}

/// An insertion-ordered set of node ids.
pub type NodeSet = IndexSet<NodeId, ahash::RandomState>;

pub(crate) type GenFn = dyn Fn(&mut ResourceDeps<'_>, &[Arg]) -> anyhow::Result<ErasedOutput>;

/// A registered generator with its output type erased.
pub(crate) struct Generator {
    pub(crate) output: OutputType,
    pub(crate) build: Box<GenFn>,
}

/// The state of one resource instance.
///
/// `request` is the generation the node wants; the value it holds was built
/// for some generation, and the node is stale while that is behind `request`.
/// `cache` is the last successfully resolved result, which survives
/// invalidation until a newer build resolves.
pub struct Node {
    key: ResourceKey,
    debug_name: Rc<str>,
    pub(crate) generator: Rc<Generator>,
    pub(crate) request: u64,
    pub(crate) version: u64,
    pub(crate) deps: NodeSet,
    pub(crate) subs: NodeSet,
    pub(crate) cache_deps: NodeSet,
    pub(crate) value: Option<Hold>,
    pub(crate) cache: Option<Rc<dyn Any>>,
}

impl Node {
    pub(crate) fn new(key: ResourceKey, generator: Rc<Generator>, base_version: u64) -> Self {
        let debug_name = Rc::from(key.debug_name());
        Self {
            key,
            debug_name,
            generator,
            request: base_version + 1,
            version: base_version,
            deps: NodeSet::default(),
            subs: NodeSet::default(),
            cache_deps: NodeSet::default(),
            value: None,
            cache: None,
        }
    }

    /// The resource identity.
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// The JSON debug name, e.g. `["/terrain",3]`.
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }

    pub(crate) fn shared_name(&self) -> Rc<str> {
        self.debug_name.clone()
    }

    /// The requested generation. Strictly increases on every invalidation.
    pub fn request(&self) -> u64 {
        self.request
    }

    /// The generation of the cached result.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// True if a build is needed to bring this node up to date.
    pub fn is_stale(&self) -> bool {
        self.value
            .as_ref()
            .map_or(true, |v| v.value().version() < self.request)
    }

    /// True if the node holds a resolved result.
    pub fn has_cache(&self) -> bool {
        self.cache.is_some()
    }

    /// Nodes read by the most recent builds, including the dependencies of the
    /// cached result.
    pub fn deps(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.deps.iter().copied()
    }

    /// Nodes that read this one during their most recent build.
    pub fn subs(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.subs.iter().copied()
    }

    /// Dependencies of the cached result.
    pub fn cache_deps(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.cache_deps.iter().copied()
    }

    pub(crate) fn value(&self) -> Option<&Rc<Value>> {
        self.value.as_ref().map(Hold::value)
    }

    /// Take a resolved build as the cached result unless a newer one is
    /// already cached.
    pub(crate) fn adopt(&mut self, version: u64, result: Option<Rc<dyn Any>>, deps: NodeSet) {
        if self.cache.is_none() || self.version <= version {
            self.version = version;
            self.cache = result;
            self.deps.extend(deps.iter().copied());
            self.cache_deps = deps;
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("key", &self.key)
            .field("request", &self.request)
            .field("version", &self.version)
            .field("deps", &self.deps.len())
            .field("subs", &self.subs.len())
            .finish_non_exhaustive()
    }
}
