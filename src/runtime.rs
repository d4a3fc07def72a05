//! The resource runtime: registration, lazy builds and invalidation.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::{Rc, Weak};
use std::sync::Arc;

use futures::future::{FutureExt, LocalBoxFuture};
use futures::task::LocalSpawn;
use indexmap::IndexMap;

use crate::audit::{self, AuditOptions};
use crate::collector::{DefaultNodeCollector, NodeCollector};
use crate::key::{Arg, IntoArgs, ResourceKey};
use crate::node::{Generator, Node, NodeId, NodeSet};
use crate::output::{ErasedOutput, Output, Shared};
use crate::value::{downcast, Handle, Hold, OnReady, OutputType, Value};
use crate::ResourceError;

/// True if `path` is a `/`-separated sequence of `[A-Za-z0-9+=_-]` tokens.
fn is_valid_path(path: &str) -> bool {
    path.len() > 1
        && path.starts_with('/')
        && path
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'=' | b'_' | b'-'))
}

/// A dependency-tracked cache of named, parameterized resources.
///
/// Resources are built lazily on first access, memoized, transitively
/// invalidated when something they read changes, and dropped by the configured
/// [`NodeCollector`] once nothing uses them.
///
/// The runtime is single-threaded. Cloning is cheap and every clone refers to
/// the same cache.
///
/// # Example
///
/// ```
/// use resource_flow::{Output, ResourcesBuilder};
///
/// let resources = ResourcesBuilder::new()
///     .add_global("/a", 1)
///     .add("/b", |deps, _| {
///         let a = deps.get::<i32>("/a", ())?.resolved()?;
///         let b = *a.borrow() + 1;
///         Ok(Output::value(b))
///     })
///     .build();
///
/// assert_eq!(resources.get::<i32>("/b", ())?.cloned(), Some(2));
/// resources.update::<i32>("/a", (), |a| *a += 10)?;
/// assert_eq!(resources.get::<i32>("/b", ())?.cloned(), Some(12));
/// # Ok::<(), resource_flow::ResourceError>(())
/// ```
#[derive(Clone)]
pub struct Resources {
    inner: Rc<Inner>,
}

struct Inner {
    generators: HashMap<String, Rc<Generator>, ahash::RandomState>,
    nodes: RefCell<crate::storage::NodeMap>,
    collector: RefCell<Box<dyn NodeCollector>>,
    /// Nodes whose generators are currently running, outermost first.
    building: RefCell<Vec<NodeId>>,
    base_version: u64,
    spawner: Option<Rc<dyn LocalSpawn>>,
    server_context: bool,
    live: Rc<Cell<usize>>,
}

/// Pops the build stack even if a generator panics.
struct BuildFrame<'a>(&'a RefCell<Vec<NodeId>>);

impl Drop for BuildFrame<'_> {
    fn drop(&mut self) {
        self.0.borrow_mut().pop();
    }
}

impl Inner {
    /// Look up or create the node for a key, and mark it as used.
    fn node(&self, key: ResourceKey) -> Result<NodeId, ResourceError> {
        let existing = self.nodes.borrow().get(&key);
        let id = match existing {
            Some(id) => id,
            None => {
                let generator = self
                    .generators
                    .get(key.path())
                    .ok_or_else(|| ResourceError::UnknownResource {
                        path: key.path().to_owned(),
                    })?
                    .clone();
                let node = Node::new(key, generator, self.base_version);
                self.nodes.borrow_mut().set(node).0
            }
        };
        self.collector.borrow_mut().preserve(id);
        Ok(id)
    }

    fn read_node<R>(&self, id: NodeId, f: impl FnOnce(&Node) -> R) -> R {
        let nodes = self.nodes.borrow();
        match nodes.node(id) {
            Some(node) => f(node),
            None => panic!("resource node {id:?} vanished while in use"),
        }
    }

    fn check<T: 'static>(&self, id: NodeId) -> Result<(), ResourceError> {
        self.read_node(id, |node| node.generator.output.check::<T>(node.debug_name()))
    }

    /// The node's current value, building a new one if the node is stale.
    fn node_value(self: &Rc<Self>, id: NodeId) -> Result<Rc<Value>, ResourceError> {
        let current = self.read_node(id, |node| {
            if node.is_stale() {
                None
            } else {
                node.value().cloned()
            }
        });
        match current {
            Some(value) => Ok(value),
            None => self.build(id),
        }
    }

    fn build(self: &Rc<Self>, id: NodeId) -> Result<Rc<Value>, ResourceError> {
        if let Some(pos) = self.building.borrow().iter().position(|&b| b == id) {
            let nodes = self.nodes.borrow();
            let name = |id: NodeId| {
                nodes
                    .node(id)
                    .map_or_else(|| format!("{id:?}"), |n| n.debug_name().to_owned())
            };
            let mut path: Vec<String> = self.building.borrow()[pos..]
                .iter()
                .map(|&b| name(b))
                .collect();
            path.push(name(id));
            return Err(ResourceError::Cycle { path });
        }

        let (generator, args, name, version) = self.read_node(id, |node| {
            assert!(node.is_stale(), "attempt to build fresh resource {}", node.debug_name());
            assert!(
                node.subs.is_empty(),
                "invalid lingering subscribers on {}",
                node.debug_name()
            );
            (
                node.generator.clone(),
                node.key().args().to_vec(),
                node.shared_name(),
                node.request(),
            )
        });
        tracing::trace!(resource = %name, version, "building resource");

        let mut deps = ResourceDeps {
            resources: self,
            node: id,
            node_deps: NodeSet::default(),
            held: HeldValues::default(),
        };
        let output = {
            self.building.borrow_mut().push(id);
            let _frame = BuildFrame(&self.building);
            (generator.build)(&mut deps, &args)
        };
        let ResourceDeps { node_deps, held, .. } = deps;

        let output = match output {
            Ok(output) => output,
            Err(error) => {
                drop(held);
                return Err(match error.downcast::<ResourceError>() {
                    Ok(inner) => inner,
                    Err(error) => {
                        tracing::error!(resource = %name, error = ?error, "resource had error");
                        ResourceError::Generator {
                            resource: name.to_string(),
                            error: Arc::new(error),
                        }
                    }
                });
            }
        };

        let prev = self
            .nodes
            .borrow_mut()
            .node_mut(id)
            .and_then(|node| node.value.take());
        let weak = Rc::downgrade(self);
        let on_ready: OnReady = Box::new(move |value: &Value| {
            adopt(&weak, id, value, node_deps);
            drop(prev);
            held.into_values().collect()
        });
        let value = Value::new(
            output,
            version,
            name,
            generator.output,
            self.live.clone(),
            self.spawner.as_ref(),
            on_ready,
        );

        let replaced = {
            let mut nodes = self.nodes.borrow_mut();
            match nodes.node_mut(id) {
                Some(node) => node.value.replace(Hold::adopt(value.clone())),
                None => Some(Hold::adopt(value.clone())),
            }
        };
        drop(replaced);
        Ok(value)
    }

    fn invalidate(&self, key: &ResourceKey) {
        let mut nodes = self.nodes.borrow_mut();
        let Some(root) = nodes.get(key) else {
            return;
        };
        let mut todo = vec![root];
        let mut done = HashSet::<NodeId, ahash::RandomState>::default();
        while let Some(id) = todo.pop() {
            if !done.insert(id) {
                continue;
            }
            let Some(node) = nodes.node(id) else {
                continue;
            };
            todo.extend(node.subs());
            nodes.clear_node(id);
        }
        tracing::trace!(resource = %key, cleared = done.len(), "invalidated resource");
    }
}

/// Promote a resolved value to its node's cache, unless the node is gone.
fn adopt(inner: &Weak<Inner>, id: NodeId, value: &Value, deps: NodeSet) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let mut nodes = inner.nodes.borrow_mut();
    if let Some(node) = nodes.node_mut(id) {
        node.adopt(value.version(), value.result(), deps);
    }
}

/// Dependency access handed to a generator while it builds.
///
/// Every [`ResourceDeps::get`] registers the dependency edge, so invalidating
/// the dependency also invalidates the resource being built, and holds the
/// dependency's value alive until the built value is disposed.
pub struct ResourceDeps<'a> {
    resources: &'a Rc<Inner>,
    node: NodeId,
    node_deps: NodeSet,
    held: HeldValues,
}

/// Values a build holds, one hold per distinct value.
type HeldValues = IndexMap<*const Value, Hold, ahash::RandomState>;

impl ResourceDeps<'_> {
    /// Read a dependency, building it first if needed.
    ///
    /// The returned handle may still be in flight if the dependency produced a
    /// deferred result.
    pub fn get<T: 'static>(
        &mut self,
        path: &str,
        args: impl IntoArgs,
    ) -> Result<Handle<T>, ResourceError> {
        let inner = self.resources;
        let dep = inner.node(ResourceKey::new(path, args))?;
        inner.check::<T>(dep)?;
        let handle = Handle::<T>::new(inner.node_value(dep)?)?;

        {
            let mut nodes = inner.nodes.borrow_mut();
            if let Some(node) = nodes.node_mut(self.node) {
                node.deps.insert(dep);
            }
            if let Some(dep) = nodes.node_mut(dep) {
                dep.subs.insert(self.node);
            }
        }
        self.node_deps.insert(dep);

        let value = handle.value();
        self.held
            .entry(Rc::as_ptr(value))
            .or_insert_with(|| Hold::acquire(value));
        Ok(handle)
    }
}

/// Invalidates a resource when dropped, so `update` propagates even when the
/// mutator panics or the read fails.
struct InvalidateOnDrop<'a> {
    inner: &'a Inner,
    key: ResourceKey,
}

impl Drop for InvalidateOnDrop<'_> {
    fn drop(&mut self) {
        self.inner.invalidate(&self.key);
    }
}

impl Resources {
    /// Start registering resources.
    pub fn builder() -> ResourcesBuilder {
        ResourcesBuilder::new()
    }

    /// Fetch the current value of a resource, building it if it is stale.
    ///
    /// The handle may carry a result that is still in flight.
    pub fn get<T: 'static>(&self, path: &str, args: impl IntoArgs) -> Result<Handle<T>, ResourceError> {
        let id = self.inner.node(ResourceKey::new(path, args))?;
        self.inner.check::<T>(id)?;
        Handle::new(self.inner.node_value(id)?)
    }

    /// The last resolved result, building first if the resource is stale.
    ///
    /// Does not wait for a deferred build: while it is in flight this returns
    /// the previous result, if any.
    pub fn cached<T: 'static>(
        &self,
        path: &str,
        args: impl IntoArgs,
    ) -> Result<Option<Shared<T>>, ResourceError> {
        let id = self.inner.node(ResourceKey::new(path, args))?;
        self.inner.check::<T>(id)?;
        if self.inner.read_node(id, Node::is_stale) {
            self.inner.build(id)?;
        }
        Ok(self.cache_of(id))
    }

    /// The last resolved result, never building.
    pub fn peek<T: 'static>(
        &self,
        path: &str,
        args: impl IntoArgs,
    ) -> Result<Option<Shared<T>>, ResourceError> {
        let id = self.inner.node(ResourceKey::new(path, args))?;
        self.inner.check::<T>(id)?;
        Ok(self.cache_of(id))
    }

    fn cache_of<T: 'static>(&self, id: NodeId) -> Option<Shared<T>> {
        self.inner
            .read_node(id, |node| node.cache.clone())
            .and_then(downcast)
    }

    /// Apply `f` to the resolved result once it is available.
    ///
    /// The value is held until the returned future completes or is dropped, so
    /// it cannot be disposed in between even if the resource is invalidated or
    /// collected. Yields `None` if the build failed.
    pub fn with<T, R, F>(
        &self,
        path: &str,
        args: impl IntoArgs,
        f: F,
    ) -> Result<LocalBoxFuture<'static, Option<R>>, ResourceError>
    where
        T: 'static,
        R: 'static,
        F: FnOnce(&T) -> R + 'static,
    {
        let handle = self.get::<T>(path, args)?;
        let hold = Hold::acquire(handle.value());
        Ok(async move {
            let result = handle.wait().await;
            let out = result.map(|value| f(&value.borrow()));
            drop(hold);
            out
        }
        .boxed_local())
    }

    /// Mark a resource and everything that transitively read it as stale.
    ///
    /// Nothing is rebuilt until it is next read. Does nothing if the resource
    /// was never used.
    pub fn invalidate(&self, path: &str, args: impl IntoArgs) {
        self.inner.invalidate(&ResourceKey::new(path, args));
    }

    /// Mutate the resolved result in place, then invalidate the resource.
    ///
    /// Invalidation happens even if the read fails or `f` panics.
    pub fn update<T: 'static>(
        &self,
        path: &str,
        args: impl IntoArgs,
        f: impl FnOnce(&mut T),
    ) -> Result<(), ResourceError> {
        let args = args.into_args();
        let _invalidate = InvalidateOnDrop {
            inner: &self.inner,
            key: ResourceKey::new(path, args.clone()),
        };
        let shared = self.get::<T>(path, args)?.resolved()?;
        f(&mut shared.borrow_mut());
        Ok(())
    }

    /// Replace the resolved result's contents, then invalidate the resource.
    ///
    /// The shared cell is kept: anyone holding the previous [`Shared`] sees the
    /// new value.
    pub fn set<T: 'static>(&self, path: &str, args: impl IntoArgs, value: T) -> Result<(), ResourceError> {
        self.update(path, args, move |old: &mut T| *old = value)
    }

    /// The generation the resource wants. Bumped by every invalidation.
    pub fn version(&self, path: &str, args: impl IntoArgs) -> Result<u64, ResourceError> {
        let id = self.inner.node(ResourceKey::new(path, args))?;
        Ok(self.inner.read_node(id, Node::request))
    }

    /// The generation of the cached result.
    pub fn cached_version(&self, path: &str, args: impl IntoArgs) -> Result<u64, ResourceError> {
        let id = self.inner.node(ResourceKey::new(path, args))?;
        Ok(self.inner.read_node(id, Node::version))
    }

    /// True if the next read will build.
    pub fn stale(&self, path: &str, args: impl IntoArgs) -> Result<bool, ResourceError> {
        let id = self.inner.node(ResourceKey::new(path, args))?;
        Ok(self.inner.read_node(id, Node::is_stale))
    }

    /// Dump the node graph, and write it to `options.download` if set and not
    /// running in a server context.
    pub fn audit(&self, options: &AuditOptions) -> Result<String, ResourceError> {
        let output = audit::render(&self.inner.nodes.borrow(), options.mode);
        if let Some(dir) = options.download.as_ref().filter(|_| !self.inner.server_context) {
            let path = dir.join(format!("audit.{}", options.mode.extension()));
            std::fs::write(&path, &output).map_err(|source| ResourceError::Audit { path, source })?;
        }
        Ok(output)
    }

    /// Number of nodes in the cache.
    pub fn count(&self) -> usize {
        self.inner.nodes.borrow().len()
    }

    /// Number of produced values that have not been disposed yet.
    pub fn live_values(&self) -> usize {
        self.inner.live.get()
    }

    /// Free and remove every node.
    ///
    /// # Panics
    ///
    /// Panics if called from inside a generator.
    pub fn clear(&self) {
        assert!(
            self.inner.building.borrow().is_empty(),
            "cannot clear resources while a build is in progress"
        );
        let released = {
            let mut nodes = self.inner.nodes.borrow_mut();
            nodes.clear();
            nodes.take_released()
        };
        drop(released);
    }

    /// Run the collector. Skipped while a build is in progress.
    pub fn collect(&self) {
        if !self.inner.building.borrow().is_empty() {
            tracing::trace!("skipping collection during build");
            return;
        }
        let released = {
            let mut nodes = self.inner.nodes.borrow_mut();
            self.inner.collector.borrow_mut().collect(&mut nodes);
            nodes.take_released()
        };
        drop(released);
    }
}

impl std::fmt::Debug for Resources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resources")
            .field("nodes", &self.count())
            .field("live_values", &self.live_values())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Resources`].
pub struct ResourcesBuilder {
    generators: HashMap<String, Rc<Generator>, ahash::RandomState>,
    collector: Option<Box<dyn NodeCollector>>,
    base_version: u64,
    spawner: Option<Rc<dyn LocalSpawn>>,
    server_context: bool,
}

impl Default for ResourcesBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourcesBuilder {
    /// Create a builder with no resources, an unbounded collector and no
    /// spawner.
    pub fn new() -> Self {
        Self {
            generators: HashMap::default(),
            collector: None,
            base_version: 0,
            spawner: None,
            server_context: false,
        }
    }

    /// Register a generator for `path`.
    ///
    /// The generator receives the dependency reader and the instance's
    /// arguments, and returns the result, possibly deferred.
    ///
    /// # Panics
    ///
    /// Panics if `path` is not a `/`-separated sequence of
    /// `[A-Za-z0-9+=_-]` tokens, or if it is already registered.
    pub fn add<T, F>(mut self, path: &str, generator: F) -> Self
    where
        T: 'static,
        F: Fn(&mut ResourceDeps<'_>, &[Arg]) -> anyhow::Result<Output<T>> + 'static,
    {
        assert!(
            !self.generators.contains_key(path),
            "duplicate resource path {path}"
        );
        assert!(is_valid_path(path), "invalid resource path: {path}");
        let build = move |deps: &mut ResourceDeps<'_>, args: &[Arg]| -> anyhow::Result<ErasedOutput> {
            Ok(generator(deps, args)?.erase())
        };
        self.generators.insert(
            path.to_owned(),
            Rc::new(Generator {
                output: OutputType::of::<T>(),
                build: Box::new(build),
            }),
        );
        self
    }

    /// Register a resource that always resolves to the same shared value.
    ///
    /// Combined with [`Resources::update`] and [`Resources::set`] this makes a
    /// mutable input that dependents track.
    pub fn add_global<T: 'static>(self, path: &str, value: T) -> Self {
        let shared: Shared<T> = Rc::new(RefCell::new(value));
        self.add(path, move |_, _| Ok(Output::shared(shared.clone())))
    }

    /// Set the retention policy. Defaults to [`DefaultNodeCollector::unbounded`].
    pub fn collector(mut self, collector: impl NodeCollector + 'static) -> Self {
        self.collector = Some(Box::new(collector));
        self
    }

    /// Set the generation new nodes start at.
    pub fn base_version(mut self, version: u64) -> Self {
        self.base_version = version;
        self
    }

    /// Set the executor deferred results are driven on.
    pub fn spawner(mut self, spawner: impl LocalSpawn + 'static) -> Self {
        self.spawner = Some(Rc::new(spawner));
        self
    }

    /// When set, [`Resources::audit`] never writes files.
    pub fn server_context(mut self, server_context: bool) -> Self {
        self.server_context = server_context;
        self
    }

    /// Build the runtime.
    pub fn build(self) -> Resources {
        let collector = self
            .collector
            .unwrap_or_else(|| Box::new(DefaultNodeCollector::unbounded()));
        Resources {
            inner: Rc::new(Inner {
                generators: self.generators,
                nodes: RefCell::new(crate::storage::NodeMap::new()),
                collector: RefCell::new(collector),
                building: RefCell::new(Vec::new()),
                base_version: self.base_version,
                spawner: self.spawner,
                server_context: self.server_context,
                live: Rc::new(Cell::new(0)),
            }),
        }
    }
}
