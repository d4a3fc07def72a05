//! Tests for reference-counted disposal and garbage collection.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::Rc;

use futures::channel::oneshot;
use futures::executor::LocalPool;
use futures::future::{FutureExt, Shared as SharedFuture};
use futures::task::LocalSpawnExt;

use resource_flow::{
    DefaultNodeCollector, Output, Resolved, ResourceDeps, Resources, ResourcesBuilder, Shared,
};

// =============================================================================
// Fixtures
// =============================================================================

/// A resettable gate: futures created by `wait` complete once the gate is
/// signalled, and gates created after a `reset` stay closed until the next
/// signal.
struct Latch {
    tx: RefCell<Option<oneshot::Sender<()>>>,
    rx: RefCell<SharedFuture<oneshot::Receiver<()>>>,
    closed: RefCell<Vec<oneshot::Sender<()>>>,
}

impl Latch {
    fn new() -> Rc<Self> {
        let (tx, rx) = oneshot::channel();
        Rc::new(Self {
            tx: RefCell::new(Some(tx)),
            rx: RefCell::new(rx.shared()),
            closed: RefCell::new(Vec::new()),
        })
    }

    fn signal(&self) {
        if let Some(tx) = self.tx.borrow_mut().take() {
            let _ = tx.send(());
        }
    }

    fn reset(&self) {
        let (tx, rx) = oneshot::channel();
        // Keep unsignalled senders alive so earlier waiters stay blocked.
        if let Some(old) = self.tx.borrow_mut().replace(tx) {
            self.closed.borrow_mut().push(old);
        }
        *self.rx.borrow_mut() = rx.shared();
    }

    fn wait(&self) -> impl Future<Output = ()> + 'static {
        let rx = self.rx.borrow().clone();
        async move {
            let _ = rx.await;
        }
    }
}

#[derive(Debug, Default)]
struct Marker {
    disposed: bool,
    dep: Option<Shared<Marker>>,
}

impl Marker {
    fn resolved(dep: Option<Shared<Marker>>) -> Resolved<Marker> {
        Resolved::disposable(
            Marker {
                disposed: false,
                dep,
            },
            |marker| marker.disposed = true,
        )
    }
}

fn disposed(marker: &Shared<Marker>) -> bool {
    marker.borrow().disposed
}

fn dep(marker: &Shared<Marker>) -> Shared<Marker> {
    marker.borrow().dep.clone().unwrap()
}

/// Deferred marker that waits on `gate`, then on the value of `path`.
fn deferred_with_dep(
    deps: &mut ResourceDeps<'_>,
    gate: &Latch,
    path: &str,
) -> anyhow::Result<Output<Marker>> {
    let dep = deps.get::<Marker>(path, ())?;
    let gate = gate.wait();
    Ok(Output::deferred(async move {
        gate.await;
        let dep = dep.wait().await;
        anyhow::Ok(Marker::resolved(dep))
    }))
}

struct Fixture {
    pool: LocalPool,
    resources: Resources,
    start: Rc<Latch>,
    f_signal: Rc<Latch>,
    f_wait: Rc<Latch>,
}

impl Fixture {
    fn new() -> Self {
        let pool = LocalPool::new();
        let start = Latch::new();
        let f_signal = Latch::new();
        let f_wait = Latch::new();

        let (c_start, d_start, e_start) = (start.clone(), start.clone(), start.clone());
        let (f_start, signal, wait) = (start.clone(), f_signal.clone(), f_wait.clone());
        let resources = ResourcesBuilder::new()
            .add("/A", |_, _| Ok(Output::Ready(Marker::resolved(None))))
            .add("/B", |deps, _| {
                let a = deps.get::<Marker>("/A", ())?.resolved()?;
                Ok(Output::Ready(Marker::resolved(Some(a))))
            })
            .add("/C", move |_, _| {
                let gate = c_start.wait();
                Ok(Output::deferred(async move {
                    gate.await;
                    anyhow::Ok(Marker::resolved(None))
                }))
            })
            .add("/D", move |deps, _| deferred_with_dep(deps, &d_start, "/C"))
            .add("/E", move |deps, _| deferred_with_dep(deps, &e_start, "/D"))
            .add("/F", move |deps, _| {
                let e = deps.get::<Marker>("/E", ())?;
                let start = f_start.wait();
                let signal = signal.clone();
                let wait = wait.clone();
                Ok(Output::deferred(async move {
                    start.await;
                    let e = e.wait().await;
                    signal.signal();
                    wait.wait().await;
                    anyhow::Ok(Marker::resolved(e))
                }))
            })
            .collector(DefaultNodeCollector::new(0))
            .spawner(pool.spawner())
            .build();

        Self {
            pool,
            resources,
            start,
            f_signal,
            f_wait,
        }
    }

    fn get(&mut self, path: &str) -> Shared<Marker> {
        let handle = self.resources.get::<Marker>(path, ()).unwrap();
        self.pool.run_until_stalled();
        handle.get().unwrap()
    }

    fn cached(&self, path: &str) -> Option<Shared<Marker>> {
        self.resources.cached::<Marker>(path, ()).unwrap()
    }
}

// =============================================================================
// Collection
// =============================================================================

#[test]
fn test_simple_dispose() {
    let mut fixture = Fixture::new();
    let a = fixture.get("/A");
    assert!(!disposed(&a));

    // Requested since the last collection: survives one round.
    fixture.resources.collect();
    assert!(!disposed(&a));

    // Requested again: survives again.
    fixture.get("/A");
    fixture.resources.collect();
    assert!(!disposed(&a));

    // Not requested: collected.
    fixture.resources.collect();
    assert!(disposed(&a));
    assert_eq!(fixture.resources.live_values(), 0);
}

#[test]
fn test_deferred_dispose() {
    let mut fixture = Fixture::new();
    fixture.start.signal();
    let c = fixture.get("/C");
    assert!(!disposed(&c));

    fixture.resources.collect();
    assert!(!disposed(&c));

    fixture.resources.get::<Marker>("/C", ()).unwrap();
    fixture.resources.collect();
    assert!(!disposed(&c));

    fixture.resources.collect();
    assert!(disposed(&c));
}

#[test]
fn test_disposed_dependency() {
    let mut fixture = Fixture::new();
    let b = fixture.get("/B");
    assert!(!disposed(&b));

    fixture.resources.collect();
    assert!(!disposed(&b));

    let b = fixture.get("/B");
    fixture.resources.collect();
    assert!(!disposed(&b));
    assert!(!disposed(&dep(&b)));

    for _ in 0..2 {
        let b = fixture.cached("/B").unwrap();
        fixture.resources.collect();
        assert!(!disposed(&b));
        assert!(!disposed(&dep(&b)));
    }
}

#[test]
fn test_cached_dependencies_stay_live() {
    let mut fixture = Fixture::new();
    fixture.start.signal();
    let e = fixture.get("/E");
    assert!(!disposed(&e));
    assert!(!disposed(&dep(&e)));
    assert!(!disposed(&dep(&dep(&e))));

    // Nothing should need to resolve from here on.
    fixture.start.reset();

    fixture.resources.collect();
    let cached = fixture.cached("/E").unwrap();
    assert!(!disposed(&cached));
    assert!(!disposed(&dep(&cached)));
    assert!(!disposed(&dep(&dep(&cached))));

    fixture.resources.collect();
    assert!(fixture.cached("/E").is_some());
    fixture.resources.collect();
    fixture.resources.collect();
    assert!(fixture.cached("/E").is_none());
    assert!(disposed(&e));
}

#[test]
fn test_cached_transitive_dependencies_stay_live() {
    let mut fixture = Fixture::new();
    fixture.start.signal();
    fixture.get("/E");
    fixture.start.reset();

    // Invalidate a transitive dependency of /E.
    fixture.resources.collect();
    fixture.resources.invalidate("/C", ());
    let cached = fixture.cached("/E").unwrap();
    assert!(!disposed(&cached));
    assert!(!disposed(&dep(&cached)));
    assert!(!disposed(&dep(&dep(&cached))));

    fixture.resources.collect();
    let cached = fixture.cached("/E").unwrap();
    assert!(!disposed(&cached));
    assert!(!disposed(&dep(&cached)));
    assert!(!disposed(&dep(&dep(&cached))));
}

// =============================================================================
// Invalidation During Builds
// =============================================================================

#[test]
fn test_cached_nodes_keep_old_value_dependencies() {
    let mut fixture = Fixture::new();
    fixture.start.signal();
    fixture.f_wait.signal();
    fixture.get("/F");

    // The next build of /F never completes, so the first one stays cached.
    fixture.f_wait.reset();

    fixture.resources.invalidate("/C", ());
    let e = fixture.get("/E");
    assert!(!disposed(&e));
    assert!(!disposed(&dep(&e)));
    assert!(!disposed(&dep(&dep(&e))));

    let f = fixture.cached("/F").unwrap();
    assert!(!disposed(&f));
    assert!(!disposed(&dep(&f)));
    assert!(!disposed(&dep(&dep(&f))));
    assert!(!disposed(&dep(&dep(&dep(&f)))));
    assert!(!Rc::ptr_eq(&dep(&f), &e));
}

#[test]
fn test_dependencies_invalidated_mid_build() {
    let mut fixture = Fixture::new();
    fixture.start.signal();
    let pending = fixture.resources.get::<Marker>("/F", ()).unwrap();

    // Run until /F has read all its dependencies and waits on its own gate.
    let signalled = Rc::new(Cell::new(false));
    let flag = signalled.clone();
    let f_signal = fixture.f_signal.wait();
    fixture
        .pool
        .spawner()
        .spawn_local(async move {
            f_signal.await;
            flag.set(true);
        })
        .unwrap();
    fixture.pool.run_until_stalled();
    assert!(signalled.get());
    assert!(pending.is_pending());

    fixture.resources.invalidate("/C", ());
    let e = fixture.get("/E");
    assert!(!disposed(&e));
    assert!(!disposed(&dep(&e)));
    assert!(!disposed(&dep(&dep(&e))));

    // Now complete the original /F build.
    fixture.f_wait.signal();
    fixture.pool.run_until_stalled();
    let f = pending.get().unwrap();
    assert!(!disposed(&f));
    assert!(!disposed(&dep(&f)));
    assert!(!disposed(&dep(&dep(&f))));
    assert!(!disposed(&dep(&dep(&dep(&f)))));
}

#[test]
fn test_invalidation_mid_build_keeps_in_flight_deps() {
    let mut fixture = Fixture::new();
    fixture.start.signal();
    let pending = fixture.resources.get::<Marker>("/F", ()).unwrap();
    fixture.pool.run_until_stalled();
    assert!(pending.is_pending());
    // Later builds of /F never get past their first gate.
    fixture.start.reset();

    fixture.resources.invalidate("/C", ());
    fixture.resources.collect();

    // Not resolved until the gate opens.
    assert!(fixture.cached("/F").is_none());
    fixture.resources.collect();

    // Let the original /F complete.
    fixture.f_wait.signal();
    fixture.pool.run_until_stalled();

    let f = pending.get().unwrap();
    assert!(!disposed(&f));
    assert!(!disposed(&dep(&f)));
    assert!(!disposed(&dep(&dep(&f))));
    assert!(!disposed(&dep(&dep(&dep(&f)))));

    let cached = fixture.cached("/F").unwrap();
    assert!(Rc::ptr_eq(&cached, &f));
    assert!(!disposed(&dep(&dep(&dep(&cached)))));
}

// =============================================================================
// Reference Counting
// =============================================================================

#[test]
fn test_old_dependency_released_with_dependent() {
    let mut fixture = Fixture::new();
    let b = fixture.get("/B");
    let old_a = dep(&b);

    // A new /A is built, but the cached /B still holds the old one.
    fixture.resources.invalidate("/A", ());
    let new_a = fixture.get("/A");
    assert!(!Rc::ptr_eq(&old_a, &new_a));
    assert!(!disposed(&old_a));

    // Rebuilding /B drops the last holder of the old /A.
    let new_b = fixture.get("/B");
    assert!(disposed(&b));
    assert!(disposed(&old_a));
    assert!(!disposed(&new_b));
    assert!(Rc::ptr_eq(&dep(&new_b), &new_a));
    assert_eq!(fixture.resources.live_values(), 2);
}

#[test]
fn test_clear_disposes_everything_once() {
    let count = Rc::new(Cell::new(0));
    let on_dispose = count.clone();
    let resources = ResourcesBuilder::new()
        .add("/x", move |_, _| {
            let on_dispose = on_dispose.clone();
            Ok(Output::disposable(1u8, move |_| {
                on_dispose.set(on_dispose.get() + 1)
            }))
        })
        .build();

    resources.get::<u8>("/x", ()).unwrap();
    resources.clear();
    assert_eq!(count.get(), 1);
    assert_eq!(resources.count(), 0);
    assert_eq!(resources.live_values(), 0);

    resources.clear();
    resources.collect();
    assert_eq!(count.get(), 1);
}

#[test]
fn test_capacity_defers_purge() {
    let resources = ResourcesBuilder::new()
        .add("/n", |_, args| Ok(Output::value(args[0].to_string())))
        .collector(DefaultNodeCollector::new(3))
        .build();

    resources.get::<String>("/n", (1,)).unwrap();
    resources.get::<String>("/n", (2,)).unwrap();
    resources.collect();
    // Two kept nodes: under capacity, nothing is purged yet.
    resources.get::<String>("/n", (3,)).unwrap();
    resources.collect();
    assert_eq!(resources.count(), 3);

    // Marks accumulate until they reach capacity; then everything unmarked
    // goes.
    resources.get::<String>("/n", (3,)).unwrap();
    resources.get::<String>("/n", (4,)).unwrap();
    resources.collect();
    assert_eq!(resources.count(), 4);
    resources.get::<String>("/n", (5,)).unwrap();
    resources.collect();
    assert_eq!(resources.count(), 3);
    assert!(!resources.stale("/n", (3,)).unwrap());
}
