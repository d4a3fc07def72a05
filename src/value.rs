//! Values: one produced result of a single build, with reference counting.
//!
//! A value starts with a count of one, owned by its node. Builds hold extra
//! references to the values they read so those cannot be disposed while the
//! build is still resolving. Once the value resolves, the holds move into the
//! value itself and are released when it is disposed.

use std::any::{Any, TypeId};
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use futures::task::LocalSpawn;

use crate::output::{ErasedOutput, Settled, Shared};
use crate::ResourceError;

/// Called exactly once when a value resolves. Returns the holds the value
/// keeps until it is disposed.
pub(crate) type OnReady = Box<dyn FnOnce(&Value) -> Vec<Hold>>;

/// The concrete result type a generator produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OutputType {
    id: TypeId,
    name: &'static str,
}

impl OutputType {
    pub(crate) fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub(crate) fn check<T: 'static>(&self, resource: &str) -> Result<(), ResourceError> {
        if self.id == TypeId::of::<T>() {
            Ok(())
        } else {
            Err(ResourceError::TypeMismatch {
                resource: resource.to_owned(),
                expected: std::any::type_name::<T>(),
                actual: self.name,
            })
        }
    }
}

enum State {
    InFlight {
        on_ready: Option<OnReady>,
        waiters: Vec<Waker>,
    },
    Settled {
        result: Option<Rc<dyn Any>>,
        disposer: Option<Box<dyn FnOnce()>>,
        deps: Vec<Hold>,
    },
    Disposed,
}

pub(crate) struct Value {
    count: Cell<usize>,
    version: u64,
    debug_name: Rc<str>,
    output: OutputType,
    live: Rc<Cell<usize>>,
    state: RefCell<State>,
}

impl Value {
    /// Wrap a generator output. Ready outputs resolve before this returns;
    /// deferred ones resolve when their future completes on `spawner`.
    pub(crate) fn new(
        output: ErasedOutput,
        version: u64,
        debug_name: Rc<str>,
        output_type: OutputType,
        live: Rc<Cell<usize>>,
        spawner: Option<&Rc<dyn LocalSpawn>>,
        on_ready: OnReady,
    ) -> Rc<Self> {
        live.set(live.get() + 1);
        let value = Rc::new(Self {
            count: Cell::new(1),
            version,
            debug_name,
            output: output_type,
            live,
            state: RefCell::new(State::InFlight {
                on_ready: Some(on_ready),
                waiters: Vec::new(),
            }),
        });

        match output {
            ErasedOutput::Ready(settled) => value.settle(Ok(settled)),
            ErasedOutput::Deferred(future) => match spawner {
                Some(spawner) => {
                    let task = value.clone();
                    let spawned = spawner.spawn_local_obj(
                        Box::new(async move {
                            let result = future.await;
                            task.settle(result);
                        })
                        .into(),
                    );
                    if let Err(err) = spawned {
                        value.settle(Err(anyhow::Error::new(err)));
                    }
                }
                None => value.settle(Err(anyhow::anyhow!(
                    "deferred result produced but no spawner is configured"
                ))),
            },
        }
        value
    }

    fn settle(&self, result: anyhow::Result<Settled>) {
        let (on_ready, waiters) = match &mut *self.state.borrow_mut() {
            State::InFlight { on_ready, waiters } => (on_ready.take(), std::mem::take(waiters)),
            _ => return,
        };
        let Some(on_ready) = on_ready else {
            return;
        };

        let (result, disposer) = match result {
            Ok(settled) => (Some(settled.result), settled.disposer),
            Err(error) => {
                tracing::error!(resource = %self.debug_name, error = ?error, "resource had error");
                (None, None)
            }
        };
        *self.state.borrow_mut() = State::Settled {
            result,
            disposer,
            deps: Vec::new(),
        };

        let held = on_ready(self);
        if let State::Settled { deps, .. } = &mut *self.state.borrow_mut() {
            *deps = held;
        }

        // Orphaned before it finished resolving.
        if self.count.get() == 0 {
            self.dispose();
        }
        for waker in waiters {
            waker.wake();
        }
    }

    fn dispose(&self) {
        let state = {
            let mut state = self.state.borrow_mut();
            if !matches!(*state, State::Settled { .. }) {
                return;
            }
            std::mem::replace(&mut *state, State::Disposed)
        };
        self.live.set(self.live.get() - 1);
        if let State::Settled {
            result,
            disposer,
            deps,
        } = state
        {
            if let Some(disposer) = disposer {
                disposer();
            }
            drop(result);
            drop(deps);
        }
    }

    pub(crate) fn increment(&self) {
        let count = self.count.get();
        if count > 0 {
            self.count.set(count + 1);
        }
    }

    pub(crate) fn decrement(&self) {
        let count = self.count.get();
        if count == 0 {
            return;
        }
        self.count.set(count - 1);
        if count == 1 {
            // Still in flight: disposal happens once it settles.
            self.dispose();
        }
    }

    #[cfg(test)]
    pub(crate) fn count(&self) -> usize {
        self.count.get()
    }

    pub(crate) fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn output_type(&self) -> OutputType {
        self.output
    }

    pub(crate) fn debug_name(&self) -> &str {
        &self.debug_name
    }

    pub(crate) fn is_pending(&self) -> bool {
        matches!(*self.state.borrow(), State::InFlight { .. })
    }

    #[cfg(test)]
    pub(crate) fn is_disposed(&self) -> bool {
        matches!(*self.state.borrow(), State::Disposed)
    }

    /// The resolved result, absent while in flight, after a failure and after
    /// disposal.
    pub(crate) fn result(&self) -> Option<Rc<dyn Any>> {
        match &*self.state.borrow() {
            State::Settled { result, .. } => result.clone(),
            _ => None,
        }
    }

    fn poll_settled(&self, cx: &mut Context<'_>) -> Poll<()> {
        match &mut *self.state.borrow_mut() {
            State::InFlight { waiters, .. } => {
                if !waiters.iter().any(|w| w.will_wake(cx.waker())) {
                    waiters.push(cx.waker().clone());
                }
                Poll::Pending
            }
            _ => Poll::Ready(()),
        }
    }
}

/// A counted reference to a value: acquiring increments, dropping decrements.
pub(crate) struct Hold(Rc<Value>);

impl Hold {
    pub(crate) fn acquire(value: &Rc<Value>) -> Self {
        value.increment();
        Hold(value.clone())
    }

    /// Take over the reference a value is created with.
    pub(crate) fn adopt(value: Rc<Value>) -> Self {
        Hold(value)
    }

    pub(crate) fn value(&self) -> &Rc<Value> {
        &self.0
    }
}

impl Drop for Hold {
    fn drop(&mut self) {
        self.0.decrement();
    }
}

pub(crate) fn downcast<T: 'static>(result: Rc<dyn Any>) -> Option<Shared<T>> {
    result.downcast::<RefCell<T>>().ok()
}

/// The typed carrier of one build's result, as returned by
/// [`Resources::get`](crate::Resources::get) and
/// [`ResourceDeps::get`](crate::ResourceDeps::get).
///
/// The result may still be in flight. Use [`Handle::get`] to read it if it has
/// resolved, or [`Handle::wait`] to await it.
pub struct Handle<T> {
    value: Rc<Value>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("resource", &self.value.debug_name())
            .field("version", &self.value.version())
            .field("pending", &self.value.is_pending())
            .finish()
    }
}

impl<T: 'static> Handle<T> {
    pub(crate) fn new(value: Rc<Value>) -> Result<Self, ResourceError> {
        value.output_type().check::<T>(value.debug_name())?;
        Ok(Self {
            value,
            _marker: PhantomData,
        })
    }

    pub(crate) fn value(&self) -> &Rc<Value> {
        &self.value
    }

    /// The resolved result, if the build has resolved successfully.
    pub fn get(&self) -> Option<Shared<T>> {
        self.value.result().and_then(downcast)
    }

    /// The resolved result, or [`ResourceError::Pending`] if there is none.
    ///
    /// Convenient inside generators: `*deps.get::<i32>("/a", ())?.resolved()?.borrow()`.
    pub fn resolved(&self) -> Result<Shared<T>, ResourceError> {
        self.get().ok_or_else(|| ResourceError::Pending {
            resource: self.value.debug_name().to_owned(),
        })
    }

    /// A clone of the resolved result.
    pub fn cloned(&self) -> Option<T>
    where
        T: Clone,
    {
        self.get().map(|v| v.borrow().clone())
    }

    /// True while the build's deferred result has not resolved.
    pub fn is_pending(&self) -> bool {
        self.value.is_pending()
    }

    /// The generation this result was built for.
    pub fn version(&self) -> u64 {
        self.value.version()
    }

    /// Wait for the result to resolve. Yields `None` if it failed.
    pub fn wait(&self) -> Wait<T> {
        Wait {
            value: self.value.clone(),
            _marker: PhantomData,
        }
    }
}

/// Future returned by [`Handle::wait`].
pub struct Wait<T> {
    value: Rc<Value>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: 'static> Future for Wait<T> {
    type Output = Option<Shared<T>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.value
            .poll_settled(cx)
            .map(|()| self.value.result().and_then(downcast))
    }
}
