//! What generators hand back: ready or deferred results, optionally carrying
//! a cleanup hook.

use std::any::Any;
use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;

use futures::future::{FutureExt, LocalBoxFuture};

/// How resolved results are shared between the cache and its readers.
///
/// [`Resources::set`](crate::Resources::set) and
/// [`Resources::update`](crate::Resources::update) mutate the cell in place,
/// so every holder of a `Shared<T>` observes the change.
pub type Shared<T> = Rc<RefCell<T>>;

/// Cleanup hook owned by the cache, run exactly once when the value is disposed.
pub type Cleanup<T> = Box<dyn FnOnce(&mut T)>;

/// A resolved generator result.
pub enum Resolved<T> {
    /// A result with nothing to release.
    Plain(Shared<T>),
    /// A result whose cleanup hook the cache runs when the value is disposed.
    ///
    /// The hook must not panic and must not call back into the
    /// [`Resources`](crate::Resources) that owns it.
    Disposable(Shared<T>, Cleanup<T>),
}

impl<T: 'static> Resolved<T> {
    /// Wrap a plain value.
    pub fn plain(value: T) -> Self {
        Resolved::Plain(Rc::new(RefCell::new(value)))
    }

    /// Wrap a value together with its cleanup hook.
    pub fn disposable(value: T, cleanup: impl FnOnce(&mut T) + 'static) -> Self {
        Resolved::Disposable(Rc::new(RefCell::new(value)), Box::new(cleanup))
    }

    /// The shared result.
    pub fn shared(&self) -> &Shared<T> {
        match self {
            Resolved::Plain(value) | Resolved::Disposable(value, _) => value,
        }
    }

    pub(crate) fn erase(self) -> Settled {
        match self {
            Resolved::Plain(value) => Settled {
                result: value,
                disposer: None,
            },
            Resolved::Disposable(value, cleanup) => {
                let target = value.clone();
                Settled {
                    result: value,
                    disposer: Some(Box::new(move || cleanup(&mut target.borrow_mut()))),
                }
            }
        }
    }
}

/// The return value of a generator: either a result that is ready now, or a
/// deferred computation the cache drives to completion on its spawner.
pub enum Output<T> {
    /// Resolved synchronously.
    Ready(Resolved<T>),
    /// Resolves when the future completes. An `Err` is logged and treated as
    /// "resolved to nothing".
    Deferred(LocalBoxFuture<'static, anyhow::Result<Resolved<T>>>),
}

impl<T: 'static> Output<T> {
    /// A plain value, ready now.
    pub fn value(value: T) -> Self {
        Output::Ready(Resolved::plain(value))
    }

    /// An existing shared cell, ready now. Returning the same cell from every
    /// build keeps its identity stable across invalidations.
    pub fn shared(value: Shared<T>) -> Self {
        Output::Ready(Resolved::Plain(value))
    }

    /// A value with a cleanup hook, ready now.
    pub fn disposable(value: T, cleanup: impl FnOnce(&mut T) + 'static) -> Self {
        Output::Ready(Resolved::disposable(value, cleanup))
    }

    /// A result produced by a future.
    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = anyhow::Result<Resolved<T>>> + 'static,
    {
        Output::Deferred(future.boxed_local())
    }

    pub(crate) fn erase(self) -> ErasedOutput {
        match self {
            Output::Ready(resolved) => ErasedOutput::Ready(resolved.erase()),
            Output::Deferred(future) => {
                ErasedOutput::Deferred(future.map(|r| r.map(Resolved::erase)).boxed_local())
            }
        }
    }
}

/// A type-erased resolved result plus its detached cleanup hook.
pub(crate) struct Settled {
    pub(crate) result: Rc<dyn Any>,
    pub(crate) disposer: Option<Box<dyn FnOnce()>>,
}

pub(crate) enum ErasedOutput {
    Ready(Settled),
    Deferred(LocalBoxFuture<'static, anyhow::Result<Settled>>),
}
