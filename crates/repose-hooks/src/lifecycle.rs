//! # Lifecycle hooks
//!
//! Mount, ready and update callbacks on top of the commit-time effects of
//! `repose_core`:
//!
//! - [`on_init`] runs once after the first commit; its cleanup runs on
//!   unmount.
//! - [`on_init_when_ready`] runs once, after the first commit at which its
//!   [`Readiness`] holds; its cleanup runs on unmount.
//! - [`watch`] runs after every commit whose dependencies differ from the
//!   previous run, cleaning up the previous run first.
//!
//! Every callback receives the [`StableBinding`] of the callbacks passed
//! alongside it (the `_with` variants), so listeners it installs keep
//! calling the component's latest closures:
//!
//! ```rust
//! use repose_core::Composition;
//! use repose_hooks::*;
//!
//! let comp = Composition::new();
//! comp.compose(|| {
//!     let greeting = "hello";
//!     on_init_with(
//!         CallbackMap::new().with("greet", move |()| log::info!("{greeting}")),
//!         |this| {
//!             this.call("greet", ());
//!             Cleanup::from_fn(|| log::info!("bye"))
//!         },
//!     );
//! });
//! comp.dispose();
//! ```
//!
//! A callback returns anything `Into<Cleanup>`; handing the cleanup back
//! through a future is reported, see [`crate::cleanup`].

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use repose_core::{Dispose, commit_effect, disposable_effect, remember};

use crate::{CallbackMap, Cleanup, StableBinding, diagnostics, normalize, remember_stable_callbacks};

/// Whether a deferred initialisation may run.
#[derive(Clone)]
pub enum Readiness {
    Flag(bool),
    /// Evaluated at each commit until it first holds.
    Predicate(Rc<dyn Fn() -> bool>),
}

impl Readiness {
    pub fn when(predicate: impl Fn() -> bool + 'static) -> Self {
        Readiness::Predicate(Rc::new(predicate))
    }

    pub fn is_ready(&self) -> bool {
        match self {
            Readiness::Flag(ready) => *ready,
            Readiness::Predicate(predicate) => predicate(),
        }
    }
}

impl From<bool> for Readiness {
    fn from(ready: bool) -> Self {
        Readiness::Flag(ready)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    /// The callback has run and its cleanup is installed.
    Active,
}

struct Activation {
    phase: Cell<Phase>,
    cleanup: RefCell<Option<Dispose>>,
}

impl Activation {
    fn new() -> Self {
        Self {
            phase: Cell::new(Phase::Idle),
            cleanup: RefCell::new(None),
        }
    }

    fn activate(&self, cleanup: Dispose) {
        *self.cleanup.borrow_mut() = Some(cleanup);
        self.phase.set(Phase::Active);
    }

    fn teardown(&self) {
        let cleanup = self.cleanup.borrow_mut().take();
        if let Some(d) = cleanup {
            d.run();
        }
        self.phase.set(Phase::Idle);
    }
}

pub fn on_init<C>(callback: impl FnOnce(&StableBinding) -> C + 'static)
where
    C: Into<Cleanup>,
{
    on_init_with(CallbackMap::new(), callback)
}

/// Runs `callback` once, after the first commit.
pub fn on_init_with<A, R, C>(
    callbacks: CallbackMap<A, R>,
    callback: impl FnOnce(&StableBinding<A, R>) -> C + 'static,
) where
    A: 'static,
    R: 'static,
    C: Into<Cleanup>,
{
    let this = remember_stable_callbacks(callbacks);
    let sink = diagnostics();
    disposable_effect((), move || normalize(callback(&this), "on_init", sink));
}

pub fn on_init_when_ready<C>(
    ready: impl Into<Readiness>,
    callback: impl FnOnce(&StableBinding) -> C + 'static,
) where
    C: Into<Cleanup>,
{
    on_init_when_ready_with(ready, CallbackMap::new(), callback)
}

/// Runs `callback` once, after the first commit at which `ready` holds.
/// Readiness turning false later does not tear it down; only unmount does.
pub fn on_init_when_ready_with<A, R, C>(
    ready: impl Into<Readiness>,
    callbacks: CallbackMap<A, R>,
    callback: impl FnOnce(&StableBinding<A, R>) -> C + 'static,
) where
    A: 'static,
    R: 'static,
    C: Into<Cleanup>,
{
    let this = remember_stable_callbacks(callbacks);
    let sink = diagnostics();
    let activation = remember(Activation::new);
    let ready = ready.into();

    let slot = activation.clone();
    commit_effect(move || {
        if slot.phase.get() == Phase::Idle && ready.is_ready() {
            slot.activate(normalize(callback(&this), "on_init_when_ready", sink));
        }
        None
    });

    // read at teardown, not at mount: activation may happen on a later commit
    disposable_effect((), move || Dispose::new(move || activation.teardown()));
}

pub fn watch<K, C>(deps: Vec<K>, callback: impl FnOnce(&StableBinding, &[Option<K>]) -> C + 'static)
where
    K: PartialEq + Clone + 'static,
    C: Into<Cleanup>,
{
    watch_with(deps, CallbackMap::new(), callback)
}

/// Runs `callback` after every commit whose `deps` differ by position from
/// the previous run's. `callback` also gets the previous run's `deps`, all
/// `None` on the first run.
pub fn watch_with<K, A, R, C>(
    deps: Vec<K>,
    callbacks: CallbackMap<A, R>,
    callback: impl FnOnce(&StableBinding<A, R>, &[Option<K>]) -> C + 'static,
) where
    K: PartialEq + Clone + 'static,
    A: 'static,
    R: 'static,
    C: Into<Cleanup>,
{
    let this = remember_stable_callbacks(callbacks);
    let sink = diagnostics();
    let prev_deps = remember(|| RefCell::new(deps.iter().map(|_| None).collect::<Vec<Option<K>>>()));

    let current = deps.clone();
    disposable_effect(deps, move || {
        let prev = prev_deps.replace(current.into_iter().map(Some).collect());
        normalize(callback(&this, prev.as_slice()), "watch", sink)
    });
}
