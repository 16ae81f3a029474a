//! # Busy counters
//!
//! A [`BusyStore`] counts outstanding work. Every `increment` must be
//! matched by a `decrement`; the store is busy while the count is positive.
//!
//! Stores form a tree: a child given its parent's [`BusyLink`] mirrors every
//! increment and decrement into the parent, so a page can show one loading
//! overlay for all of its sections. A link is write-only; a child never
//! reads its parent's count.
//!
//! ```rust
//! use repose_hooks::*;
//!
//! let page = BusyStore::new(BusyConfig::default());
//! let section = BusyStore::new(BusyConfig::default().with_parent(page.link()));
//!
//! section.increment();
//! assert!(page.effective_busy());
//! // the section defers to the page's indicator
//! assert!(section.is_busy());
//! assert!(!section.effective_busy());
//!
//! section.decrement();
//! assert!(!page.is_busy());
//! ```

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::rc::Rc;

use futures::FutureExt;
use futures::future::{self, LocalBoxFuture};
use repose_core::{Signal, remember, remember_signal, signal};

use crate::HooksError;

/// Whether a store's own busy flag is reported while it has a parent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Visibility {
    /// Always report the local count.
    AlwaysLocal,
    /// Report `false` while a parent is attached; the parent shows the work.
    #[default]
    SuppressedWhenParentPresent,
}

/// Write access to a busy counter.
pub trait BusySignal {
    fn increment(&self);
    fn decrement(&self);
}

/// A write-only handle to another store's counter.
#[derive(Clone)]
pub struct BusyLink(Rc<dyn BusySignal>);

impl BusyLink {
    pub fn new(target: impl BusySignal + 'static) -> Self {
        Self(Rc::new(target))
    }
}

impl BusySignal for BusyLink {
    fn increment(&self) {
        self.0.increment();
    }

    fn decrement(&self) {
        self.0.decrement();
    }
}

impl fmt::Debug for BusyLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BusyLink")
    }
}

#[derive(Clone, Debug, Default)]
pub struct BusyConfig {
    /// Store that mirrors this store's increments and decrements.
    pub parent: Option<BusyLink>,
    pub visibility: Visibility,
}

impl BusyConfig {
    pub fn with_parent(mut self, parent: BusyLink) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }
}

struct BusyInner {
    count: Signal<usize>,
    parent: RefCell<Option<BusyLink>>,
    visibility: Cell<Visibility>,
}

#[derive(Clone)]
pub struct BusyStore {
    inner: Rc<BusyInner>,
}

impl BusyStore {
    pub fn new(config: BusyConfig) -> Self {
        Self::with_counter(signal(0), config)
    }

    /// Uses `count` as the backing cell, e.g. one from `remember_signal`.
    pub fn with_counter(count: Signal<usize>, config: BusyConfig) -> Self {
        Self {
            inner: Rc::new(BusyInner {
                count,
                parent: RefCell::new(config.parent),
                visibility: Cell::new(config.visibility),
            }),
        }
    }

    /// Replaces parent and visibility; the count is untouched.
    pub fn configure(&self, config: BusyConfig) {
        *self.inner.parent.borrow_mut() = config.parent;
        self.inner.visibility.set(config.visibility);
    }

    pub fn increment(&self) {
        self.increment_local();
        if let Some(parent) = self.parent() {
            parent.increment();
        }
    }

    /// Never goes below zero. The parent is decremented regardless.
    pub fn decrement(&self) {
        self.decrement_local();
        if let Some(parent) = self.parent() {
            parent.decrement();
        }
    }

    pub fn count(&self) -> usize {
        self.inner.count.get()
    }

    pub fn is_busy(&self) -> bool {
        self.count() > 0
    }

    /// The flag to render: `is_busy`, unless suppressed by the visibility
    /// policy because a parent is attached.
    pub fn effective_busy(&self) -> bool {
        match self.inner.visibility.get() {
            Visibility::AlwaysLocal => self.is_busy(),
            Visibility::SuppressedWhenParentPresent => {
                self.inner.parent.borrow().is_none() && self.is_busy()
            }
        }
    }

    pub fn has_parent(&self) -> bool {
        self.inner.parent.borrow().is_some()
    }

    pub fn link(&self) -> BusyLink {
        BusyLink::new(self.clone())
    }

    /// Increments now and returns a ticket that performs the mirrored
    /// decrement when dropped, against the parent attached at this moment.
    pub fn enter(&self) -> BusyTicket {
        self.increment_local();
        let parent = self.parent();
        if let Some(parent) = &parent {
            parent.increment();
        }
        BusyTicket {
            store: self.clone(),
            parent,
        }
    }

    /// Wraps `f` so that calling it while [`effective_busy`](Self::effective_busy)
    /// rejects with [`HooksError::Blocked`] instead of running `f`.
    pub fn guard<A, T, E, F, Fut>(
        &self,
        name: impl Into<String>,
        f: F,
    ) -> impl Fn(A) -> LocalBoxFuture<'static, Result<T, E>> + 'static
    where
        A: 'static,
        F: Fn(A) -> Fut + 'static,
        Fut: Future<Output = Result<T, E>> + 'static,
        T: 'static,
        E: From<HooksError> + 'static,
    {
        let store = self.clone();
        let name = name.into();
        move |args| {
            if store.effective_busy() {
                log::warn!("function \"{name}\" was blocked since the store is busy.");
                let err = E::from(HooksError::Blocked { name: name.clone() });
                return future::ready(Err(err)).boxed_local();
            }
            f(args).boxed_local()
        }
    }

    /// Wraps `f` so that the store counts every call until its future
    /// settles. The output passes through unchanged.
    pub fn instrument_async<A, F, Fut>(
        &self,
        f: F,
    ) -> impl Fn(A) -> LocalBoxFuture<'static, Fut::Output> + 'static
    where
        A: 'static,
        F: Fn(A) -> Fut + 'static,
        Fut: Future + 'static,
        Fut::Output: 'static,
    {
        let store = self.clone();
        move |args| {
            let ticket = store.enter();
            let fut = f(args);
            async move {
                let out = fut.await;
                drop(ticket);
                out
            }
            .boxed_local()
        }
    }

    fn parent(&self) -> Option<BusyLink> {
        self.inner.parent.borrow().clone()
    }

    fn increment_local(&self) {
        self.inner.count.update(|c| *c += 1);
    }

    fn decrement_local(&self) {
        self.inner.count.update(|c| *c = c.saturating_sub(1));
    }
}

impl BusySignal for BusyStore {
    fn increment(&self) {
        BusyStore::increment(self);
    }

    fn decrement(&self) {
        BusyStore::decrement(self);
    }
}

impl fmt::Debug for BusyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusyStore")
            .field("count", &self.count())
            .field("visibility", &self.inner.visibility.get())
            .field("has_parent", &self.has_parent())
            .finish()
    }
}

/// One unit of in-flight work; dropping it releases the unit.
#[must_use = "dropping the ticket releases the busy count immediately"]
pub struct BusyTicket {
    store: BusyStore,
    parent: Option<BusyLink>,
}

impl Drop for BusyTicket {
    fn drop(&mut self) {
        self.store.decrement_local();
        if let Some(parent) = &self.parent {
            parent.decrement();
        }
    }
}

/// A store's state as seen by one pass.
#[derive(Clone, Debug)]
pub struct Busy {
    pub count: usize,
    /// `effective_busy` at the time of the pass.
    pub busy: bool,
    pub store: BusyStore,
}

/// A busy store owned by the current composition. Its writes trigger a
/// re-execution; `config` is re-applied on every pass.
pub fn remember_busy(config: BusyConfig) -> Busy {
    let count = remember_signal(|| 0usize);
    let store = remember(move || BusyStore::with_counter(count, BusyConfig::default()));
    store.configure(config);
    Busy {
        count: store.count(),
        busy: store.effective_busy(),
        store: (*store).clone(),
    }
}
