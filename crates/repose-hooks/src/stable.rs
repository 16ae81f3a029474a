//! # Closure-stable callbacks
//!
//! A component body runs again on every re-execution, and each run creates
//! new closures. Anything that outlives one run (an event listener, an
//! effect) and captures those closures ends up calling a stale one.
//!
//! [`remember_stable_callbacks`] records the latest closures on every pass
//! and returns a [`StableBinding`] that is built once per composition. Each
//! of its entries is a forwarder with a fixed identity that calls whatever
//! closure is recorded under its name *at call time*:
//!
//! ```rust
//! use repose_core::Composition;
//! use repose_hooks::*;
//!
//! let comp = Composition::new();
//! let render = |label: &'static str| {
//!     comp.compose(move || {
//!         remember_stable_callbacks(CallbackMap::new().with("label", move |()| label))
//!     })
//! };
//!
//! let first = render("first");
//! let second = render("second");
//! assert!(first.ptr_eq(&second));
//! assert_eq!(first.call("label", ()), Some("second"));
//! ```
//!
//! Because the forwarders never change, registering and later removing
//! `binding.get("on_resize")` as a listener always uses the same identity.

use std::cell::{OnceCell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use repose_core::remember;

/// Shared function handle; equality is identity.
pub struct Callback<A = (), R = ()>(Rc<dyn Fn(A) -> R>);

impl<A, R> Callback<A, R> {
    pub fn new(f: impl Fn(A) -> R + 'static) -> Self {
        Self(Rc::new(f))
    }

    pub fn call(&self, args: A) -> R {
        (self.0)(args)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl<A, R> Clone for Callback<A, R> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<A, R> PartialEq for Callback<A, R> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl<A, R> fmt::Debug for Callback<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callback({:p})", Rc::as_ptr(&self.0) as *const ())
    }
}

/// Named callbacks handed to a hook on one pass.
pub struct CallbackMap<A = (), R = ()> {
    entries: BTreeMap<String, Callback<A, R>>,
}

impl<A, R> Default for CallbackMap<A, R> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<A, R> CallbackMap<A, R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, f: impl Fn(A) -> R + 'static) -> Self {
        self.entries.insert(name.into(), Callback::new(f));
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, callback: Callback<A, R>) {
        self.entries.insert(name.into(), callback);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Fixed-identity forwarders, one per name recorded on the first pass.
pub struct StableBinding<A = (), R = ()> {
    forwarders: Rc<BTreeMap<String, Callback<A, R>>>,
}

impl<A, R> Clone for StableBinding<A, R> {
    fn clone(&self) -> Self {
        Self {
            forwarders: self.forwarders.clone(),
        }
    }
}

impl<A, R> StableBinding<A, R> {
    pub fn get(&self, name: &str) -> Option<&Callback<A, R>> {
        self.forwarders.get(name)
    }

    /// `None` when `name` had no callback on the first pass.
    pub fn call(&self, name: &str, args: A) -> Option<R> {
        self.get(name).map(|f| f.call(args))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.forwarders.keys().map(String::as_str)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.forwarders, &other.forwarders)
    }
}

/// The render-surviving cell behind a [`StableBinding`].
pub struct StableCallbacks<A = (), R = ()> {
    latest: RefCell<BTreeMap<String, Rc<RefCell<Callback<A, R>>>>>,
    binding: OnceCell<StableBinding<A, R>>,
}

impl<A, R> Default for StableCallbacks<A, R> {
    fn default() -> Self {
        Self {
            latest: RefCell::new(BTreeMap::new()),
            binding: OnceCell::new(),
        }
    }
}

impl<A: 'static, R: 'static> StableCallbacks<A, R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores this pass's callbacks and returns the binding built on the
    /// first call. Names missing from `map` keep their last callback.
    pub fn record(&self, map: CallbackMap<A, R>) -> StableBinding<A, R> {
        {
            let mut latest = self.latest.borrow_mut();
            for (name, callback) in map.entries {
                match latest.get(&name) {
                    Some(cell) => *cell.borrow_mut() = callback,
                    None => {
                        latest.insert(name, Rc::new(RefCell::new(callback)));
                    }
                }
            }
        }

        self.binding
            .get_or_init(|| {
                let latest = self.latest.borrow();
                let forwarders = latest
                    .iter()
                    .map(|(name, cell)| {
                        let cell = cell.clone();
                        let forward = Callback::new(move |args: A| {
                            // clone out so the callee may re-enter `record`
                            let target = cell.borrow().clone();
                            target.call(args)
                        });
                        (name.clone(), forward)
                    })
                    .collect();
                StableBinding {
                    forwarders: Rc::new(forwarders),
                }
            })
            .clone()
    }
}

/// Records `map` into this call site's cell and returns its stable binding.
pub fn remember_stable_callbacks<A: 'static, R: 'static>(
    map: CallbackMap<A, R>,
) -> StableBinding<A, R> {
    remember(StableCallbacks::<A, R>::new).record(map)
}
