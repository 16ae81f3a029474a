use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use crate::scope::Scope;

thread_local! {
    static CURRENT: RefCell<Vec<Rc<CompositionState>>> = const { RefCell::new(Vec::new()) };
}

#[derive(Default)]
pub struct Composer {
    pub slots: Vec<Box<dyn Any>>,
    pub cursor: usize,
    pub keyed_slots: HashMap<String, Box<dyn Any>>,
    commit_queue: Vec<Box<dyn FnOnce()>>,
}

struct CompositionState {
    composer: RefCell<Composer>,
    scope: Scope,
    invalid: Cell<bool>,
    passes: Cell<u64>,
}

/// One scope instance: the slots, effects and state cells of a component
/// across any number of re-executions, from first commit to disposal.
///
/// ```rust
/// use repose_core::*;
///
/// let comp = Composition::new();
/// let count = comp.compose(|| remember_signal(|| 0));
/// count.set(1);
/// assert!(comp.is_invalid());
/// comp.compose(|| assert_eq!(remember_signal(|| 0).get(), 1));
/// comp.dispose();
/// ```
pub struct Composition {
    state: Rc<CompositionState>,
}

impl Default for Composition {
    fn default() -> Self {
        Self::new()
    }
}

impl Composition {
    pub fn new() -> Self {
        Self {
            state: Rc::new(CompositionState {
                composer: RefCell::new(Composer::default()),
                scope: Scope::new(),
                invalid: Cell::new(false),
                passes: Cell::new(0),
            }),
        }
    }

    /// Runs `body` as one re-execution, then commits: every effect scheduled
    /// during the pass runs in registration order.
    pub fn compose<R>(&self, body: impl FnOnce() -> R) -> R {
        struct Guard;
        impl Drop for Guard {
            fn drop(&mut self) {
                CURRENT.with(|c| {
                    c.borrow_mut().pop();
                });
            }
        }

        self.state.invalid.set(false);
        self.state.composer.borrow_mut().cursor = 0;
        CURRENT.with(|c| c.borrow_mut().push(self.state.clone()));
        let result = {
            let _guard = Guard;
            self.state.scope.run(body)
        };
        self.state.passes.set(self.state.passes.get() + 1);

        let queue = std::mem::take(&mut self.state.composer.borrow_mut().commit_queue);
        for effect in queue {
            effect();
        }
        result
    }

    /// Re-executes only if a state cell was written since the last pass.
    pub fn compose_if_invalid<R>(&self, body: impl FnOnce() -> R) -> Option<R> {
        if self.is_invalid() {
            Some(self.compose(body))
        } else {
            None
        }
    }

    pub fn is_invalid(&self) -> bool {
        self.state.invalid.get()
    }

    /// Number of completed passes.
    pub fn passes(&self) -> u64 {
        self.state.passes.get()
    }

    pub fn scope(&self) -> &Scope {
        &self.state.scope
    }

    /// Tears the scope instance down, running every registered cleanup once.
    pub fn dispose(self) {
        self.state.scope.clone().dispose();
    }
}

/// Marks a composition invalid; held by state cells so their writes
/// request a re-execution.
#[derive(Clone)]
pub struct Invalidator(Weak<CompositionState>);

impl Invalidator {
    pub fn invalidate(&self) {
        if let Some(state) = self.0.upgrade() {
            state.invalid.set(true);
        }
    }
}

pub fn current_invalidator() -> Option<Invalidator> {
    CURRENT.with(|c| {
        c.borrow()
            .last()
            .map(|state| Invalidator(Rc::downgrade(state)))
    })
}

fn current_state() -> Option<Rc<CompositionState>> {
    CURRENT.with(|c| c.borrow().last().cloned())
}

/// Queues `effect` to run after the current pass commits. Outside a
/// composition it runs immediately.
pub fn schedule_after_commit(effect: impl FnOnce() + 'static) {
    match current_state() {
        Some(state) => state
            .composer
            .borrow_mut()
            .commit_queue
            .push(Box::new(effect)),
        None => effect(),
    }
}

/// Slot-based remember (sequential composition only)
pub fn remember<T: 'static>(init: impl FnOnce() -> T) -> Rc<T> {
    let Some(state) = current_state() else {
        log::warn!("remember: called outside of a composition; value will not be retained.");
        return Rc::new(init());
    };

    let cursor = {
        let mut c = state.composer.borrow_mut();
        let cursor = c.cursor;
        c.cursor += 1;
        if let Some(slot) = c.slots.get(cursor) {
            if let Some(rc) = slot.downcast_ref::<Rc<T>>() {
                return rc.clone();
            }
            log::warn!(
                "remember: slot {} type changed; replacing. \
                 If this is due to conditional composition, prefer remember_with_key.",
                cursor
            );
        }
        cursor
    };

    // init may itself touch the composer, so the borrow is released first
    let rc: Rc<T> = Rc::new(init());
    let mut c = state.composer.borrow_mut();
    if cursor < c.slots.len() {
        c.slots[cursor] = Box::new(rc.clone());
    } else {
        c.slots.push(Box::new(rc.clone()));
    }
    rc
}

/// Key-based remember
pub fn remember_with_key<T: 'static>(key: impl Into<String>, init: impl FnOnce() -> T) -> Rc<T> {
    let key = key.into();
    let Some(state) = current_state() else {
        log::warn!("remember_with_key: key '{key}' used outside of a composition.");
        return Rc::new(init());
    };

    if let Some(existing) = state.composer.borrow().keyed_slots.get(&key) {
        if let Some(rc) = existing.downcast_ref::<Rc<T>>() {
            return rc.clone();
        }
        log::warn!(
            "remember_with_key: key '{}' reused with a different type; replacing.",
            key
        );
    }

    let rc: Rc<T> = Rc::new(init());
    state
        .composer
        .borrow_mut()
        .keyed_slots
        .insert(key, Box::new(rc.clone()));
    rc
}

pub fn remember_state<T: 'static>(init: impl FnOnce() -> T) -> Rc<RefCell<T>> {
    remember(|| RefCell::new(init()))
}

pub fn remember_state_with_key<T: 'static>(
    key: impl Into<String>,
    init: impl FnOnce() -> T,
) -> Rc<RefCell<T>> {
    remember_with_key(key, || RefCell::new(init()))
}
