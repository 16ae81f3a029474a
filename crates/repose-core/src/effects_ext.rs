use crate::{Dispose, remember, schedule_after_commit, scoped_effect};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

struct EffectSlot<K> {
    last_key: RefCell<Option<K>>,
    cleanup: RefCell<Option<Dispose>>,
    installed: Cell<bool>,
}

impl<K: 'static> EffectSlot<K> {
    fn new() -> Self {
        Self {
            last_key: RefCell::new(None),
            cleanup: RefCell::new(None),
            installed: Cell::new(false),
        }
    }

    fn run_cleanup(&self) {
        let cleanup = self.cleanup.borrow_mut().take();
        if let Some(d) = cleanup {
            d.run();
        }
    }

    /// Installs a single unmount disposer for this callsite.
    fn install(self: &Rc<Self>) {
        if self.installed.replace(true) {
            return;
        }
        let slot = self.clone();
        scoped_effect(move || Box::new(move || slot.run_cleanup()));
    }

    fn schedule(self: &Rc<Self>, effect: impl FnOnce() -> Option<Dispose> + 'static) {
        let slot = self.clone();
        schedule_after_commit(move || {
            slot.run_cleanup();
            let d = effect();
            *slot.cleanup.borrow_mut() = d;
        });
    }
}

/// After commit, runs `effect` when `key` changed since the previous run
/// (always on the first commit). The previous cleanup runs first; the last
/// one runs on unmount.
pub fn disposable_effect<K: PartialEq + 'static>(
    key: K,
    effect: impl FnOnce() -> Dispose + 'static,
) {
    // Slot-based (like Compose). For branch-stability use `remember_with_key` variants later.
    let slot = remember(EffectSlot::<K>::new);
    slot.install();

    let changed = slot.last_key.borrow().as_ref() != Some(&key);
    if changed {
        *slot.last_key.borrow_mut() = Some(key);
        slot.schedule(move || Some(effect()));
    }
}

/// After every commit: runs the previous cleanup, if any, then `effect`.
pub fn commit_effect(effect: impl FnOnce() -> Option<Dispose> + 'static) {
    let slot = remember(EffectSlot::<()>::new);
    slot.install();
    slot.schedule(effect);
}
