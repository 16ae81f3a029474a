//! Single-threaded task queue standing in for the platform's microtask queue.
//!
//! Futures returned by UI code are lazy; something has to poll them. Each
//! thread gets one `LocalPool`, and the platform runner (or a test) drives it
//! with [`run_until_stalled`] between frames.

use std::cell::RefCell;
use std::future::Future;

use futures::executor::{LocalPool, LocalSpawner};
use futures::task::LocalSpawnExt;

thread_local! {
    static POOL: RefCell<LocalPool> = RefCell::new(LocalPool::new());
    static SPAWNER: LocalSpawner = POOL.with(|p| p.borrow().spawner());
}

pub fn spawn_local(fut: impl Future<Output = ()> + 'static) {
    SPAWNER.with(|s| {
        if let Err(e) = s.spawn_local(fut) {
            log::error!("spawn_local: executor is shut down: {e:?}");
        }
    });
}

/// Runs `f` from a task after yielding once; never inline.
pub fn next_tick(f: impl FnOnce() + 'static) {
    spawn_local(async move {
        yield_now().await;
        f();
    });
}

/// Polls every spawned task until none can make progress.
///
/// Must not be called from inside a task.
pub fn run_until_stalled() {
    ensure_spawner();
    POOL.with(|p| p.borrow_mut().run_until_stalled());
}

/// Drives `fut` and the spawned tasks until `fut` completes.
pub fn block_on<F: Future>(fut: F) -> F::Output {
    ensure_spawner();
    POOL.with(|p| p.borrow_mut().run_until(fut))
}

// the spawner borrows the pool when first created
fn ensure_spawner() {
    SPAWNER.with(|_| ());
}

/// Yields to the pool once. Outside a tokio runtime the task is woken
/// straight away, so the next `run_until_stalled` round picks it up.
pub use tokio::task::yield_now;
