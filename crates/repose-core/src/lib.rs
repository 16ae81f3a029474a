//! # Compositions, Slots, Signals, and Effects
//!
//! The core runtime the Repose hooks are built on. A component is a function
//! that is re-executed many times over one lifetime; everything it needs to
//! keep between executions lives in slots owned by its [`Composition`].
//!
//! - `Composition`: one scope instance; each `compose` call is a
//!   re-execution followed by a commit.
//! - `remember*`: render-stable cells bound to the composition.
//! - `Signal<T>` / `remember_signal`: state cells; writes request a
//!   re-execution.
//! - `disposable_effect` / `commit_effect`: side-effects that run after
//!   commit, with cleanup.
//! - `executor`: the thread-local task queue that drives futures.
//!
//! ## Remembered state
//!
//! ```rust
//! use repose_core::*;
//!
//! let comp = Composition::new();
//! for _ in 0..3 {
//!     comp.compose(|| {
//!         let renders = remember_state(|| 0);
//!         *renders.borrow_mut() += 1;
//!     });
//! }
//! comp.compose(|| assert_eq!(*remember_state(|| 0).borrow(), 3));
//! ```
//!
//! - `remember` and `remember_state` are order‑based: the Nth call in a
//!   composition always refers to the Nth stored value.
//! - `remember_with_key` and `remember_state_with_key` are key‑based and more
//!   stable across conditional branches.
//!
//! ## Effects and cleanup
//!
//! ```rust
//! use repose_core::*;
//!
//! let comp = Composition::new();
//! comp.compose(|| {
//!     disposable_effect((), || {
//!         log::info!("Mounted Example");
//!         on_unmount(|| log::info!("Unmounted Example"))
//!     });
//! });
//! comp.dispose();
//! ```
//!
//! - `disposable_effect` runs after commit whenever its key changes, cleaning
//!   up the previous run first. The last cleanup runs when the composition
//!   is disposed.
//! - `commit_effect` runs after every commit.

pub mod effects;
pub mod effects_ext;
pub mod executor;
pub mod runtime;
pub mod scope;
pub mod signal;

pub use effects::*;
pub use effects_ext::*;
pub use runtime::*;
pub use scope::*;
pub use signal::*;
