//! # Hooks: busy state, instrumented operations, and lifecycle
//!
//! State-management helpers for Repose components, which are re-executed
//! many times over one lifetime:
//!
//! - [`remember_busy`]: a busy counter for loading indicators, optionally
//!   mirrored into a parent's counter.
//! - [`remember_operations`]: wraps a table of async operations so every
//!   call is counted per operation and in the shared busy counter.
//! - [`remember_stable_callbacks`]: fixed-identity forwarders to the
//!   latest closures of a component.
//! - [`on_init`], [`on_init_when_ready`], [`watch`]: mount / ready /
//!   update callbacks with synchronous cleanup.
//!
//! ## A loading page
//!
//! ```rust
//! use futures::FutureExt;
//! use repose_core::{Composition, executor};
//! use repose_hooks::*;
//!
//! let table = OperationTable::builder(())
//!     .operation("refresh", |_: &(), ()| {
//!         async { executor::yield_now().await; Ok::<_, String>(3u32) }.boxed_local()
//!     })
//!     .build();
//! let (exclusions, options) = (ExclusionSet::default(), InstrumentOptions::default());
//!
//! let comp = Composition::new();
//! let page = |comp: &Composition| {
//!     comp.compose(|| remember_operations(&table, &exclusions, &options, BusyConfig::default()))
//! };
//!
//! let ops = page(&comp);
//! let refresh = ops.api.operation("refresh").unwrap().call(());
//! assert!(comp.is_invalid());
//!
//! let ops = page(&comp);
//! assert!(ops.busy.busy && ops.busy_map["refresh"]);
//!
//! assert_eq!(executor::block_on(refresh), Ok(3));
//! let ops = page(&comp);
//! assert!(!ops.busy.busy && !ops.busy_map["refresh"]);
//! ```
//!
//! Diagnostics for misuse that cannot be raised inline go to the sink
//! installed with [`with_diagnostics`].

pub mod busy;
pub mod cleanup;
pub mod diagnostics;
pub mod error;
pub mod lifecycle;
pub mod operations;
pub mod stable;
pub mod tests;

pub use busy::*;
pub use cleanup::*;
pub use diagnostics::*;
pub use error::*;
pub use lifecycle::*;
pub use operations::*;
pub use stable::*;
