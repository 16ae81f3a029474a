//! # Cleanup contract
//!
//! Lifecycle callbacks hand back what should happen at teardown. Teardown is
//! synchronous, so the answer must be known when the callback returns; a
//! cleanup that only arrives through a future can never run before the next
//! activation. [`normalize`] turns whatever a callback returned into a
//! [`Dispose`] and reports that misuse without disturbing the current cycle.

use std::future::Future;
use std::rc::Rc;

use futures::FutureExt;
use futures::future::LocalBoxFuture;
use repose_core::{Dispose, executor};

use crate::{DiagnosticsSink, HooksError};

/// The value a lifecycle callback returns.
pub enum Cleanup {
    None,
    Dispose(Dispose),
    /// A cleanup produced asynchronously; always a usage error.
    Pending(LocalBoxFuture<'static, Cleanup>),
}

impl Cleanup {
    pub fn from_fn(f: impl FnOnce() + 'static) -> Self {
        Cleanup::Dispose(Dispose::new(f))
    }

    pub fn pending<F>(fut: F) -> Self
    where
        F: Future + 'static,
        F::Output: Into<Cleanup>,
    {
        Cleanup::Pending(fut.map(|out| -> Cleanup { out.into() }).boxed_local())
    }
}

impl From<()> for Cleanup {
    fn from(_: ()) -> Self {
        Cleanup::None
    }
}

impl From<Dispose> for Cleanup {
    fn from(d: Dispose) -> Self {
        Cleanup::Dispose(d)
    }
}

impl From<Option<Dispose>> for Cleanup {
    fn from(d: Option<Dispose>) -> Self {
        d.map_or(Cleanup::None, Cleanup::Dispose)
    }
}

/// A function comes back unchanged; anything else becomes a no-op. A
/// pending cleanup is driven on the executor, and if it turns out to be a
/// function the misuse is logged and reported to `sink` on a later tick.
pub fn normalize(
    value: impl Into<Cleanup>,
    owner: &'static str,
    sink: Rc<dyn DiagnosticsSink>,
) -> Dispose {
    match value.into() {
        Cleanup::Dispose(d) => d,
        Cleanup::None => Dispose::noop(),
        Cleanup::Pending(fut) => {
            executor::spawn_local(async move {
                // the late cleanup is dropped without running
                if let Cleanup::Dispose(_) = fut.await {
                    executor::next_tick(move || {
                        log::error!(
                            "the callback of \"{owner}\" returned its cleanup asynchronously; \
                             cleanups must be returned synchronously."
                        );
                        sink.report(HooksError::AsyncCleanup { owner });
                    });
                }
            });
            Dispose::noop()
        }
    }
}
