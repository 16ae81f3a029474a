//! # Diagnostics sink
//!
//! Misuse that cannot be reported inline (see [`crate::cleanup`]) is handed
//! to a [`DiagnosticsSink`]. The sink is a composition local: hooks resolve
//! it while the component body runs, so a subtree can be given its own
//! reporter:
//!
//! ```rust
//! use repose_hooks::*;
//! use std::rc::Rc;
//!
//! let sink = Rc::new(RecordingSink::default());
//! with_diagnostics(sink.clone(), || {
//!     // hooks called here report to `sink`
//! });
//! ```
//!
//! Without an override, reports go to [`LogSink`].

use std::cell::RefCell;
use std::rc::Rc;

use crate::HooksError;

pub trait DiagnosticsSink {
    fn report(&self, error: HooksError);
}

/// Writes reports to the `log` facade.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl DiagnosticsSink for LogSink {
    fn report(&self, error: HooksError) {
        log::error!("unhandled hooks error: {error}");
    }
}

/// Keeps every report; handy for tests and devtools.
#[derive(Debug, Default)]
pub struct RecordingSink {
    reports: RefCell<Vec<HooksError>>,
}

impl RecordingSink {
    pub fn reports(&self) -> Vec<HooksError> {
        self.reports.borrow().clone()
    }
}

impl DiagnosticsSink for RecordingSink {
    fn report(&self, error: HooksError) {
        self.reports.borrow_mut().push(error);
    }
}

thread_local! {
    static SINK_STACK: RefCell<Vec<Rc<dyn DiagnosticsSink>>> = const { RefCell::new(Vec::new()) };
}

pub fn with_diagnostics<R>(sink: Rc<dyn DiagnosticsSink>, f: impl FnOnce() -> R) -> R {
    // Non-panicking frame guard (ensures pop on unwind)
    struct Guard;
    impl Drop for Guard {
        fn drop(&mut self) {
            SINK_STACK.with(|st| {
                st.borrow_mut().pop();
            });
        }
    }
    SINK_STACK.with(|st| st.borrow_mut().push(sink));
    let _guard = Guard;
    f()
}

pub fn diagnostics() -> Rc<dyn DiagnosticsSink> {
    SINK_STACK
        .with(|st| st.borrow().last().cloned())
        .unwrap_or_else(|| Rc::new(LogSink))
}
