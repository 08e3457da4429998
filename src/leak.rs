//! Resource-leak tracking for timer instances.
//!
//! A token is attached at construction (always when `leak_detection` is set,
//! otherwise only when the worker thread is non-daemon) and closed on the
//! transition to SHUTDOWN. A token dropped without being closed means the
//! timer core was torn down through some path that skipped shutdown; that is
//! reported, not ignored.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::error;

pub(crate) struct LeakToken {
    closed: AtomicBool,
}

impl LeakToken {
    pub(crate) fn track() -> Self {
        Self {
            closed: AtomicBool::new(false),
        }
    }

    /// Mark the tracked instance as properly shut down.
    ///
    /// Returns `false` if the token was already closed.
    pub(crate) fn close(&self) -> bool {
        self.closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Drop for LeakToken {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Relaxed) {
            error!("WheelTimer leak: instance released without reaching shutdown");
        }
    }
}
