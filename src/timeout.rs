//! Timeout handle: the per-task record and intrusive list node.
//!
//! A [`Timeout`] is created once per accepted submission and handed both to
//! the submitter (for cancellation and state queries) and to the ingress
//! queue (for placement by the worker). The handle *is* the bucket list
//! node: linking it costs no allocation beyond the handle itself.
//!
//! # State machine
//!
//! `state` moves INIT -> CANCELLED or INIT -> EXPIRED, exactly once, by
//! compare-and-swap. The CAS is what arbitrates a cancel racing an expiry:
//! whichever transition wins, the other observes the failure and backs off,
//! so a task is never both cancelled and run.
//!
//! # Worker-only state
//!
//! `remaining_rounds`, the `prev`/`next` links, and the bucket back-reference
//! live in a single [`UnsafeCell`]-wrapped struct. They are touched only by
//! the worker thread, after the handle has been submitted; this is the
//! single-consumer contract that lets the bucket lists run without locks.
//!
//! # Safety
//!
//! The `Send`/`Sync` impls below are sound because every shared field is
//! either immutable after construction or atomic, and [`Timeout::links`]
//! callers uphold the worker-only contract documented there.

#[cfg(not(loom))]
use std::sync::atomic::{AtomicU8, Ordering};

#[cfg(loom)]
use loom::sync::atomic::{AtomicU8, Ordering};

use std::any::Any;
use std::cell::UnsafeCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::Arc;

use tracing::warn;

use crate::clock;
use crate::task::TimerTask;
use crate::timer::{Inner, TimerHandle, WORKER_SHUTDOWN};

pub(crate) const ST_INIT: u8 = 0;
pub(crate) const ST_CANCELLED: u8 = 1;
pub(crate) const ST_EXPIRED: u8 = 2;

// ============================================================================
// State
// ============================================================================

/// Three-valued atomic lifecycle state with CAS-only terminal transitions.
///
/// Kept as its own type so the cancel/expire race can be model-checked in
/// isolation (see the loom tests at the bottom of this file).
pub(crate) struct State(AtomicU8);

impl State {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(ST_INIT))
    }

    #[inline]
    pub(crate) fn get(&self) -> u8 {
        self.0.load(Ordering::Acquire)
    }

    /// Attempt the `old -> new` transition; false if another transition won.
    #[inline]
    pub(crate) fn compare_and_set(&self, old: u8, new: u8) -> bool {
        self.0
            .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

// ============================================================================
// Timeout
// ============================================================================

/// Worker-only mutable portion of a [`Timeout`].
pub(crate) struct Links {
    /// Full wheel revolutions to skip before this handle fires on its
    /// bucket's visit. Set during placement; meaningless before.
    pub(crate) remaining_rounds: i64,

    /// Intrusive doubly-linked list neighbors within the owning bucket.
    pub(crate) prev: Option<NonNull<Timeout>>,
    pub(crate) next: Option<NonNull<Timeout>>,

    /// Wheel slot of the bucket currently holding this handle; `None` iff
    /// the handle is not linked into any bucket.
    pub(crate) bucket: Option<u32>,
}

/// Submitter's reference to a scheduled task.
///
/// Shared as `Arc<Timeout>`: the submitter keeps one for [`cancel`], the
/// ingress queue carries one to the worker, and the owning bucket holds one
/// for as long as the handle is linked. Once the handle reaches a terminal
/// state and leaves all queues, no links remain and it is reclaimed like any
/// other `Arc`.
///
/// [`cancel`]: Timeout::cancel
pub struct Timeout {
    timer: Arc<Inner>,
    task: Box<dyn TimerTask>,
    /// Expiry instant in nanoseconds relative to the timer's start time.
    pub(crate) deadline: i64,
    state: State,
    links: UnsafeCell<Links>,
}

// SAFETY: `timer`, `task`, and `deadline` are immutable after construction;
// `state` is atomic; `links` is confined to the worker thread by the
// contract on `Timeout::links`.
unsafe impl Send for Timeout {}
unsafe impl Sync for Timeout {}

impl Timeout {
    pub(crate) fn new(timer: Arc<Inner>, task: Box<dyn TimerTask>, deadline: i64) -> Arc<Self> {
        Arc::new(Self {
            timer,
            task,
            deadline,
            state: State::new(),
            links: UnsafeCell::new(Links {
                remaining_rounds: 0,
                prev: None,
                next: None,
                bucket: None,
            }),
        })
    }

    /// Attempt to cancel this timeout.
    ///
    /// Returns `false` if the timeout has already expired or was already
    /// cancelled. On success the handle is queued for the worker, which
    /// unlinks it from its bucket within one tick; the callback will not run.
    pub fn cancel(self: &Arc<Self>) -> bool {
        if !self.state.compare_and_set(ST_INIT, ST_CANCELLED) {
            return false;
        }
        // Unlinking is deferred to the worker via the cancellation queue, so
        // cancel stays O(1) and lock-free for the submitter. After shutdown
        // there is no worker left to drain the queue; skip the enqueue so
        // the handle cannot pin a dead timer core.
        if self.timer.worker_state() != WORKER_SHUTDOWN {
            self.timer.cancelled.push(Arc::clone(self));
        }
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == ST_CANCELLED
    }

    pub fn is_expired(&self) -> bool {
        self.state() == ST_EXPIRED
    }

    /// The task this timeout will run (or would have run).
    pub fn task(&self) -> &dyn TimerTask {
        &*self.task
    }

    /// A submission handle for the timer that owns this timeout.
    pub fn timer(&self) -> TimerHandle {
        TimerHandle::new(Arc::clone(&self.timer))
    }

    #[inline]
    pub(crate) fn state(&self) -> u8 {
        self.state.get()
    }

    /// Worker-only access to the intrusive links.
    ///
    /// # Safety
    ///
    /// Must only be called from the timer's worker thread, and the returned
    /// reference must not outlive the current worker operation. Two live
    /// references to the same handle's links are never created: bucket
    /// operations scope each borrow to a single statement.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn links(&self) -> &mut Links {
        &mut *self.links.get()
    }

    /// Transition to EXPIRED and run the task. Worker-only.
    ///
    /// Loses quietly to a concurrent [`cancel`](Timeout::cancel): if the CAS
    /// fails the callback is not invoked. Task panics are caught and logged;
    /// the handle stays EXPIRED either way.
    pub(crate) fn expire(self: &Arc<Self>) {
        if !self.state.compare_and_set(ST_INIT, ST_EXPIRED) {
            return;
        }

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| self.task.run(self))) {
            warn!(
                panic = panic_message(payload.as_ref()),
                "an exception was thrown by a timer task"
            );
        }
    }
}

impl fmt::Debug for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timeout")
            .field("deadline", &self.deadline)
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let remaining = self.deadline - clock::now_nanos() + self.timer.start_time();

        write!(f, "Timeout(deadline: ")?;
        if remaining > 0 {
            write!(f, "{remaining} ns later")?;
        } else if remaining < 0 {
            write!(f, "{} ns ago", -remaining)?;
        } else {
            write!(f, "now")?;
        }
        if self.is_cancelled() {
            write!(f, ", cancelled")?;
        }
        write!(f, ")")
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::timer::Inner;

    fn noop() -> Box<dyn TimerTask> {
        Box::new(|_: &Arc<Timeout>| {})
    }

    #[test]
    fn starts_in_init() {
        let t = Timeout::new(Inner::stub(), noop(), 1_000);
        assert!(!t.is_cancelled());
        assert!(!t.is_expired());
        assert_eq!(t.state(), ST_INIT);
    }

    #[test]
    fn cancel_wins_once() {
        let t = Timeout::new(Inner::stub(), noop(), 1_000);
        assert!(t.cancel());
        assert!(!t.cancel());
        assert!(t.is_cancelled());
        assert!(!t.is_expired());
    }

    #[test]
    fn expired_timeout_cannot_be_cancelled() {
        let t = Timeout::new(Inner::stub(), noop(), 1_000);
        t.expire();
        assert!(t.is_expired());
        assert!(!t.cancel());
        assert!(!t.is_cancelled());
    }

    #[test]
    fn expire_runs_task_exactly_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let runs = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&runs);
        let t = Timeout::new(
            Inner::stub(),
            Box::new(move |_: &Arc<Timeout>| {
                counted.fetch_add(1, Ordering::Relaxed);
            }),
            0,
        );

        t.expire();
        t.expire();
        assert_eq!(runs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn expire_after_cancel_does_not_run_task() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let runs = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&runs);
        let t = Timeout::new(
            Inner::stub(),
            Box::new(move |_: &Arc<Timeout>| {
                counted.fetch_add(1, Ordering::Relaxed);
            }),
            0,
        );

        assert!(t.cancel());
        t.expire();
        assert_eq!(runs.load(Ordering::Relaxed), 0);
        assert!(t.is_cancelled());
    }

    #[test]
    fn task_panic_is_contained() {
        let t = Timeout::new(
            Inner::stub(),
            Box::new(|_: &Arc<Timeout>| panic!("task blew up")),
            0,
        );
        t.expire();
        assert!(t.is_expired());
    }

    #[test]
    fn display_mentions_cancellation() {
        let t = Timeout::new(Inner::stub(), noop(), i64::MAX / 2);
        let shown = format!("{t}");
        assert!(shown.contains("later"), "{shown}");

        t.cancel();
        let shown = format!("{t}");
        assert!(shown.contains("cancelled"), "{shown}");
    }

    #[test]
    fn display_past_deadline_reads_ago() {
        let t = Timeout::new(Inner::stub(), noop(), i64::MIN / 2);
        let shown = format!("{t}");
        assert!(shown.contains("ago"), "{shown}");
    }
}

#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;
    use loom::thread;

    /// A cancel racing an expire admits exactly one winner, under loom's
    /// exhaustive scheduler.
    #[test]
    fn loom_cancel_expire_exclusive() {
        loom::model(|| {
            let state = loom::sync::Arc::new(State::new());

            let cancel = {
                let state = state.clone();
                thread::spawn(move || state.compare_and_set(ST_INIT, ST_CANCELLED))
            };
            let expire = {
                let state = state.clone();
                thread::spawn(move || state.compare_and_set(ST_INIT, ST_EXPIRED))
            };

            let cancelled = cancel.join().unwrap();
            let expired = expire.join().unwrap();

            assert!(cancelled ^ expired, "exactly one transition must win");
            let terminal = state.get();
            if cancelled {
                assert_eq!(terminal, ST_CANCELLED);
            } else {
                assert_eq!(terminal, ST_EXPIRED);
            }
        });
    }

    /// Two racing cancels: one returns true, the other false.
    #[test]
    fn loom_double_cancel_single_winner() {
        loom::model(|| {
            let state = loom::sync::Arc::new(State::new());

            let a = {
                let state = state.clone();
                thread::spawn(move || state.compare_and_set(ST_INIT, ST_CANCELLED))
            };
            let b = state.compare_and_set(ST_INIT, ST_CANCELLED);
            let a = a.join().unwrap();

            assert!(a ^ b);
            assert_eq!(state.get(), ST_CANCELLED);
        });
    }
}
