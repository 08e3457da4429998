//! Timer facade: construction, lifecycle, submission, and shutdown.
//!
//! # Architecture
//!
//! ```text
//!   Submitters                      Worker thread
//!   ----------                      -------------
//!   new_timeout ──► ingress ──────► transfer into buckets ─┐
//!   cancel ───────► cancellations ► unlink from buckets    │ per tick
//!                                   expire current bucket ◄┘
//!   stop ─────────► state CAS ────► drain wheel + queues ──► unprocessed
//! ```
//!
//! [`WheelTimer`] owns the instance and is the only type that can stop it;
//! [`TimerHandle`] is the cheap, cloneable submission seam handed to
//! producer threads (and returned by [`Timeout::timer`]). The worker itself
//! lives in [`crate::worker`].
//!
//! # Lifecycle
//!
//! `worker_state` moves INIT -> STARTED -> SHUTDOWN, one-way, by CAS. The
//! worker thread is spawned lazily on the first submission; callers then
//! block on a one-time barrier until the worker has published `start_time`,
//! so every deadline is measured against a fully initialized wheel.
//!
//! # Do not create many instances
//!
//! Every timer owns a dedicated thread. The process-wide instance counter
//! logs an error once past [`INSTANCE_COUNT_LIMIT`] live instances; share
//! one timer across the application instead.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_queue::SegQueue;
use crossbeam_utils::sync::{Parker, Unparker};
use crossbeam_utils::CachePadded;
use tracing::error;

use crate::clock;
use crate::config::{self, TimerConfig};
use crate::error::TimerError;
use crate::leak::LeakToken;
use crate::task::{self, DefaultThreadFactory, ThreadFactory, TimerTask};
use crate::timeout::Timeout;
use crate::worker::Worker;

pub(crate) const WORKER_INIT: u8 = 0;
pub(crate) const WORKER_STARTED: u8 = 1;
pub(crate) const WORKER_SHUTDOWN: u8 = 2;

/// Live-instance threshold past which construction logs an error (once).
pub const INSTANCE_COUNT_LIMIT: usize = 64;

static INSTANCE_COUNTER: AtomicUsize = AtomicUsize::new(0);
static WARNED_TOO_MANY_INSTANCES: AtomicBool = AtomicBool::new(false);

fn report_too_many_instances() {
    error!(
        limit = INSTANCE_COUNT_LIMIT,
        "you are creating too many WheelTimer instances; WheelTimer is a \
         shared resource that must be reused across the process so that only \
         a few instances are created"
    );
}

// ============================================================================
// Shared core
// ============================================================================

/// State shared between the facade, every handle, and the worker thread.
pub(crate) struct Inner {
    /// Effective tick interval in nanoseconds (>= 1 ms).
    pub(crate) tick_duration: i64,
    /// Normalized wheel length (power of two).
    pub(crate) wheel_len: usize,
    max_pending_timeouts: i64,

    worker_state: AtomicU8,
    pub(crate) pending_timeouts: CachePadded<AtomicU64>,

    /// Nanosecond origin for all deadlines; 0 means "not yet published".
    start_time: AtomicI64,
    start_barrier: (Mutex<()>, Condvar),

    /// Submissions awaiting bucket placement. Many producers, one consumer.
    pub(crate) ingress: SegQueue<Arc<Timeout>>,
    /// Cancelled handles awaiting unlink. Many producers, one consumer.
    pub(crate) cancelled: SegQueue<Arc<Timeout>>,

    unparker: Unparker,
    parker: Mutex<Option<Parker>>,
    join: Mutex<Option<JoinHandle<()>>>,
    worker_thread: Mutex<Option<ThreadId>>,
    unprocessed: Mutex<Mailbox>,

    factory: Box<dyn ThreadFactory>,
    leak: Mutex<Option<LeakToken>>,
}

/// Where the worker leaves the unprocessed set for `stop()` to collect.
///
/// Each unprocessed handle holds a strong reference back to [`Inner`], so a
/// set parked here with no one left to take it would keep the whole core
/// alive forever. `discard` is raised when the owning facade is dropped
/// without `stop()`; publishing into a discarding mailbox drops the handles
/// instead.
#[derive(Default)]
struct Mailbox {
    discard: bool,
    set: Vec<Arc<Timeout>>,
}

impl Inner {
    fn build(
        config: &TimerConfig,
        factory: Box<dyn ThreadFactory>,
        leak: Option<LeakToken>,
    ) -> Arc<Self> {
        let parker = Parker::new();
        let unparker = parker.unparker().clone();

        Arc::new(Self {
            tick_duration: config.tick_nanos(),
            wheel_len: config.wheel_len(),
            max_pending_timeouts: config.max_pending_timeouts,
            worker_state: AtomicU8::new(WORKER_INIT),
            pending_timeouts: CachePadded::new(AtomicU64::new(0)),
            start_time: AtomicI64::new(0),
            start_barrier: (Mutex::new(()), Condvar::new()),
            ingress: SegQueue::new(),
            cancelled: SegQueue::new(),
            unparker,
            parker: Mutex::new(Some(parker)),
            join: Mutex::new(None),
            worker_thread: Mutex::new(None),
            unprocessed: Mutex::new(Mailbox::default()),
            factory,
            leak: Mutex::new(leak),
        })
    }

    #[inline]
    pub(crate) fn start_time(&self) -> i64 {
        self.start_time.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn worker_state(&self) -> u8 {
        self.worker_state.load(Ordering::Acquire)
    }

    /// Worker-side: publish the deadline origin and release the barrier.
    pub(crate) fn publish_start_time(&self, start: i64) {
        debug_assert!(start != 0, "0 is reserved as the uninitialized sentinel");
        self.start_time.store(start, Ordering::Release);

        let (lock, cvar) = &self.start_barrier;
        let _guard = lock.lock().unwrap();
        cvar.notify_all();
    }

    /// Block until the worker has published `start_time`.
    ///
    /// Bails out early if the timer reached SHUTDOWN without a worker ever
    /// publishing (spawn failure); the periodic timeout covers the window
    /// where that transition raced past the condvar.
    fn wait_for_start(&self) {
        let (lock, cvar) = &self.start_barrier;
        let mut guard = lock.lock().unwrap();
        while self.start_time.load(Ordering::Acquire) == 0 {
            if self.worker_state() == WORKER_SHUTDOWN {
                return;
            }
            let (next, _) = cvar
                .wait_timeout(guard, Duration::from_millis(100))
                .unwrap();
            guard = next;
        }
    }

    pub(crate) fn set_worker_thread(&self, id: ThreadId) {
        *self.worker_thread.lock().unwrap() = Some(id);
    }

    fn on_worker_thread(&self) -> bool {
        *self.worker_thread.lock().unwrap() == Some(thread::current().id())
    }

    pub(crate) fn publish_unprocessed(&self, set: Vec<Arc<Timeout>>) {
        let mut mailbox = self.unprocessed.lock().unwrap();
        if !mailbox.discard {
            mailbox.set = set;
        }
    }

    fn take_unprocessed(&self) -> Vec<Arc<Timeout>> {
        std::mem::take(&mut self.unprocessed.lock().unwrap().set)
    }

    /// Called when the owning facade goes away without `stop()`: nothing can
    /// collect the unprocessed set anymore, so release it (and anything the
    /// worker publishes later) instead of pinning the core in a cycle.
    fn discard_unprocessed(&self) {
        let mut mailbox = self.unprocessed.lock().unwrap();
        mailbox.discard = true;
        mailbox.set.clear();
    }

    fn close_leak(&self) {
        if let Some(token) = self.leak.lock().unwrap().take() {
            let closed = token.close();
            debug_assert!(closed);
        }
    }

    /// Force the terminal state, releasing the instance slot and leak token
    /// on the first transition only. Every shutdown path that did not win
    /// the STARTED -> SHUTDOWN CAS goes through here: `stop()` on a
    /// never-started or already-stopped timer, `Drop`, and a failed worker
    /// spawn.
    fn force_shutdown_and_release(&self) {
        let prev = self.worker_state.swap(WORKER_SHUTDOWN, Ordering::AcqRel);
        if prev != WORKER_SHUTDOWN {
            INSTANCE_COUNTER.fetch_sub(1, Ordering::Relaxed);
            self.close_leak();
        }
    }

    /// Start the worker if it has not been started yet.
    ///
    /// The join-slot mutex is held across CAS + spawn so that a concurrent
    /// `stop()` cannot observe STARTED before the join handle exists.
    pub(crate) fn start(self: &Arc<Self>) -> Result<(), TimerError> {
        match self.worker_state() {
            WORKER_INIT => {
                let mut join = self.join.lock().unwrap();
                if self
                    .worker_state
                    .compare_exchange(
                        WORKER_INIT,
                        WORKER_STARTED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    match self.spawn_worker() {
                        Ok(handle) => *join = Some(handle),
                        Err(err) => {
                            // A worker that never existed cannot be stopped;
                            // the timer is terminally dead, and this is its
                            // one shot at releasing the accounting.
                            self.force_shutdown_and_release();
                            return Err(err);
                        }
                    }
                }
            }
            WORKER_STARTED => {}
            WORKER_SHUTDOWN => return Err(TimerError::ShutDown),
            state => unreachable!("invalid worker state {state}"),
        }

        self.wait_for_start();
        if self.start_time() == 0 {
            // The barrier bailed out: the worker never came up.
            return Err(TimerError::ShutDown);
        }
        Ok(())
    }

    fn spawn_worker(self: &Arc<Self>) -> Result<JoinHandle<()>, TimerError> {
        let parker = self
            .parker
            .lock()
            .unwrap()
            .take()
            .expect("worker spawned twice");
        let inner = Arc::clone(self);
        let name = task::next_worker_name();

        let handle = self
            .factory
            .spawn_worker(&name, Box::new(move || Worker::new(inner, parker).run()))?;
        Ok(handle)
    }

    pub(crate) fn new_timeout(
        self: &Arc<Self>,
        task: Box<dyn TimerTask>,
        delay: Duration,
    ) -> Result<Arc<Timeout>, TimerError> {
        let pending = self.pending_timeouts.fetch_add(1, Ordering::Relaxed) + 1;
        if self.max_pending_timeouts > 0 && pending > self.max_pending_timeouts as u64 {
            self.pending_timeouts.fetch_sub(1, Ordering::Relaxed);
            return Err(TimerError::Rejected {
                pending,
                max: self.max_pending_timeouts,
            });
        }

        if let Err(err) = self.start() {
            self.pending_timeouts.fetch_sub(1, Ordering::Relaxed);
            return Err(err);
        }

        // Deadline relative to the worker's start instant. Positive overflow
        // saturates so a far-future submission stays far-future instead of
        // wrapping into the past.
        let delay_nanos = config::duration_nanos(delay);
        let deadline = (clock::now_nanos() - self.start_time())
            .checked_add(delay_nanos)
            .unwrap_or(i64::MAX);

        let timeout = Timeout::new(Arc::clone(self), task, deadline);
        self.ingress.push(Arc::clone(&timeout));
        Ok(timeout)
    }

    #[cfg(test)]
    pub(crate) fn stub() -> Arc<Self> {
        Self::build(
            &TimerConfig::default(),
            Box::new(DefaultThreadFactory),
            None,
        )
    }
}

// ============================================================================
// Facade
// ============================================================================

/// Approximate, high-throughput timer backed by a hashed timing wheel.
///
/// Schedule and cancel are O(1) regardless of how many timeouts are
/// pending; in exchange, a task fires no earlier than its deadline's tick
/// boundary and typically within one tick after it. Tasks run serially on
/// the timer's dedicated worker thread.
///
/// Dropping the timer forces shutdown (the worker exits and unfired handles
/// are discarded); call [`stop`](WheelTimer::stop) instead to reclaim them.
pub struct WheelTimer {
    inner: Arc<Inner>,
}

impl WheelTimer {
    /// Create a timer with the given thread factory and configuration.
    ///
    /// # Errors
    ///
    /// Invalid-argument failures per [`TimerConfig::validate`].
    pub fn new(factory: impl ThreadFactory, config: TimerConfig) -> Result<Self, TimerError> {
        config.validate()?;

        let factory: Box<dyn ThreadFactory> = Box::new(factory);
        let leak = (config.leak_detection || !factory.daemon()).then(LeakToken::track);
        let inner = Inner::build(&config, factory, leak);

        let live = INSTANCE_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
        if live > INSTANCE_COUNT_LIMIT
            && WARNED_TOO_MANY_INSTANCES
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            report_too_many_instances();
        }

        Ok(Self { inner })
    }

    /// Create a timer with the default thread factory.
    pub fn with_config(config: TimerConfig) -> Result<Self, TimerError> {
        Self::new(DefaultThreadFactory, config)
    }

    /// Start the worker thread explicitly.
    ///
    /// Optional: the worker starts automatically on the first submission.
    ///
    /// # Errors
    ///
    /// `ShutDown` if the timer has already been stopped; `Spawn` if the
    /// thread factory fails.
    pub fn start(&self) -> Result<(), TimerError> {
        self.inner.start()
    }

    /// Schedule `task` to run after `delay`.
    ///
    /// Returns the handle used for cancellation and state queries.
    ///
    /// # Errors
    ///
    /// `Rejected` when the pending-timeout cap is reached; `ShutDown` when
    /// the timer was already stopped.
    pub fn new_timeout(
        &self,
        task: impl TimerTask,
        delay: Duration,
    ) -> Result<Arc<Timeout>, TimerError> {
        self.inner.new_timeout(Box::new(task), delay)
    }

    /// Number of accepted submissions that have not yet fired or been
    /// reclaimed. Eventually consistent within one tick.
    pub fn pending_timeouts(&self) -> u64 {
        self.inner.pending_timeouts.load(Ordering::Relaxed)
    }

    /// A cloneable submission handle for producer threads.
    pub fn handle(&self) -> TimerHandle {
        TimerHandle::new(Arc::clone(&self.inner))
    }

    /// Stop the timer and reclaim every timeout that had not fired.
    ///
    /// The returned handles are exactly those submitted, not yet expired,
    /// and not observed cancelled at shutdown time, each appearing once.
    /// Idempotent: later calls return an empty set.
    ///
    /// Shutdown is best-effort in the face of a stuck task: the worker is
    /// woken and polled at 100 ms intervals for as long as it takes the
    /// current callback to return.
    ///
    /// # Errors
    ///
    /// `StopFromWorker` when called from the worker thread itself (i.e.
    /// from inside a task) — allowing that would let one task silently
    /// disarm every other task on the wheel.
    pub fn stop(&self) -> Result<Vec<Arc<Timeout>>, TimerError> {
        if self.inner.on_worker_thread() {
            return Err(TimerError::StopFromWorker);
        }

        if self
            .inner
            .worker_state
            .compare_exchange(
                WORKER_STARTED,
                WORKER_SHUTDOWN,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            // State was INIT or already SHUTDOWN; force the terminal state
            // and release accounting exactly once.
            self.inner.force_shutdown_and_release();
            return Ok(Vec::new());
        }

        let handle = self.inner.join.lock().unwrap().take();
        if let Some(handle) = handle {
            loop {
                self.inner.unparker.unpark();
                if handle.is_finished() {
                    break;
                }
                thread::sleep(Duration::from_millis(100));
            }
            let _ = handle.join();
        }

        INSTANCE_COUNTER.fetch_sub(1, Ordering::Relaxed);
        self.inner.close_leak();

        Ok(self.inner.take_unprocessed())
    }
}

impl Drop for WheelTimer {
    fn drop(&mut self) {
        // Scope-based safety net for a timer that was never stopped: force
        // the terminal state, release accounting once, and wake the worker
        // so it observes SHUTDOWN and exits.
        self.inner.force_shutdown_and_release();
        // Unconditionally: with the facade gone no caller can take the
        // unprocessed set, so it must not be parked in the core.
        self.inner.discard_unprocessed();
        self.inner.unparker.unpark();
    }
}

// ============================================================================
// TimerHandle
// ============================================================================

/// Cloneable submission seam for producer threads.
///
/// Carries no stop authority: shutdown belongs to the [`WheelTimer`] owner.
#[derive(Clone)]
pub struct TimerHandle {
    inner: Arc<Inner>,
}

impl TimerHandle {
    pub(crate) fn new(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    /// See [`WheelTimer::new_timeout`].
    pub fn new_timeout(
        &self,
        task: impl TimerTask,
        delay: Duration,
    ) -> Result<Arc<Timeout>, TimerError> {
        self.inner.new_timeout(Box::new(task), delay)
    }

    /// See [`WheelTimer::pending_timeouts`].
    pub fn pending_timeouts(&self) -> u64 {
        self.inner.pending_timeouts.load(Ordering::Relaxed)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn noop() -> impl TimerTask {
        |_: &Arc<Timeout>| {}
    }

    #[test]
    fn stop_before_start_returns_empty_set() {
        let timer = WheelTimer::with_config(TimerConfig::default()).unwrap();
        let unprocessed = timer.stop().unwrap();
        assert!(unprocessed.is_empty());
    }

    #[test]
    fn start_after_stop_fails() {
        let timer = WheelTimer::with_config(TimerConfig::default()).unwrap();
        timer.stop().unwrap();

        assert!(matches!(timer.start(), Err(TimerError::ShutDown)));
        assert!(matches!(
            timer.new_timeout(noop(), Duration::from_secs(1)),
            Err(TimerError::ShutDown)
        ));
    }

    #[test]
    fn rejected_submission_does_not_leak_pending_count() {
        let timer = WheelTimer::with_config(TimerConfig {
            max_pending_timeouts: 1,
            ..TimerConfig::default()
        })
        .unwrap();

        let _held = timer.new_timeout(noop(), Duration::from_secs(600)).unwrap();
        let err = timer.new_timeout(noop(), Duration::from_secs(600));
        assert!(matches!(err, Err(TimerError::Rejected { pending: 2, max: 1 })));
        assert_eq!(timer.pending_timeouts(), 1);

        timer.stop().unwrap();
    }

    #[test]
    fn shutdown_submission_does_not_leak_pending_count() {
        let timer = WheelTimer::with_config(TimerConfig::default()).unwrap();
        timer.stop().unwrap();

        assert!(timer.new_timeout(noop(), Duration::from_secs(1)).is_err());
        assert_eq!(timer.pending_timeouts(), 0);
    }

    #[test]
    fn double_stop_is_idempotent() {
        let timer = WheelTimer::with_config(TimerConfig::default()).unwrap();
        let _held = timer.new_timeout(noop(), Duration::from_secs(600)).unwrap();

        let first = timer.stop().unwrap();
        assert_eq!(first.len(), 1);

        let second = timer.stop().unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn handle_submits_to_the_same_wheel() {
        let timer = WheelTimer::with_config(TimerConfig::default()).unwrap();
        let handle = timer.handle();

        let timeout = handle.new_timeout(noop(), Duration::from_secs(600)).unwrap();
        assert_eq!(handle.pending_timeouts(), 1);
        assert_eq!(timer.pending_timeouts(), 1);

        // The timeout's own back-reference reaches the same core.
        assert_eq!(timeout.timer().pending_timeouts(), 1);

        timer.stop().unwrap();
    }

    #[test]
    fn instance_accounting_warns_once_past_the_limit() {
        let timers: Vec<WheelTimer> = (0..INSTANCE_COUNT_LIMIT + 8)
            .map(|_| WheelTimer::with_config(TimerConfig::default()).unwrap())
            .collect();

        // While all of ours are live the process-wide count must exceed the
        // limit, regardless of what concurrent tests create or drop.
        let peak = INSTANCE_COUNTER.load(Ordering::Relaxed);
        assert!(peak >= INSTANCE_COUNT_LIMIT + 8);
        assert!(WARNED_TOO_MANY_INSTANCES.load(Ordering::Relaxed));

        drop(timers);
        assert!(INSTANCE_COUNTER.load(Ordering::Relaxed) < peak);
    }

    #[test]
    fn invalid_configs_are_rejected_at_construction() {
        let err = WheelTimer::with_config(TimerConfig {
            tick_duration: Duration::ZERO,
            ..TimerConfig::default()
        });
        assert!(matches!(err, Err(TimerError::InvalidTickDuration)));

        let err = WheelTimer::with_config(TimerConfig {
            ticks_per_wheel: 0,
            ..TimerConfig::default()
        });
        assert!(matches!(err, Err(TimerError::InvalidTicksPerWheel(0))));
    }
}
