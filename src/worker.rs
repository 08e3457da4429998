//! Worker loop: advances the wheel hand, drains ingress, expires buckets.
//!
//! Exactly one worker thread exists per timer instance. It owns the wheel
//! outright (buckets never cross threads) and is the single consumer of the
//! ingress and cancellation queues. Per tick it:
//!
//! 1. sleeps until the next tick boundary (parking, so shutdown can cut the
//!    sleep short),
//! 2. drains the cancellation queue, unlinking anything still in a bucket,
//! 3. drains up to [`MAX_TRANSFERS_PER_TICK`] new submissions into buckets,
//! 4. expires the current bucket, running due callbacks inline.
//!
//! On shutdown it sweeps every bucket and both queues so `stop()` can hand
//! the unfired handles back to the caller.
//!
//! # Timing
//!
//! The wheel is approximate by design: a callback fires no earlier than its
//! tick boundary and typically within one tick after it, plus OS sleep
//! jitter and whatever backlog earlier callbacks created.

use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_utils::sync::Parker;

use crate::bucket::Bucket;
use crate::clock;
use crate::timeout::{Timeout, ST_CANCELLED};
use crate::timer::{Inner, WORKER_SHUTDOWN, WORKER_STARTED};

/// Upper bound on ingress transfers per tick, so one burst of submissions
/// cannot stall the hand indefinitely.
const MAX_TRANSFERS_PER_TICK: usize = 100_000;

/// Returned by `wait_for_next_tick` when shutdown was observed (or elapsed
/// time has overflowed); the run loop skips the tick and re-checks state.
const SHUTDOWN_SENTINEL: i64 = i64::MIN;

// ============================================================================
// Placement math
// ============================================================================

/// Compute `(remaining_rounds, slot)` for a deadline observed at `tick`.
///
/// `calculated` is the absolute tick the deadline maps to. Deadlines already
/// behind the hand clamp to the current tick — they land in the bucket about
/// to be expired instead of wrapping a full revolution into the future.
/// Negative `remaining_rounds` are deliberate: the expiry walk treats
/// anything `<= 0` as due.
///
/// This is `pub` only so the benchmarks can reach it; it is not a stable API.
#[doc(hidden)]
#[inline]
pub fn placement(deadline: i64, tick_duration: i64, tick: i64, wheel_len: u64) -> (i64, u64) {
    debug_assert!(tick_duration > 0);
    debug_assert!(wheel_len.is_power_of_two());

    let calculated = deadline / tick_duration;
    let remaining_rounds = (calculated - tick) / wheel_len as i64;
    let ticks = calculated.max(tick);
    let slot = (ticks as u64) & (wheel_len - 1);

    (remaining_rounds, slot)
}

// ============================================================================
// Worker
// ============================================================================

pub(crate) struct Worker {
    inner: Arc<Inner>,
    parker: Parker,
    wheel: Box<[Bucket]>,
    mask: u64,
    /// Monotone tick counter. Wrapping is fine: only `tick & mask` matters.
    tick: i64,
    unprocessed: Vec<Arc<Timeout>>,
}

impl Worker {
    pub(crate) fn new(inner: Arc<Inner>, parker: Parker) -> Self {
        let wheel_len = inner.wheel_len;
        assert!(wheel_len.is_power_of_two());

        let wheel: Box<[Bucket]> = (0..wheel_len).map(|_| Bucket::new()).collect();

        Self {
            inner,
            parker,
            wheel,
            mask: wheel_len as u64 - 1,
            tick: 0,
            unprocessed: Vec::new(),
        }
    }

    pub(crate) fn run(mut self) {
        self.inner.set_worker_thread(thread::current().id());

        // All deadlines are relative to this instant; 0 stays reserved as
        // the "uninitialized" sentinel the start barrier spins on.
        let mut start = clock::now_nanos();
        if start == 0 {
            start = 1;
        }
        self.inner.publish_start_time(start);

        loop {
            let deadline = self.wait_for_next_tick();
            if deadline > 0 {
                let idx = (self.tick as u64 & self.mask) as usize;
                self.process_cancelled();
                self.transfer_to_buckets();
                self.wheel[idx].expire(deadline, &self.inner.pending_timeouts);
                self.tick = self.tick.wrapping_add(1);
            }
            if self.inner.worker_state() != WORKER_STARTED {
                break;
            }
        }

        // Shutdown: sweep the wheel and both queues so stop() can hand the
        // unfired handles back.
        for bucket in self.wheel.iter_mut() {
            bucket.drain_into(&mut self.unprocessed);
        }
        while let Some(timeout) = self.inner.ingress.pop() {
            if !timeout.is_cancelled() {
                self.unprocessed.push(timeout);
            }
        }
        self.process_cancelled();

        self.inner.publish_unprocessed(std::mem::take(&mut self.unprocessed));
    }

    /// Sleep until the next tick boundary.
    ///
    /// Returns the measured elapsed nanoseconds since start (which becomes
    /// the expiry deadline for the tick), or [`SHUTDOWN_SENTINEL`] when
    /// shutdown was observed while parked.
    fn wait_for_next_tick(&mut self) -> i64 {
        let target = self
            .inner
            .tick_duration
            .saturating_mul(self.tick.saturating_add(1));

        loop {
            let current = clock::now_nanos() - self.inner.start_time();
            // The +999_999 rounds the millisecond conversion up so a
            // truncated sleep can never wake before the tick boundary.
            let sleep_ms = target
                .saturating_sub(current)
                .saturating_add(999_999)
                / 1_000_000;

            if sleep_ms <= 0 {
                return if current == i64::MIN {
                    SHUTDOWN_SENTINEL
                } else {
                    current
                };
            }

            // Hosts with ~10 ms scheduler granularity oversleep non-multiple
            // requests; round down so the wake lands on a boundary.
            #[cfg(windows)]
            let sleep_ms = sleep_ms / 10 * 10;

            self.parker.park_timeout(Duration::from_millis(sleep_ms as u64));

            if self.inner.worker_state() == WORKER_SHUTDOWN {
                return SHUTDOWN_SENTINEL;
            }
        }
    }

    /// Drain the cancellation queue, unlinking handles still in a bucket.
    ///
    /// Every cancelled handle passes through here exactly once, so this is
    /// the single place a cancellation settles `pending_timeouts` — whether
    /// the handle was in a bucket, still in ingress, or already unlinked by
    /// the expiry walk.
    fn process_cancelled(&mut self) {
        while let Some(timeout) = self.inner.cancelled.pop() {
            // SAFETY: links are worker-only and this is the worker.
            let slot = unsafe { timeout.links().bucket };
            match slot {
                Some(slot) => {
                    let node = NonNull::from(&*timeout);
                    let (owned, _) =
                        self.wheel[slot as usize].remove(node, &self.inner.pending_timeouts);
                    debug_assert!(Arc::ptr_eq(&owned, &timeout));
                }
                None => {
                    self.inner.pending_timeouts.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Move queued submissions into their buckets, bounded per tick.
    fn transfer_to_buckets(&mut self) {
        for _ in 0..MAX_TRANSFERS_PER_TICK {
            let Some(timeout) = self.inner.ingress.pop() else {
                break;
            };
            if timeout.state() == ST_CANCELLED {
                // Cancelled before placement; the cancellation drain settles
                // its accounting.
                continue;
            }

            let (rounds, slot) = placement(
                timeout.deadline,
                self.inner.tick_duration,
                self.tick,
                self.wheel.len() as u64,
            );
            // SAFETY: worker thread; the handle is not yet linked.
            unsafe {
                timeout.links().remaining_rounds = rounds;
            }
            self.wheel[slot as usize].add(timeout, slot as u32);
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn placement_long_round() {
        // 1 ms tick, 16-slot wheel, 50 ms deadline: 50 ticks out, so three
        // full revolutions before firing on slot 2's fourth visit.
        let (rounds, slot) = placement(50_000_000, 1_000_000, 0, 16);
        assert_eq!(rounds, 3);
        assert_eq!(slot, 50 & 15);
    }

    #[test]
    fn placement_within_first_round() {
        let (rounds, slot) = placement(5_000_000, 1_000_000, 0, 16);
        assert_eq!(rounds, 0);
        assert_eq!(slot, 5);
    }

    #[test]
    fn placement_clamps_past_deadlines_to_current_tick() {
        // Deadline maps to tick 2 but the hand is at tick 10: the handle
        // lands in the bucket about to be visited, not a revolution away.
        let (rounds, slot) = placement(2_000_000, 1_000_000, 10, 8);
        assert!(rounds <= 0);
        assert_eq!(slot, 10 & 7);
    }

    #[test]
    fn placement_mid_stream_submission() {
        // Hand at tick 7; deadline at absolute tick 38 with a 16-slot
        // wheel: first visit of slot 6 is tick 22, one more round lands 38.
        let (rounds, slot) = placement(38_000_000, 1_000_000, 7, 16);
        assert_eq!(slot, 38 & 15);
        assert_eq!(rounds, (38 - 7) / 16);

        let first_visit = (7i64..).find(|t| (*t as u64) & 15 == slot).unwrap();
        assert_eq!(first_visit + rounds * 16, 38);
    }

    #[test]
    fn placement_slot_always_in_range() {
        for deadline in [0i64, 1, 999_999, 1_000_000, 123_456_789] {
            for tick in [0i64, 1, 7, 1 << 40] {
                let (_, slot) = placement(deadline, 1_000_000, tick, 8);
                assert!(slot < 8);
            }
        }
    }
}
