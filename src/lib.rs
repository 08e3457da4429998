//! Approximate, high-throughput timer backed by a hashed timing wheel.
//!
//! Built for the I/O-timeout workload of a network server: huge numbers of
//! short-to-medium deferred tasks (idle-connection detection, retransmission
//! alarms, request deadlines) where almost every timeout is cancelled before
//! it fires. Schedule and cancel are O(1) regardless of queue depth; the
//! price is tick-granularity accuracy — a task fires no earlier than its
//! deadline's tick boundary and typically within one tick after it.
//!
//! The construction is Varghese and Lauck's hashed timing wheel: a fixed
//! power-of-two ring of buckets, each an intrusive doubly-linked list of
//! timeout handles, with a rounds counter standing in for a hierarchy on
//! deadlines beyond one revolution.
//!
//! # Design themes
//!
//! - **The handle is the list node.** Placing or removing a timeout touches
//!   pointers inside the handle itself; the hot path allocates nothing.
//! - **One worker, lock-free edges.** A dedicated thread owns the wheel;
//!   producers reach it only through lock-free queues and atomics, so
//!   submission and cancellation never contend with the tick loop.
//! - **CAS-arbitrated lifecycle.** A handle's INIT -> CANCELLED / EXPIRED
//!   transition happens exactly once; a cancel racing an expiry has exactly
//!   one winner and the loser backs off.
//!
//! # Module map
//!
//! - [`timer`]: the [`WheelTimer`] facade, lifecycle, and instance
//!   accounting.
//! - [`timeout`]: the [`Timeout`] handle and its state machine.
//! - [`config`]: construction-time options and validation.
//! - [`task`]: the [`TimerTask`] and [`ThreadFactory`] seams.
//! - [`error`]: [`TimerError`].
//! - `bucket`, `worker`, `clock`, `leak`: internals — the wheel itself, the
//!   tick loop, the monotonic time source, and the leak hook.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use wheel_timer::{TimerConfig, WheelTimer};
//!
//! let timer = WheelTimer::with_config(TimerConfig::default())?;
//!
//! let timeout = timer.new_timeout(
//!     |_handle: &std::sync::Arc<wheel_timer::Timeout>| {
//!         println!("connection idle too long");
//!     },
//!     Duration::from_secs(30),
//! )?;
//!
//! // The common case: the connection made progress, so disarm the alarm.
//! timeout.cancel();
//!
//! // Unfired timeouts come back to the caller on shutdown.
//! let unprocessed = timer.stop()?;
//! assert!(unprocessed.len() <= 1);
//! # Ok::<(), wheel_timer::TimerError>(())
//! ```

mod bucket;
mod clock;
pub mod config;
pub mod error;
mod leak;
pub mod task;
pub mod timeout;
pub mod timer;
mod worker;

pub use config::TimerConfig;
pub use error::TimerError;
pub use task::{DefaultThreadFactory, ThreadFactory, TimerTask};
pub use timeout::Timeout;
pub use timer::{TimerHandle, WheelTimer, INSTANCE_COUNT_LIMIT};

// Benchmark-only export; not a stable API.
#[doc(hidden)]
pub use worker::placement;
