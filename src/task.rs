//! External collaborator traits: user tasks and worker-thread creation.
//!
//! Both traits are seams, not machinery. The timer core only ever calls
//! `TimerTask::run` from its worker thread and `ThreadFactory::spawn_worker`
//! once per timer instance; everything else about tasks and threads is the
//! caller's business.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::timeout::Timeout;

/// A deferred task scheduled against a timer.
///
/// Executed on the timer's worker thread once the associated timeout
/// expires. The worker runs tasks serially: a slow task delays every other
/// task on the wheel, so heavy work belongs on the caller's own executor.
///
/// A task receives its own [`Timeout`] handle, which it may clone, inspect,
/// or use to schedule follow-up work via [`Timeout::timer`].
///
/// Panics raised by `run` are caught on the worker thread and logged; they
/// never unwind into the wheel.
pub trait TimerTask: Send + Sync + 'static {
    fn run(&self, timeout: &Arc<Timeout>);
}

impl<F> TimerTask for F
where
    F: Fn(&Arc<Timeout>) + Send + Sync + 'static,
{
    fn run(&self, timeout: &Arc<Timeout>) {
        self(timeout)
    }
}

/// Produces the dedicated worker thread for a timer instance.
///
/// Implementations may pin, rename, or otherwise decorate the thread; the
/// timer only requires that the supplied closure eventually runs on it.
pub trait ThreadFactory: Send + Sync + 'static {
    /// Spawn the worker thread running `f`.
    fn spawn_worker(
        &self,
        name: &str,
        f: Box<dyn FnOnce() + Send + 'static>,
    ) -> io::Result<JoinHandle<()>>;

    /// Whether produced threads are background (daemon-like) threads that
    /// should not keep leak tracking alive on their own. Feeds the
    /// leak-detection attach rule; see [`TimerConfig::leak_detection`].
    ///
    /// [`TimerConfig::leak_detection`]: crate::config::TimerConfig::leak_detection
    fn daemon(&self) -> bool {
        false
    }
}

/// Default factory: a plain named OS thread per timer.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultThreadFactory;

impl ThreadFactory for DefaultThreadFactory {
    fn spawn_worker(
        &self,
        name: &str,
        f: Box<dyn FnOnce() + Send + 'static>,
    ) -> io::Result<JoinHandle<()>> {
        thread::Builder::new().name(name.to_owned()).spawn(f)
    }
}

static WORKER_SEQ: AtomicUsize = AtomicUsize::new(0);

/// Next worker-thread name, unique within the process.
pub(crate) fn next_worker_name() -> String {
    format!("wheel-timer-{}", WORKER_SEQ.fetch_add(1, Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_factory_names_threads() {
        let name = next_worker_name();
        let handle = DefaultThreadFactory
            .spawn_worker(
                &name,
                Box::new(|| {
                    let current = thread::current();
                    assert!(current.name().unwrap().starts_with("wheel-timer-"));
                }),
            )
            .unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn worker_names_are_unique() {
        let a = next_worker_name();
        let b = next_worker_name();
        assert_ne!(a, b);
    }

    #[test]
    fn default_factory_is_not_daemon() {
        assert!(!DefaultThreadFactory.daemon());
    }
}
