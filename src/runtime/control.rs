//! Measurement control flags and the per-worker loop handle.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Shared measurement flags.
///
/// Written only by the coordinator, read by every worker (and by benchmark
/// bodies through [`Loop`]). Over one mode-run `warm_up` transitions from
/// true to false exactly once; `stop_measurement` is raised once per
/// iteration and reset by the coordinator while no worker can observe it.
#[derive(Debug)]
pub struct Control {
    stop: AtomicBool,
    warmup: AtomicBool,
    abort: AtomicBool,
}

impl Control {
    pub(crate) fn new() -> Self {
        Self {
            stop: AtomicBool::new(false),
            warmup: AtomicBool::new(true),
            abort: AtomicBool::new(false),
        }
    }

    /// True once the current iteration's measured region should end.
    pub fn stop_measurement(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// True while warmup iterations are running.
    pub fn warming_up(&self) -> bool {
        self.warmup.load(Ordering::Acquire)
    }

    pub(crate) fn set_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub(crate) fn clear_stop(&self) {
        self.stop.store(false, Ordering::Release);
    }

    pub(crate) fn finish_warmup(&self) {
        self.warmup.store(false, Ordering::Release);
    }

    pub(crate) fn set_abort(&self) {
        self.abort.store(true, Ordering::Release);
    }

    pub(crate) fn aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }
}

/// The object handed to benchmark bodies.
///
/// Wraps the per-thread operation counter and a view of [`Control`]. The
/// harness counts one operation per invocation; bodies doing batched work
/// may add extras through [`Loop::add_ops`].
#[derive(Debug)]
pub struct Loop<'a> {
    control: &'a Control,
    ops: u64,
}

impl<'a> Loop<'a> {
    pub(crate) fn new(control: &'a Control) -> Self {
        Self { control, ops: 0 }
    }

    /// True once the measured region should end; long-running bodies should
    /// poll this.
    pub fn stop_requested(&self) -> bool {
        self.control.stop_measurement()
    }

    /// True while warmup iterations are running.
    pub fn warming_up(&self) -> bool {
        self.control.warming_up()
    }

    /// Credits extra operations beyond the per-invocation count.
    pub fn add_ops(&mut self, extra: u64) {
        self.ops += extra;
    }

    /// Counts one completed invocation. Called by the harness (or by
    /// generated stubs) after each successful body call.
    pub fn count_invocation(&mut self) {
        self.ops += 1;
    }

    /// Operations counted so far in this iteration.
    pub fn ops(&self) -> u64 {
        self.ops
    }
}

/// A cancellation token with an interruptible bounded wait.
///
/// Used by the coordinator to sleep out an iteration's time budget while
/// staying responsive to external cancellation.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: Mutex<bool>,
    cv: Condvar,
}

impl CancelToken {
    /// Creates a token in the not-cancelled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the token, waking every pending wait.
    pub fn cancel(&self) {
        let mut cancelled = self.inner.cancelled.lock();
        *cancelled = true;
        self.inner.cv.notify_all();
    }

    /// Whether the token was cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.lock()
    }

    /// Blocks until `timeout` elapses or the token is cancelled; returns
    /// true when cancelled.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut cancelled = self.inner.cancelled.lock();
        while !*cancelled {
            if self.inner.cv.wait_until(&mut cancelled, deadline).timed_out() {
                return *cancelled;
            }
        }
        true
    }
}
