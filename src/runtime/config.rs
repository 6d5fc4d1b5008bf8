//! Runtime configuration of a benchmark run.
use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::descriptor::Mode;
use crate::error::RunError;

/// Worker pool construction strategy.
///
/// Read once at startup; immutable for the lifetime of a run.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
    strum::Display,
)]
#[strum(serialize_all = "kebab-case")]
pub enum ExecutorKind {
    /// Per-run OS threads, pre-named `rmh-worker-N`. The default.
    #[default]
    Fixed,
    /// Per-run OS threads spawned on demand.
    Cached,
    /// A fork-join pool owned by the run, sized to the worker count.
    ForkJoin,
    /// The process-wide shared fork-join pool. Never shut down by the run.
    /// Behavior when the shared pool is saturated by a concurrent run is
    /// undefined; prefer [`ExecutorKind::ForkJoin`].
    SharedForkJoin,
}

/// Configuration of one benchmark run.
#[derive(Clone, Debug)]
pub struct BenchmarkConfig {
    /// Upper bound on concurrent workers.
    pub max_threads: u32,
    /// Number of warmup iterations (results discarded).
    pub warmup_iterations: u32,
    /// Number of measurement iterations.
    pub measurement_iterations: u32,
    /// Time budget of one iteration (ignored in single-shot mode).
    pub iteration_time: Duration,
    /// Invocations per worker in single-shot mode.
    pub batch_size: u64,
    /// Abort the run on the first failed iteration.
    pub fail_on_error: bool,
    /// Worker partition: group `g` receives a contiguous range of thread
    /// ids. Empty means one group holding `max_threads` workers.
    pub thread_groups: Vec<u32>,
    /// Worker pool construction strategy.
    pub executor: ExecutorKind,
    /// Measurement modes to run; empty means the benchmark's declared
    /// modes.
    pub modes: BTreeSet<Mode>,
    /// Bound of each executor-shutdown wait before a warning is logged.
    pub shutdown_wait: Duration,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            max_threads: 1,
            warmup_iterations: 5,
            measurement_iterations: 5,
            iteration_time: Duration::from_secs(1),
            batch_size: 1,
            fail_on_error: false,
            thread_groups: Vec::new(),
            executor: ExecutorKind::Fixed,
            modes: BTreeSet::new(),
            shutdown_wait: Duration::from_secs(10),
        }
    }
}

impl BenchmarkConfig {
    /// The thread groups in effect, `[max_threads]` when none configured.
    pub fn effective_groups(&self) -> Vec<u32> {
        if self.thread_groups.is_empty() {
            vec![self.max_threads]
        } else {
            self.thread_groups.clone()
        }
    }

    /// The active worker count: the sum of the thread groups.
    pub fn active_threads(&self) -> u32 {
        self.effective_groups().iter().sum()
    }

    /// The group of thread `t`: the smallest `g` with
    /// `sum(groups[0..=g]) > t`.
    pub fn group_of(&self, thread_id: u32) -> u32 {
        let mut sum = 0;
        for (g, &size) in self.effective_groups().iter().enumerate() {
            sum += size;
            if sum > thread_id {
                return g as u32;
            }
        }
        // thread_id beyond the active range; validated configs never get here
        self.effective_groups().len().saturating_sub(1) as u32
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), RunError> {
        if self.max_threads == 0 {
            return Err(RunError::InvalidConfig("max_threads must be positive".into()));
        }
        if self.thread_groups.iter().any(|&g| g == 0) {
            return Err(RunError::InvalidConfig("thread groups must be positive".into()));
        }
        if self.active_threads() > self.max_threads {
            return Err(RunError::InvalidConfig(format!(
                "thread groups sum to {} but max_threads is {}",
                self.active_threads(),
                self.max_threads
            )));
        }
        if self.batch_size == 0 {
            return Err(RunError::InvalidConfig("batch_size must be positive".into()));
        }
        if self.iteration_time.is_zero() {
            return Err(RunError::InvalidConfig("iteration_time must be positive".into()));
        }
        Ok(())
    }
}
