//! Iteration results and score aggregation.
use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

use crate::descriptor::Mode;
use crate::histogram::SampleSummary;
use crate::profiler::ProfilerResult;

/// Outcome of one iteration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationStatus {
    /// The iteration completed without errors.
    Ok,
    /// The iteration failed; carries the first recorded failure.
    Failed(String),
}

impl IterationStatus {
    /// Returns true for [`IterationStatus::Ok`].
    pub fn is_ok(&self) -> bool {
        matches!(self, IterationStatus::Ok)
    }
}

impl std::fmt::Display for IterationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IterationStatus::Ok => write!(f, "ok"),
            IterationStatus::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// The result of one iteration.
#[derive(Clone, Debug, Serialize)]
pub struct IterationData {
    /// Mode this iteration ran under.
    pub mode: Mode,
    /// 1-based index within its phase (warmup and measurement count
    /// separately).
    pub index: u32,
    /// Whether this was a warmup iteration.
    pub warmup: bool,
    /// Length of the measured interval.
    pub duration: Duration,
    /// Completed operations per worker thread, indexed by worker id.
    pub operation_counts: Vec<u64>,
    /// Results attached by profiler hooks.
    pub profiler_results: Vec<ProfilerResult>,
    /// Invocation latency summary, present in sample-time mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub samples: Option<SampleSummary>,
    /// Outcome of the iteration.
    pub status: IterationStatus,
}

impl IterationData {
    /// Total operations across all workers.
    pub fn total_ops(&self) -> u64 {
        self.operation_counts.iter().sum()
    }

    /// Per-thread results; every worker shares the iteration interval.
    pub fn thread_results(&self) -> Vec<BenchResult> {
        self.operation_counts
            .iter()
            .map(|&ops| BenchResult::new(ops, self.duration))
            .collect()
    }
}

/// A benchmark's return contract: completed operations and the time they
/// took.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BenchResult {
    /// Completed operations.
    pub ops: u64,
    /// Time the operations took.
    pub time: Duration,
}

impl BenchResult {
    /// Creates a result.
    pub fn new(ops: u64, time: Duration) -> Self {
        Self { ops, time }
    }

    /// Throughput aggregation across threads: total operations over the
    /// longest thread time.
    pub fn throughput(results: &[BenchResult]) -> BenchResult {
        BenchResult {
            ops: results.iter().map(|r| r.ops).sum(),
            time: results.iter().map(|r| r.time).max().unwrap_or_default(),
        }
    }

    /// Average-time aggregation across threads: total thread time over
    /// total operations. Zero operations yield zero.
    pub fn average_time(results: &[BenchResult]) -> Duration {
        let ops: u64 = results.iter().map(|r| r.ops).sum();
        if ops == 0 {
            return Duration::ZERO;
        }
        let time: Duration = results.iter().map(|r| r.time).sum();
        Duration::from_secs_f64(time.as_secs_f64() / ops as f64)
    }

    /// Operations per second.
    pub fn ops_per_sec(&self) -> f64 {
        let secs = self.time.as_secs_f64();
        if secs > 0.0 { self.ops as f64 / secs } else { 0.0 }
    }
}

/// Aggregate over the measurement iterations of one mode.
#[derive(Clone, Debug, Serialize)]
pub struct ModeSummary {
    /// Number of measurement iterations.
    pub iterations: u32,
    /// Number of failed iterations.
    pub failed: u32,
    /// Mean score over successful iterations.
    pub score: f64,
    /// Unit of the score.
    pub unit: String,
}

/// Final per-mode summary of one benchmark run.
#[derive(Clone, Debug, Serialize)]
pub struct RunSummary {
    /// Benchmark id (`owner_type.method_name`).
    pub benchmark_id: String,
    /// Per-mode aggregates.
    pub modes: BTreeMap<Mode, ModeSummary>,
}

impl RunSummary {
    /// Builds the summary from measurement iterations (any order, any mix
    /// of modes).
    pub fn from_iterations(benchmark_id: impl Into<String>, iterations: &[IterationData]) -> Self {
        let mut by_mode: BTreeMap<Mode, Vec<&IterationData>> = BTreeMap::new();
        for data in iterations.iter().filter(|d| !d.warmup) {
            by_mode.entry(data.mode).or_default().push(data);
        }
        let modes = by_mode
            .into_iter()
            .map(|(mode, iters)| (mode, mode_summary(mode, &iters)))
            .collect();
        Self { benchmark_id: benchmark_id.into(), modes }
    }
}

fn mode_summary(mode: Mode, iterations: &[&IterationData]) -> ModeSummary {
    let ok: Vec<&&IterationData> = iterations.iter().filter(|d| d.status.is_ok()).collect();
    let mean = |values: Vec<f64>| {
        if values.is_empty() { 0.0 } else { values.iter().sum::<f64>() / values.len() as f64 }
    };

    let (score, unit) = match mode {
        Mode::Throughput => (
            mean(ok.iter().map(|d| BenchResult::throughput(&d.thread_results()).ops_per_sec()).collect()),
            "ops/s",
        ),
        Mode::AverageTime => (
            mean(ok.iter().map(|d| BenchResult::average_time(&d.thread_results()).as_nanos() as f64).collect()),
            "ns/op",
        ),
        Mode::SampleTime => (
            mean(ok
                .iter()
                .map(|d| match &d.samples {
                    Some(s) => s.mean.as_nanos() as f64,
                    None => BenchResult::average_time(&d.thread_results()).as_nanos() as f64,
                })
                .collect()),
            "ns/op",
        ),
        Mode::SingleShotTime => (mean(ok.iter().map(|d| d.duration.as_secs_f64()).collect()), "s"),
        // The engine only runs concrete modes.
        Mode::All => (0.0, ""),
    };

    ModeSummary {
        iterations: iterations.len() as u32,
        failed: (iterations.len() - ok.len()) as u32,
        score,
        unit: unit.to_string(),
    }
}
