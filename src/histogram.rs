//! Invocation latency histograms for sample-time measurement.
use std::time::Duration;

use hdrhistogram::Histogram;
use serde::Serialize;

use crate::error::SampleError;

/// A histogram of invocation latencies, recorded per worker and merged by
/// the coordinator after each iteration.
pub struct SampleHistogram {
    hist: Histogram<u64>,
}

impl SampleHistogram {
    /// Creates an empty histogram with three significant digits.
    pub fn new() -> SampleHistogram {
        Self { hist: Histogram::<u64>::new(3).expect("create histogram") }
    }

    /// Records one invocation latency.
    pub fn record(&mut self, d: Duration) -> Result<(), SampleError> {
        let nanos = u64::try_from(d.as_nanos())
            .map_err(|_| SampleError::LatencyTooLarge { latency: d })?;
        self.hist.record(nanos).map_err(SampleError::from)
    }

    /// Returns true if no samples were recorded.
    pub fn is_empty(&self) -> bool {
        self.hist.is_empty()
    }

    /// Moves all samples of `self` into `target`, leaving `self` empty.
    pub fn drain_into(&mut self, target: &mut SampleHistogram) {
        target.hist.add(&self.hist).expect("merge histogram");
        self.hist.reset();
    }

    /// The latency at quantile `q` (0.0 to 1.0).
    pub fn value_at_quantile(&self, q: f64) -> Duration {
        Duration::from_nanos(self.hist.value_at_quantile(q))
    }

    /// Summarizes the recorded samples; `None` when empty.
    pub fn summary(&self) -> Option<SampleSummary> {
        if self.is_empty() {
            return None;
        }
        Some(SampleSummary {
            count: self.hist.len(),
            mean: Duration::from_nanos(self.hist.mean() as u64),
            p50: self.value_at_quantile(0.50),
            p90: self.value_at_quantile(0.90),
            p99: self.value_at_quantile(0.99),
            max: Duration::from_nanos(self.hist.max()),
        })
    }
}

impl Default for SampleHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable summary of one iteration's invocation latencies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct SampleSummary {
    /// Number of recorded invocations.
    pub count: u64,
    /// Mean latency.
    pub mean: Duration,
    /// Median latency.
    pub p50: Duration,
    /// 90th percentile latency.
    pub p90: Duration,
    /// 99th percentile latency.
    pub p99: Duration,
    /// Highest recorded latency.
    pub max: Duration,
}
