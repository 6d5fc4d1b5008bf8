//! Embeddable CLI options for benchmark binaries.
//!
//! Host binaries usually flatten [`BenchCli`] into their own `clap` struct:
//!
//! ```no_run
//! use clap::Parser;
//! use rmh::cli::BenchCli;
//!
//! #[derive(Parser, Clone)]
//! pub struct Opts {
//!     /// Path of the data set to benchmark against.
//!     pub data: String,
//!
//!     #[command(flatten)]
//!     pub bench: BenchCli,
//! }
//! ```
use std::collections::BTreeSet;
use std::io::stdout;
use std::num::{NonZeroU32, NonZeroU64};

use clap::{Parser, ValueEnum};

use crate::descriptor::Mode;
use crate::output::{JsonOutput, OutputFormat, SilentOutput, TextOutput};
use crate::profiler::ProfilerHook;
use crate::report::RunSummary;
use crate::runtime::{BenchmarkConfig, ExecutorKind};
use crate::stub::CompiledStub;

/// Command-line options of the execution engine.
#[derive(Parser, Clone, Debug)]
pub struct BenchCli {
    /// Number of worker threads
    #[clap(long, short = 't', default_value = "1")]
    pub threads: NonZeroU32,

    /// Number of warmup iterations (results discarded)
    #[clap(long, short = 'w', default_value = "5")]
    pub warmup_iterations: u32,

    /// Number of measurement iterations
    #[clap(long, short = 'i', default_value = "5")]
    pub measurement_iterations: u32,

    /// Time budget of one iteration
    ///
    /// Examples: -d 500ms, -d 2s
    #[clap(long, short = 'd', default_value = "1s")]
    pub iteration_time: humantime::Duration,

    /// Invocations per worker in single-shot mode
    #[clap(long, default_value = "1")]
    pub batch_size: NonZeroU64,

    /// Worker partition sizes, e.g. --thread-groups 2,2
    ///
    /// The sum is the active worker count and must not exceed --threads.
    /// Defaults to one group holding every worker.
    #[clap(long, value_delimiter = ',')]
    pub thread_groups: Vec<u32>,

    /// Worker pool construction strategy
    #[clap(long, value_enum, default_value_t = ExecutorKind::Fixed, ignore_case = true)]
    pub executor: ExecutorKind,

    /// Measurement modes to run
    ///
    /// Defaults to the benchmark's declared modes.
    #[clap(long, short = 'm', value_enum, value_delimiter = ',', ignore_case = true)]
    pub modes: Vec<Mode>,

    /// Abort the run on the first failed iteration
    #[clap(long)]
    pub fail_on_error: bool,

    /// Suppress all output
    #[clap(long, short = 'q')]
    pub quiet: bool,

    /// Output format for iteration results and the summary
    #[clap(short = 'o', long, value_enum, default_value_t = OutputKind::Text, ignore_case = true)]
    pub output: OutputKind,
}

/// The bundled output sinks.
#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum OutputKind {
    /// Plain text lines and a summary table. See [`TextOutput`].
    Text,
    /// One JSON object per event. See [`JsonOutput`].
    Json,
    /// No output. See [`SilentOutput`].
    Silent,
}

impl BenchCli {
    /// These options as an engine configuration.
    pub fn config(&self) -> BenchmarkConfig {
        BenchmarkConfig {
            max_threads: self.threads.get(),
            warmup_iterations: self.warmup_iterations,
            measurement_iterations: self.measurement_iterations,
            iteration_time: self.iteration_time.into(),
            batch_size: self.batch_size.get(),
            fail_on_error: self.fail_on_error,
            thread_groups: self.thread_groups.clone(),
            executor: self.executor,
            modes: self.modes.iter().copied().collect::<BTreeSet<_>>(),
            ..Default::default()
        }
    }

    fn sink(&self) -> Box<dyn OutputFormat> {
        if self.quiet {
            return Box::new(SilentOutput);
        }
        match self.output {
            OutputKind::Text => Box::new(TextOutput::new(stdout())),
            OutputKind::Json => Box::new(JsonOutput::new(stdout())),
            OutputKind::Silent => Box::new(SilentOutput),
        }
    }
}

/// Runs one compiled stub with the given CLI options: selects the sink,
/// executes every selected mode and emits the final summary.
///
/// Returns an error (for a nonzero host exit) when an iteration failed
/// under `--fail-on-error`, or on any engine failure.
pub fn run(
    cli: &BenchCli,
    stub: &CompiledStub,
    profilers: &mut [Box<dyn ProfilerHook>],
) -> anyhow::Result<()> {
    let config = cli.config();
    let mut sink = cli.sink();
    let measurements = stub.run(&config, sink.as_mut(), profilers)?;
    let summary = RunSummary::from_iterations(stub.benchmark_id(), &measurements);
    sink.run_complete(&summary);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn cli_maps_onto_the_engine_config() {
        let cli = BenchCli::parse_from([
            "bench",
            "--threads",
            "4",
            "--thread-groups",
            "2,2",
            "--iteration-time",
            "250ms",
            "--modes",
            "throughput,average-time",
            "--fail-on-error",
        ]);
        let config = cli.config();

        assert_eq!(config.max_threads, 4);
        assert_eq!(config.thread_groups, vec![2, 2]);
        assert_eq!(config.iteration_time, Duration::from_millis(250));
        assert!(config.fail_on_error);
        assert_eq!(
            config.modes,
            BTreeSet::from([Mode::Throughput, Mode::AverageTime])
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn defaults_are_valid() {
        let cli = BenchCli::parse_from(["bench"]);
        let config = cli.config();
        assert_eq!(config.max_threads, 1);
        assert!(config.modes.is_empty());
        assert!(config.validate().is_ok());
    }
}
