//! Output sinks for iteration results and diagnostics.
//!
//! The engine writes through the [`OutputFormat`] trait; formatting beyond
//! the bundled sinks is downstream's business. Sink write failures are
//! logged and never fail the benchmark.

use std::io::Write;

use log::warn;
use serde::Serialize;
use tabled::{builder::Builder, settings::Style};

use crate::duration::DurationExt;
use crate::report::{IterationData, RunSummary};
use crate::util::rate;

/// A sink for benchmark events.
pub trait OutputFormat {
    /// Emits one iteration's result (warmup iterations included).
    fn iteration_result(&mut self, data: &IterationData);

    /// Emits a diagnostic for a skipped benchmark or an infrastructure
    /// error.
    fn exception(&mut self, err: &anyhow::Error);

    /// Emits a free-form progress message.
    fn verbose_print(&mut self, msg: &str);

    /// Emits the final per-mode summary of a run.
    fn run_complete(&mut self, summary: &RunSummary) {
        let _ = summary;
    }
}

/// A sink that swallows every event.
pub struct SilentOutput;

impl OutputFormat for SilentOutput {
    fn iteration_result(&mut self, _: &IterationData) {}
    fn exception(&mut self, _: &anyhow::Error) {}
    fn verbose_print(&mut self, _: &str) {}
}

/// A line-oriented plain text sink.
pub struct TextOutput<W: Write> {
    w: W,
    verbose: bool,
}

impl<W: Write> TextOutput<W> {
    /// Creates a text sink over the given writer.
    pub fn new(w: W) -> Self {
        Self { w, verbose: false }
    }

    /// Enables `verbose_print` messages.
    pub fn verbose(mut self, on: bool) -> Self {
        self.verbose = on;
        self
    }

    fn emit(&mut self, line: std::fmt::Arguments<'_>) {
        if let Err(e) = writeln!(self.w, "{line}") {
            warn!("failed to write benchmark output: {e}");
        }
    }
}

impl<W: Write> OutputFormat for TextOutput<W> {
    fn iteration_result(&mut self, data: &IterationData) {
        let phase = if data.warmup { "warmup" } else { "iteration" };
        let ops = data.total_ops();
        let line = format!(
            "{} {:>9} {:>4}: {} ops in {} ({:.2} ops/s) [{}]",
            data.mode,
            phase,
            data.index,
            ops,
            data.duration.display_adjusted(),
            rate(ops, data.duration.as_secs_f64()),
            data.status,
        );
        self.emit(format_args!("{line}"));
    }

    fn exception(&mut self, err: &anyhow::Error) {
        self.emit(format_args!("error: {err:#}"));
    }

    fn verbose_print(&mut self, msg: &str) {
        if self.verbose {
            self.emit(format_args!("{msg}"));
        }
    }

    fn run_complete(&mut self, summary: &RunSummary) {
        let mut builder = Builder::default();
        builder.push_record(["mode", "iterations", "failed", "score", "unit"]);
        for (mode, m) in &summary.modes {
            builder.push_record([
                mode.to_string(),
                m.iterations.to_string(),
                m.failed.to_string(),
                format!("{:.2}", m.score),
                m.unit.clone(),
            ]);
        }
        let mut table = builder.build();
        table.with(Style::sharp());
        self.emit(format_args!("{}\n{table}", summary.benchmark_id));
    }
}

/// A sink that emits one JSON object per event.
pub struct JsonOutput<W: Write> {
    w: W,
}

#[derive(Serialize)]
struct Event<'a, T: Serialize> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(flatten)]
    payload: &'a T,
}

#[derive(Serialize)]
struct Message<'a> {
    message: &'a str,
}

impl<W: Write> JsonOutput<W> {
    /// Creates a JSON sink over the given writer.
    pub fn new(w: W) -> Self {
        Self { w }
    }

    fn emit<T: Serialize>(&mut self, kind: &'static str, payload: &T) {
        let result = serde_json::to_writer(&mut self.w, &Event { kind, payload })
            .map_err(std::io::Error::from)
            .and_then(|_| writeln!(self.w));
        if let Err(e) = result {
            warn!("failed to write benchmark output: {e}");
        }
    }
}

impl<W: Write> OutputFormat for JsonOutput<W> {
    fn iteration_result(&mut self, data: &IterationData) {
        self.emit("iteration", data);
    }

    fn exception(&mut self, err: &anyhow::Error) {
        self.emit("error", &Message { message: &format!("{err:#}") });
    }

    fn verbose_print(&mut self, msg: &str) {
        self.emit("message", &Message { message: msg });
    }

    fn run_complete(&mut self, summary: &RunSummary) {
        self.emit("summary", summary);
    }
}
