//! Profiler hook capability.
//!
//! Profilers are external collaborators: the engine starts them right before
//! releasing workers into the measured region and stops them right after the
//! region ends, attaching their opaque results to the iteration. Profiler
//! failures are logged and swallowed; they never fail an iteration.

use serde::Serialize;

/// An opaque result produced by a profiler for one iteration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProfilerResult {
    /// Label of the producing profiler.
    pub profiler: String,
    /// Profiler-defined payload.
    pub value: serde_json::Value,
}

/// A profiler that measures the region between start and end calls.
pub trait ProfilerHook: Send {
    /// Label used in reports and log messages.
    fn label(&self) -> &str;

    /// Called before workers enter the measured region.
    fn start_profile(&mut self) -> anyhow::Result<()>;

    /// Called after all workers left the measured region.
    fn end_profile(&mut self) -> anyhow::Result<ProfilerResult>;
}
