//! Typed errors for stub generation, linkage and benchmark execution.
use std::time::Duration;

use thiserror::Error;

use crate::descriptor::Scope;

/// Errors detected while validating a descriptor or generating a stub.
///
/// Generation errors are reported per benchmark and never abort a batch run:
/// the offending benchmark is skipped and generation continues.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GeneratorError {
    /// A method parameter's declared type does not carry the State capability.
    #[error("parameter type `{state_type}` of `{benchmark}` is not a state type")]
    NotAState {
        /// Benchmark id (`owner.method`).
        benchmark: String,
        /// The offending parameter type.
        state_type: String,
    },

    /// The benchmark method signature does not match `fn(Loop) -> Result`.
    #[error(
        "`{benchmark}` has an unsupported signature: expected `fn(Loop) -> Result`, \
         found `fn({found_params}) -> {found_return}`"
    )]
    BadSignature {
        /// Benchmark id (`owner.method`).
        benchmark: String,
        /// The declared non-state parameter list, comma separated.
        found_params: String,
        /// The declared return type.
        found_return: String,
    },

    /// A shared-scope state type is bound more than once in one signature.
    #[error("`{benchmark}` binds `{state_type}` more than once with {scope} scope")]
    DuplicateSharedState {
        /// Benchmark id (`owner.method`).
        benchmark: String,
        /// The duplicated state type.
        state_type: String,
        /// The shared scope in question (Benchmark or Group).
        scope: Scope,
    },
}

/// Errors raised while linking an execution plan against runtime bindings.
#[derive(Debug, Error)]
pub enum LinkError {
    /// No factory was registered for a state type named by the plan.
    #[error("no state factory registered for `{0}`")]
    MissingState(String),

    /// A helper method named by the plan has no registered closure.
    #[error("no closure registered for helper `{helper}` of state `{state_type}`")]
    MissingHelper {
        /// State type owning the helper.
        state_type: String,
        /// Helper method name.
        helper: String,
    },
}

/// Errors from recording invocation samples.
#[derive(Debug, Error)]
pub enum SampleError {
    /// The latency exceeds the histogram's recordable range.
    #[error("sample latency {latency:?} exceeds the recordable range")]
    LatencyTooLarge {
        /// The unrecordable latency.
        latency: Duration,
    },

    /// The underlying histogram rejected the value.
    #[error("failed to record sample: {0}")]
    Record(#[from] hdrhistogram::errors::RecordError),
}

/// Errors raised by the execution engine.
#[derive(Debug, Error)]
pub enum RunError {
    /// The benchmark configuration failed validation.
    #[error("invalid benchmark config: {0}")]
    InvalidConfig(String),

    /// The worker pool could not be constructed.
    #[error("failed to build the worker executor: {0}")]
    ExecutorBuild(String),

    /// A Trial-level setup failed; the benchmark produced no iterations.
    #[error("trial setup failed: {0}")]
    TrialSetupFailed(String),

    /// An iteration failed while `fail_on_error` was set.
    #[error("iteration {index} failed: {reason}")]
    IterationFailed {
        /// 1-based measurement iteration index.
        index: u32,
        /// The first recorded failure.
        reason: String,
    },

    /// Worker threads did not terminate within the bounded shutdown waits.
    #[error("worker threads failed to terminate within {waited:?}")]
    ShutdownTimeout {
        /// Total time spent waiting before giving up.
        waited: Duration,
    },
}
