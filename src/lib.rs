//! A micro-benchmark harness core for Rust.
//!
//! `rmh` turns declarative benchmark descriptors into executable stubs and
//! runs them on coordinated worker threads. State objects are constructed,
//! shared and torn down exactly according to their declared scope
//! (per-benchmark, per-group, per-thread) and level (per-trial,
//! per-iteration, per-invocation); workers enter and leave each measured
//! region together, so per-thread operation counts are comparable.
//!
//! ## Features
//!
//! - **Deterministic stub generation**: byte-stable source emission and a
//!   sorted benchmark list, suitable for reproducible builds.
//! - **Scoped state**: lazily initialized, cache-line padded state objects
//!   with setup/teardown hooks at trial, iteration and invocation level.
//! - **Coordinated measurement**: reusable barriers delimit every measured
//!   region; one timer, per-thread op counters.
//! - **Pluggable edges**: output sinks, profiler hooks and an embeddable
//!   CLI record.
//!
//! ## Example
//!
//! ```no_run
//! use clap::Parser;
//! use rmh::cli::BenchCli;
//! use rmh::descriptor::{
//!     BenchmarkDescriptor, HelperKind, HelperMethod, Level, Scope, StateTypeInfo,
//! };
//! use rmh::generator::StubGenerator;
//! use rmh::{CompiledStub, StubBindings};
//! use std::sync::atomic::{AtomicU64, Ordering};
//!
//! struct Counter {
//!     hits: AtomicU64,
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     let descriptor = BenchmarkDescriptor::new("demo.Counters", "bump").with_param(
//!         "demo.Counter",
//!         Scope::Benchmark,
//!         StateTypeInfo::state(vec![HelperMethod::new(
//!             "reset",
//!             Level::Iteration,
//!             HelperKind::Setup,
//!         )]),
//!     );
//!     let stub = StubGenerator::new().generate(&descriptor)?;
//!
//!     let bindings = StubBindings::new(|_loop_, states| {
//!         let counter: &Counter = states.get(0)?;
//!         counter.hits.fetch_add(1, Ordering::Relaxed);
//!         Ok(())
//!     })
//!     .state("demo.Counter", || Ok(Counter { hits: AtomicU64::new(0) }))
//!     .helper("demo.Counter", "reset", |c: &Counter| {
//!         c.hits.store(0, Ordering::Relaxed);
//!         Ok(())
//!     });
//!
//!     let compiled = CompiledStub::link(stub.plan, bindings)?;
//!     rmh::cli::run(&BenchCli::parse(), &compiled, &mut [])
//! }
//! ```
#![deny(missing_docs)]

mod duration;
mod error;
mod histogram;
mod report;
mod stub;
mod util;

pub mod cli;
pub mod descriptor;
pub mod generator;
pub mod output;
pub mod profiler;
pub mod runtime;

pub use crate::{
    error::{GeneratorError, LinkError, RunError, SampleError},
    histogram::{SampleHistogram, SampleSummary},
    report::{BenchResult, IterationData, IterationStatus, ModeSummary, RunSummary},
    stub::{BodyFn, CompiledStub, FactoryFn, HelperFn, StateSet, StubBindings},
};
