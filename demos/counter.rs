//! A minimal benchmark: one benchmark-scoped counter state.
//!
//! Run with e.g. `cargo run --example counter -- -t 4 -w 1 -i 3 -d 200ms`.
use std::sync::atomic::{AtomicU64, Ordering};

use clap::Parser;
use rmh::cli::BenchCli;
use rmh::descriptor::{BenchmarkDescriptor, HelperKind, HelperMethod, Level, Scope, StateTypeInfo};
use rmh::generator::StubGenerator;
use rmh::{CompiledStub, StubBindings};

struct Counter {
    hits: AtomicU64,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let descriptor = BenchmarkDescriptor::new("demo.Counters", "bump").with_param(
        "demo.Counter",
        Scope::Benchmark,
        StateTypeInfo::state(vec![
            HelperMethod::new("reset", Level::Iteration, HelperKind::Setup),
        ]),
    );
    let stub = StubGenerator::new().generate(&descriptor)?;

    let bindings = StubBindings::new(|_loop_, states| {
        let counter: &Counter = states.get(0)?;
        counter.hits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    })
    .state("demo.Counter", || Ok(Counter { hits: AtomicU64::new(0) }))
    .helper("demo.Counter", "reset", |c: &Counter| {
        c.hits.store(0, Ordering::Relaxed);
        Ok(())
    });

    let compiled = CompiledStub::link(stub.plan, bindings)?;
    rmh::cli::run(&BenchCli::parse(), &compiled, &mut [])
}
