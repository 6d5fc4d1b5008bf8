//! Group-scoped state: each thread group shares one accumulator.
//!
//! Run with e.g. `cargo run --example grouped -- -t 4 --thread-groups 2,2`.
use std::sync::atomic::{AtomicU64, Ordering};

use clap::Parser;
use rmh::cli::BenchCli;
use rmh::descriptor::{BenchmarkDescriptor, HelperKind, HelperMethod, Level, Scope, StateTypeInfo};
use rmh::generator::StubGenerator;
use rmh::{CompiledStub, StubBindings};

struct Accumulator {
    total: AtomicU64,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let descriptor = BenchmarkDescriptor::new("demo.Groups", "accumulate").with_param(
        "demo.Accumulator",
        Scope::Group,
        StateTypeInfo::state(vec![
            HelperMethod::new("drain", Level::Iteration, HelperKind::Teardown),
        ]),
    );
    let stub = StubGenerator::new().generate(&descriptor)?;

    let bindings = StubBindings::new(|_loop_, states| {
        let acc: &Accumulator = states.get(0)?;
        acc.total.fetch_add(1, Ordering::Relaxed);
        Ok(())
    })
    .state("demo.Accumulator", || Ok(Accumulator { total: AtomicU64::new(0) }))
    .helper("demo.Accumulator", "drain", |acc: &Accumulator| {
        let total = acc.total.swap(0, Ordering::Relaxed);
        log::debug!("group drained {total} accumulated ops");
        Ok(())
    });

    let compiled = CompiledStub::link(stub.plan, bindings)?;
    rmh::cli::run(&BenchCli::parse(), &compiled, &mut [])
}
