//! The benchmark-stub generator.
//!
//! Turns validated [`BenchmarkDescriptor`]s into per-benchmark executor
//! stubs. The stub exists in two equivalent forms with the same contract:
//! deterministic source text for build-time compilation (see [`emit`]) and
//! an [`ExecutionPlan`] the in-memory engine interprets after linking (see
//! [`crate::CompiledStub`]). The generator also produces the benchmark list
//! resource enumerating every valid benchmark.

pub mod emit;
pub mod layout;

use std::collections::BTreeSet;

use crate::descriptor::{BenchmarkDescriptor, Scope, CONTROL_PARAM_TYPE, EXPECTED_RETURN_TYPE};
use crate::error::GeneratorError;
use crate::generator::layout::{ExecutionPlan, StateLayout};
use crate::output::OutputFormat;

/// Well-known resource path of the benchmark list.
pub const BENCHMARK_LIST_PATH: &str = "META-INF/BenchmarkList";

/// A generated stub: the runtime plan and the emitted source text.
#[derive(Clone, Debug)]
pub struct GeneratedStub {
    /// The plan the in-memory engine interprets.
    pub plan: ExecutionPlan,
    /// Deterministic source text for build-time compilation.
    pub source: String,
}

/// Output of a batch generation pass.
#[derive(Debug, Default)]
pub struct GeneratorOutput {
    /// Stubs for every valid descriptor, input order.
    pub stubs: Vec<GeneratedStub>,
    /// Content of the benchmark list resource.
    pub benchmark_list: String,
}

/// The stub generator.
#[derive(Clone, Copy, Debug, Default)]
pub struct StubGenerator;

impl StubGenerator {
    /// Creates a generator.
    pub fn new() -> Self {
        StubGenerator
    }

    /// Validates a descriptor without generating anything.
    pub fn validate(&self, descriptor: &BenchmarkDescriptor) -> Result<(), GeneratorError> {
        let benchmark = descriptor.id();

        if descriptor.return_type != EXPECTED_RETURN_TYPE
            || descriptor.extra_params != [CONTROL_PARAM_TYPE.to_string()]
        {
            return Err(GeneratorError::BadSignature {
                benchmark,
                found_params: descriptor.extra_params.join(", "),
                found_return: descriptor.return_type.clone(),
            });
        }

        for param in &descriptor.params {
            let is_state = descriptor
                .state_types
                .get(&param.state_type)
                .is_some_and(|info| info.is_state);
            if !is_state {
                return Err(GeneratorError::NotAState {
                    benchmark,
                    state_type: param.state_type.clone(),
                });
            }
        }

        let mut shared = BTreeSet::new();
        for param in &descriptor.params {
            if param.scope == Scope::Thread {
                continue;
            }
            if !shared.insert((param.state_type.clone(), param.scope)) {
                return Err(GeneratorError::DuplicateSharedState {
                    benchmark,
                    state_type: param.state_type.clone(),
                    scope: param.scope,
                });
            }
        }

        Ok(())
    }

    /// Generates the stub for one descriptor.
    pub fn generate(&self, descriptor: &BenchmarkDescriptor) -> Result<GeneratedStub, GeneratorError> {
        self.validate(descriptor)?;
        let plan = ExecutionPlan {
            benchmark_id: descriptor.id(),
            owner_type: descriptor.owner_type.clone(),
            method_name: descriptor.method_name.clone(),
            modes: descriptor.modes.clone(),
            layout: StateLayout::from_descriptor(descriptor),
        };
        let source = emit::emit_stub(&plan).expect("emit into string");
        Ok(GeneratedStub { plan, source })
    }

    /// Generates stubs for every valid descriptor and the benchmark list.
    ///
    /// Invalid descriptors are reported through the sink and skipped;
    /// generation continues with the rest.
    pub fn generate_all(
        &self,
        descriptors: &[BenchmarkDescriptor],
        output: &mut dyn OutputFormat,
    ) -> GeneratorOutput {
        let mut stubs = Vec::new();
        for descriptor in descriptors {
            match self.generate(descriptor) {
                Ok(stub) => stubs.push(stub),
                Err(err) => output.exception(&anyhow::Error::new(err)),
            }
        }
        let benchmark_list = benchmark_list(stubs.iter().map(|s| s.plan.benchmark_id.clone()));
        GeneratorOutput { stubs, benchmark_list }
    }
}

/// Renders the benchmark list: ascending ids, deduplicated, one per line
/// with a trailing newline.
pub fn benchmark_list(ids: impl IntoIterator<Item = String>) -> String {
    let sorted: BTreeSet<String> = ids.into_iter().collect();
    let mut out = String::new();
    for id in sorted {
        out.push_str(&id);
        out.push('\n');
    }
    out
}
