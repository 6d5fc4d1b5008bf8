//! Benchmark metadata consumed by the stub generator.
//!
//! A [`BenchmarkDescriptor`] is a fully resolved record describing one
//! benchmark method: its owner type, measurement modes, declared signature,
//! state-typed parameters and the setup/teardown helpers of every state type
//! it touches. Descriptors are produced by a build-time front-end (or by
//! hand in tests); the core never inspects source code itself. Helper lists
//! are expected to be flattened over the state type's inheritance chain by
//! the producer.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// The declared return type every benchmark method must have.
pub const EXPECTED_RETURN_TYPE: &str = "Result";

/// The declared type of the single non-state parameter.
pub const CONTROL_PARAM_TYPE: &str = "Loop";

/// Measurement mode of a benchmark.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    clap::ValueEnum, strum::Display,
)]
#[strum(serialize_all = "kebab-case")]
pub enum Mode {
    /// Operations per unit of time.
    Throughput,
    /// Average time per operation.
    AverageTime,
    /// Time distribution of individual invocations.
    SampleTime,
    /// Time of a single batch of invocations, no warm iteration loop.
    SingleShotTime,
    /// Shorthand for all concrete modes.
    All,
}

impl Mode {
    /// The concrete modes, in canonical order.
    pub const CONCRETE: [Mode; 4] =
        [Mode::Throughput, Mode::AverageTime, Mode::SampleTime, Mode::SingleShotTime];

    /// Expands a mode set, replacing [`Mode::All`] with every concrete mode.
    pub fn expand(modes: &BTreeSet<Mode>) -> BTreeSet<Mode> {
        if modes.contains(&Mode::All) {
            Mode::CONCRETE.into_iter().collect()
        } else {
            modes.clone()
        }
    }
}

/// Sharing discipline of a state object.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    strum::Display,
)]
#[strum(serialize_all = "kebab-case")]
pub enum Scope {
    /// One instance shared by every worker of the benchmark run.
    Benchmark,
    /// One instance per thread group.
    Group,
    /// One instance per worker thread.
    Thread,
}

/// Time scale at which a helper method fires.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    strum::Display,
)]
#[strum(serialize_all = "kebab-case")]
pub enum Level {
    /// Once per benchmark run.
    Trial,
    /// Once per iteration.
    Iteration,
    /// Once per invocation of the benchmark body.
    Invocation,
}

/// Whether a helper runs before or after its level's cycle.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    strum::Display,
)]
#[strum(serialize_all = "kebab-case")]
pub enum HelperKind {
    /// Runs before the level cycle.
    Setup,
    /// Runs after the level cycle.
    Teardown,
}

/// A setup or teardown method declared on a state type.
///
/// Declared source order is significant: helpers of one state object at the
/// same level and kind run in the order they appear in this list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelperMethod {
    /// Method name, unique within its state type.
    pub name: String,
    /// Level at which the helper fires.
    pub level: Level,
    /// Setup or teardown.
    pub kind: HelperKind,
}

impl HelperMethod {
    /// Creates a helper record.
    pub fn new(name: impl Into<String>, level: Level, kind: HelperKind) -> Self {
        Self { name: name.into(), level, kind }
    }
}

/// Resolved facts about a state type referenced by a descriptor.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTypeInfo {
    /// Whether the type carries the State capability.
    pub is_state: bool,
    /// Helpers declared on the type and its ancestors, in source order.
    pub helpers: Vec<HelperMethod>,
}

impl StateTypeInfo {
    /// Info for a proper state type with the given helpers.
    pub fn state(helpers: Vec<HelperMethod>) -> Self {
        Self { is_state: true, helpers }
    }
}

/// One state-typed parameter of a benchmark method.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamBinding {
    /// Fully qualified state type name.
    pub state_type: String,
    /// Sharing discipline of the bound instance.
    pub scope: Scope,
}

impl ParamBinding {
    /// Creates a parameter binding.
    pub fn new(state_type: impl Into<String>, scope: Scope) -> Self {
        Self { state_type: state_type.into(), scope }
    }
}

/// A fully resolved benchmark method record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchmarkDescriptor {
    /// Fully qualified owner type.
    pub owner_type: String,
    /// Method name within the owner type.
    pub method_name: String,
    /// Requested measurement modes.
    pub modes: BTreeSet<Mode>,
    /// Declared return type; must equal [`EXPECTED_RETURN_TYPE`].
    pub return_type: String,
    /// Declared non-state parameters; must be exactly `["Loop"]`.
    pub extra_params: Vec<String>,
    /// State-typed parameters, in declared order.
    pub params: Vec<ParamBinding>,
    /// Facts about every state type the parameters reference.
    pub state_types: BTreeMap<String, StateTypeInfo>,
}

impl BenchmarkDescriptor {
    /// Creates a descriptor with a conforming signature and no parameters.
    pub fn new(owner_type: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            owner_type: owner_type.into(),
            method_name: method_name.into(),
            modes: BTreeSet::from([Mode::Throughput]),
            return_type: EXPECTED_RETURN_TYPE.to_string(),
            extra_params: vec![CONTROL_PARAM_TYPE.to_string()],
            params: Vec::new(),
            state_types: BTreeMap::new(),
        }
    }

    /// The benchmark id, `owner_type.method_name`.
    pub fn id(&self) -> String {
        format!("{}.{}", self.owner_type, self.method_name)
    }

    /// Adds a measurement mode.
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.modes.insert(mode);
        self
    }

    /// Appends a state parameter, registering the type's info on first use.
    pub fn with_param(
        mut self,
        state_type: impl Into<String>,
        scope: Scope,
        info: StateTypeInfo,
    ) -> Self {
        let state_type = state_type.into();
        self.params.push(ParamBinding::new(state_type.clone(), scope));
        self.state_types.entry(state_type).or_insert(info);
        self
    }

    /// Helpers of `state_type` matching the given level and kind, declared order.
    pub fn helpers_of(&self, state_type: &str, level: Level, kind: HelperKind) -> Vec<&HelperMethod> {
        self.state_types
            .get(state_type)
            .map(|info| {
                info.helpers
                    .iter()
                    .filter(|h| h.level == level && h.kind == kind)
                    .collect()
            })
            .unwrap_or_default()
    }
}
