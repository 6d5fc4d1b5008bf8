//! Storage layout and hook scheduling for one benchmark.
//!
//! The layout pass turns a validated descriptor into the set of
//! [`StateObject`]s (one per state parameter) and the per-level hook
//! schedules the emitter and the execution engine both consume. All walks
//! are totally ordered so that identifier assignment, and therefore the
//! emitted source, is stable across runs.

use std::collections::BTreeMap;

use itertools::Itertools;

use crate::descriptor::{BenchmarkDescriptor, HelperKind, Level, Mode, Scope};

/// Scope order of setup blocks: thread first, then the guarded shared scopes.
pub(crate) const SETUP_SCOPE_ORDER: [Scope; 3] = [Scope::Thread, Scope::Benchmark, Scope::Group];

/// Scope order of teardown blocks; the reverse of the setup order.
pub(crate) const TEARDOWN_SCOPE_ORDER: [Scope; 3] = [Scope::Group, Scope::Benchmark, Scope::Thread];

/// A state parameter resolved to its storage identifiers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateObject {
    /// Original fully qualified type name.
    pub type_name: String,
    /// Generator-assigned padded subtype name; identical original types
    /// share one padded type.
    pub padded_type: String,
    /// Sharing discipline.
    pub scope: Scope,
    /// Storage slot identifier. The lexicographic order of field
    /// identifiers is the canonical order of state objects.
    pub field_ident: String,
    /// Per-thread binding name in emitted code.
    pub local_ident: String,
}

/// Hooks of one state object at one (level, kind), declared source order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HookBlock {
    /// Index into [`StateLayout::states`] (declared parameter order).
    pub state_index: usize,
    /// Helper method names, declared order.
    pub helpers: Vec<String>,
}

/// Ordered hook blocks for one level.
///
/// Setup blocks run thread-scoped first, then benchmark-scoped, then
/// group-scoped; teardown blocks run in the reverse scope order. Within one
/// scope, blocks follow the canonical state-object order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LevelSchedule {
    /// Setup blocks in execution order.
    pub setup: Vec<HookBlock>,
    /// Teardown blocks in execution order.
    pub teardown: Vec<HookBlock>,
}

/// The complete storage layout and hook schedule of one benchmark.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateLayout {
    /// State objects in declared parameter order.
    pub states: Vec<StateObject>,
    /// Indices of `states` in binding order: thread-scoped first, then
    /// benchmark-scoped, then group-scoped; canonical order within a scope.
    pub bind_order: Vec<usize>,
    /// Indices of `states` in teardown order: the reverse scope sequence
    /// (group, benchmark, thread); canonical order within a scope.
    pub teardown_order: Vec<usize>,
    /// Trial-level schedule.
    pub trial: LevelSchedule,
    /// Iteration-level schedule.
    pub iteration: LevelSchedule,
    /// Invocation-level schedule.
    pub invocation: LevelSchedule,
}

impl StateLayout {
    /// Builds the layout for a descriptor that already passed validation.
    pub fn from_descriptor(descriptor: &BenchmarkDescriptor) -> Self {
        let states = assign_identifiers(descriptor);

        let bind_order = order_by_scope(&states, &SETUP_SCOPE_ORDER);
        let teardown_order = order_by_scope(&states, &TEARDOWN_SCOPE_ORDER);

        let schedule = |level| LevelSchedule {
            setup: hook_blocks(descriptor, &states, level, HelperKind::Setup, &SETUP_SCOPE_ORDER),
            teardown: hook_blocks(
                descriptor,
                &states,
                level,
                HelperKind::Teardown,
                &TEARDOWN_SCOPE_ORDER,
            ),
        };

        Self {
            trial: schedule(Level::Trial),
            iteration: schedule(Level::Iteration),
            invocation: schedule(Level::Invocation),
            states,
            bind_order,
            teardown_order,
        }
    }

    /// The schedule for one level.
    pub fn schedule(&self, level: Level) -> &LevelSchedule {
        match level {
            Level::Trial => &self.trial,
            Level::Iteration => &self.iteration,
            Level::Invocation => &self.invocation,
        }
    }

    /// Trial-setup helper names of one state object, declared order.
    ///
    /// Trial setups run inside the slot initializer rather than as a
    /// standalone block, so they are looked up per state.
    pub fn trial_setups_of(&self, state_index: usize) -> &[String] {
        self.trial
            .setup
            .iter()
            .find(|b| b.state_index == state_index)
            .map(|b| b.helpers.as_slice())
            .unwrap_or(&[])
    }
}

/// What the execution engine consumes for one benchmark.
#[derive(Clone, Debug)]
pub struct ExecutionPlan {
    /// Benchmark id (`owner_type.method_name`).
    pub benchmark_id: String,
    /// Fully qualified owner type.
    pub owner_type: String,
    /// Benchmark method name.
    pub method_name: String,
    /// Declared measurement modes (unexpanded).
    pub modes: std::collections::BTreeSet<Mode>,
    /// Storage layout and hook schedules.
    pub layout: StateLayout,
}

/// Lowercases a type name into an identifier fragment.
pub(crate) fn sanitize(type_name: &str) -> String {
    let mut out = String::with_capacity(type_name.len());
    let mut last_sep = false;
    for c in type_name.chars() {
        if c.is_ascii_alphanumeric() {
            out.extend(c.to_lowercase());
            last_sep = false;
        } else if !last_sep && !out.is_empty() {
            out.push('_');
            last_sep = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

/// Assigns field/local identifiers in declared order and padded type names
/// under the canonical sorted walk.
fn assign_identifiers(descriptor: &BenchmarkDescriptor) -> Vec<StateObject> {
    let mut occurrences: BTreeMap<&str, u32> = BTreeMap::new();
    let mut states: Vec<StateObject> = descriptor
        .params
        .iter()
        .map(|param| {
            let occ = occurrences.entry(param.state_type.as_str()).or_insert(0);
            let san = sanitize(&param.state_type);
            let state = StateObject {
                type_name: param.state_type.clone(),
                padded_type: String::new(),
                scope: param.scope,
                field_ident: format!("f_{san}_{occ}"),
                local_ident: format!("l_{san}_{occ}"),
            };
            *occ += 1;
            state
        })
        .collect();

    // Padded names are handed out in first-encounter order under the sorted
    // walk; repeated original types share one padded type.
    let mut padded: BTreeMap<String, String> = BTreeMap::new();
    let mut counter = 0usize;
    let sorted: Vec<usize> = (0..states.len())
        .sorted_by(|&a, &b| states[a].field_ident.cmp(&states[b].field_ident))
        .collect();
    for index in sorted {
        let name = padded
            .entry(states[index].type_name.clone())
            .or_insert_with(|| {
                let name = format!("Padded{counter}");
                counter += 1;
                name
            })
            .clone();
        states[index].padded_type = name;
    }

    states
}

/// Indices of `states` ordered by the given scope phases, canonical order
/// within each phase.
fn order_by_scope(states: &[StateObject], scopes: &[Scope]) -> Vec<usize> {
    scopes
        .iter()
        .flat_map(|&scope| {
            states
                .iter()
                .enumerate()
                .filter(move |(_, s)| s.scope == scope)
                .sorted_by(|(_, a), (_, b)| a.field_ident.cmp(&b.field_ident))
                .map(|(i, _)| i)
        })
        .collect()
}

fn hook_blocks(
    descriptor: &BenchmarkDescriptor,
    states: &[StateObject],
    level: Level,
    kind: HelperKind,
    scopes: &[Scope],
) -> Vec<HookBlock> {
    order_by_scope(states, scopes)
        .into_iter()
        .filter_map(|state_index| {
            let helpers: Vec<String> = descriptor
                .helpers_of(&states[state_index].type_name, level, kind)
                .iter()
                .map(|h| h.name.clone())
                .collect();
            (!helpers.is_empty()).then_some(HookBlock { state_index, helpers })
        })
        .collect()
}
