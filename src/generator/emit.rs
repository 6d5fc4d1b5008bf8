//! Source-text emission for benchmark stubs.
//!
//! One stub module is emitted per benchmark method. The output is plain
//! source text written through `writeln!` and is byte-stable for a fixed
//! plan: every walk the emitter performs is totally ordered, so repeated
//! generation yields identical bytes. Build-time mode compiles the text
//! alongside user code; the in-memory mode executes the same plan without
//! going through text.
//!
//! Emitted stub structure, per benchmark: padded subtype declarations; one
//! storage slot per state object, keyed by scope; per-level inited flags;
//! a double-checked `try_init_<slot>` that runs Trial setups and publishes
//! the instance; the per-iteration executor with Invocation hooks around
//! the measured call and Iteration hooks around the loop; and the trial
//! teardown entry run once per worker.

use std::fmt::Write;

use crate::descriptor::{HelperKind, Level, Scope};
use crate::generator::layout::{sanitize, ExecutionPlan, StateLayout, StateObject};

/// Emits the stub module for one benchmark.
pub fn emit_stub(plan: &ExecutionPlan) -> anyhow::Result<String> {
    let layout = &plan.layout;
    let mut out = String::new();

    writeln!(out, "// @generated by rmh-stubgen. Do not edit.")?;
    writeln!(out)?;
    writeln!(out, "#[allow(non_upper_case_globals, unused_imports, dead_code)]")?;
    writeln!(out, "pub mod {} {{", module_ident(plan))?;
    writeln!(out, "    use std::collections::BTreeMap;")?;
    writeln!(out, "    use std::sync::Mutex;")?;
    writeln!(out, "    use std::sync::OnceLock;")?;
    writeln!(out, "    use std::sync::atomic::{{AtomicBool, Ordering}};")?;
    writeln!(out)?;
    writeln!(out, "    use rmh::runtime::Loop;")?;
    writeln!(out)?;

    write_padded_types(&mut out, &layout.states)?;

    for index in canonical_order(&layout.states) {
        write_state_storage(&mut out, layout, index)?;
        write_try_init(&mut out, layout, index)?;
        write_gates(&mut out, layout, index)?;
    }

    write_run_iteration(&mut out, plan)?;
    write_finish_trial(&mut out, plan)?;

    writeln!(out, "}}")?;
    Ok(out)
}

/// Module identifier for a benchmark, e.g. `stub_a_b_m1`.
pub fn module_ident(plan: &ExecutionPlan) -> String {
    format!("stub_{}_{}", sanitize(&plan.owner_type), sanitize(&plan.method_name))
}

/// Indices of `states` in canonical (field identifier) order.
fn canonical_order(states: &[StateObject]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..states.len()).collect();
    order.sort_by(|&a, &b| states[a].field_ident.cmp(&states[b].field_ident));
    order
}

/// A dotted type name as a Rust path.
fn rust_path(type_name: &str) -> String {
    type_name.replace('.', "::")
}

/// The storage-slot constant name of a state object.
fn slot_name(state: &StateObject) -> String {
    state.field_ident.to_uppercase()
}

fn helpers_of(layout: &StateLayout, index: usize, level: Level, kind: HelperKind) -> &[String] {
    let schedule = layout.schedule(level);
    let blocks = match kind {
        HelperKind::Setup => &schedule.setup,
        HelperKind::Teardown => &schedule.teardown,
    };
    blocks
        .iter()
        .find(|block| block.state_index == index)
        .map(|block| block.helpers.as_slice())
        .unwrap_or(&[])
}

fn has_iteration_hooks(layout: &StateLayout, index: usize) -> bool {
    !helpers_of(layout, index, Level::Iteration, HelperKind::Setup).is_empty()
        || !helpers_of(layout, index, Level::Iteration, HelperKind::Teardown).is_empty()
}

fn has_trial_teardown(layout: &StateLayout, index: usize) -> bool {
    !helpers_of(layout, index, Level::Trial, HelperKind::Teardown).is_empty()
}

fn write_padded_types(out: &mut String, states: &[StateObject]) -> anyhow::Result<()> {
    // One declaration per distinct original type, canonical order.
    let mut seen = std::collections::BTreeSet::new();
    for index in canonical_order(states) {
        let state = &states[index];
        if !seen.insert(state.type_name.clone()) {
            continue;
        }
        writeln!(out, "    #[repr(align(128))]")?;
        writeln!(
            out,
            "    pub struct {}(pub {});",
            state.padded_type,
            rust_path(&state.type_name)
        )?;
        writeln!(out)?;
    }
    Ok(())
}

fn write_state_storage(out: &mut String, layout: &StateLayout, index: usize) -> anyhow::Result<()> {
    let state = &layout.states[index];
    let slot = slot_name(state);
    let padded = &state.padded_type;

    match state.scope {
        Scope::Benchmark => {
            writeln!(out, "    static {slot}: OnceLock<{padded}> = OnceLock::new();")?;
            writeln!(out, "    static {slot}_GUARD: Mutex<()> = Mutex::new(());")?;
            if has_trial_teardown(layout, index) {
                writeln!(
                    out,
                    "    static {slot}_TRIAL_INITED: AtomicBool = AtomicBool::new(false);"
                )?;
            }
            if has_iteration_hooks(layout, index) {
                writeln!(
                    out,
                    "    static {slot}_ITER_CLAIMED: AtomicBool = AtomicBool::new(false);"
                )?;
                writeln!(
                    out,
                    "    static {slot}_ITER_INITED: AtomicBool = AtomicBool::new(false);"
                )?;
            }
        }
        Scope::Group => {
            writeln!(
                out,
                "    static {slot}: Mutex<BTreeMap<u32, &'static {padded}>> = Mutex::new(BTreeMap::new());"
            )?;
            if has_trial_teardown(layout, index) {
                writeln!(
                    out,
                    "    static {slot}_TRIAL_INITED: Mutex<BTreeMap<u32, bool>> = Mutex::new(BTreeMap::new());"
                )?;
            }
            if has_iteration_hooks(layout, index) {
                writeln!(
                    out,
                    "    static {slot}_ITER_CLAIMED: Mutex<BTreeMap<u32, bool>> = Mutex::new(BTreeMap::new());"
                )?;
                writeln!(
                    out,
                    "    static {slot}_ITER_INITED: Mutex<BTreeMap<u32, bool>> = Mutex::new(BTreeMap::new());"
                )?;
            }
        }
        Scope::Thread => {}
    }
    writeln!(out)?;
    Ok(())
}

fn write_try_init(out: &mut String, layout: &StateLayout, index: usize) -> anyhow::Result<()> {
    let state = &layout.states[index];
    let slot = slot_name(state);
    let padded = &state.padded_type;
    let path = rust_path(&state.type_name);
    let field = &state.field_ident;

    match state.scope {
        Scope::Benchmark => {
            writeln!(out, "    fn try_init_{field}() -> anyhow::Result<&'static {padded}> {{")?;
            writeln!(out, "        if let Some(value) = {slot}.get() {{")?;
            writeln!(out, "            return Ok(value);")?;
            writeln!(out, "        }}")?;
            writeln!(out, "        let _guard = {slot}_GUARD.lock().expect(\"slot guard\");")?;
            writeln!(out, "        if let Some(value) = {slot}.get() {{")?;
            writeln!(out, "            return Ok(value);")?;
            writeln!(out, "        }}")?;
            writeln!(out, "        let candidate = {padded}({path}::default());")?;
            for helper in layout.trial_setups_of(index) {
                writeln!(out, "        candidate.0.{helper}()?;")?;
            }
            writeln!(out, "        let value = {slot}.get_or_init(|| candidate);")?;
            if has_trial_teardown(layout, index) {
                writeln!(out, "        {slot}_TRIAL_INITED.store(true, Ordering::Release);")?;
            }
            writeln!(out, "        Ok(value)")?;
            writeln!(out, "    }}")?;
        }
        Scope::Group => {
            writeln!(
                out,
                "    fn try_init_{field}(group_id: u32) -> anyhow::Result<&'static {padded}> {{"
            )?;
            writeln!(out, "        let mut slots = {slot}.lock().expect(\"slot map\");")?;
            writeln!(out, "        if let Some(value) = slots.get(&group_id) {{")?;
            writeln!(out, "            return Ok(value);")?;
            writeln!(out, "        }}")?;
            writeln!(out, "        let candidate = {padded}({path}::default());")?;
            for helper in layout.trial_setups_of(index) {
                writeln!(out, "        candidate.0.{helper}()?;")?;
            }
            writeln!(out, "        let value: &'static {padded} = Box::leak(Box::new(candidate));")?;
            writeln!(out, "        slots.insert(group_id, value);")?;
            if has_trial_teardown(layout, index) {
                writeln!(
                    out,
                    "        {slot}_TRIAL_INITED.lock().expect(\"flag map\").insert(group_id, true);"
                )?;
            }
            writeln!(out, "        Ok(value)")?;
            writeln!(out, "    }}")?;
        }
        Scope::Thread => {
            writeln!(out, "    fn try_init_{field}() -> anyhow::Result<&'static {padded}> {{")?;
            writeln!(out, "        thread_local! {{")?;
            writeln!(
                out,
                "            static SLOT: std::cell::OnceCell<&'static {padded}> = const {{ std::cell::OnceCell::new() }};"
            )?;
            writeln!(out, "        }}")?;
            writeln!(out, "        SLOT.with(|slot| {{")?;
            writeln!(out, "            if let Some(value) = slot.get() {{")?;
            writeln!(out, "                return Ok(*value);")?;
            writeln!(out, "            }}")?;
            writeln!(out, "            let candidate = {padded}({path}::default());")?;
            for helper in layout.trial_setups_of(index) {
                writeln!(out, "            candidate.0.{helper}()?;")?;
            }
            writeln!(
                out,
                "            let value: &'static {padded} = Box::leak(Box::new(candidate));"
            )?;
            writeln!(out, "            let _ = slot.set(value);")?;
            writeln!(out, "            Ok(value)")?;
            writeln!(out, "        }})")?;
            writeln!(out, "    }}")?;
        }
    }
    writeln!(out)?;
    Ok(())
}

fn write_gates(out: &mut String, layout: &StateLayout, index: usize) -> anyhow::Result<()> {
    let state = &layout.states[index];
    let slot = slot_name(state);
    let field = &state.field_ident;

    match state.scope {
        Scope::Benchmark => {
            if has_iteration_hooks(layout, index) {
                writeln!(out, "    fn claim_iteration_{field}() -> bool {{")?;
                writeln!(out, "        !{slot}_ITER_CLAIMED.swap(true, Ordering::AcqRel)")?;
                writeln!(out, "    }}")?;
                writeln!(out)?;
                writeln!(out, "    fn publish_iteration_{field}() {{")?;
                writeln!(out, "        {slot}_ITER_INITED.store(true, Ordering::Release);")?;
                writeln!(out, "    }}")?;
                writeln!(out)?;
                writeln!(out, "    fn take_iteration_{field}() -> bool {{")?;
                writeln!(out, "        {slot}_ITER_CLAIMED.store(false, Ordering::Release);")?;
                writeln!(out, "        {slot}_ITER_INITED.swap(false, Ordering::AcqRel)")?;
                writeln!(out, "    }}")?;
                writeln!(out)?;
            }
            if has_trial_teardown(layout, index) {
                writeln!(out, "    fn take_trial_{field}() -> bool {{")?;
                writeln!(out, "        {slot}_TRIAL_INITED.swap(false, Ordering::AcqRel)")?;
                writeln!(out, "    }}")?;
                writeln!(out)?;
            }
        }
        Scope::Group => {
            if has_iteration_hooks(layout, index) {
                writeln!(out, "    fn claim_iteration_{field}(group_id: u32) -> bool {{")?;
                writeln!(out, "        let mut claimed = {slot}_ITER_CLAIMED.lock().expect(\"flag map\");")?;
                writeln!(out, "        !std::mem::replace(claimed.entry(group_id).or_insert(false), true)")?;
                writeln!(out, "    }}")?;
                writeln!(out)?;
                writeln!(out, "    fn publish_iteration_{field}(group_id: u32) {{")?;
                writeln!(out, "        {slot}_ITER_INITED.lock().expect(\"flag map\").insert(group_id, true);")?;
                writeln!(out, "    }}")?;
                writeln!(out)?;
                writeln!(out, "    fn take_iteration_{field}(group_id: u32) -> bool {{")?;
                writeln!(out, "        {slot}_ITER_CLAIMED.lock().expect(\"flag map\").insert(group_id, false);")?;
                writeln!(out, "        let mut inited = {slot}_ITER_INITED.lock().expect(\"flag map\");")?;
                writeln!(out, "        std::mem::replace(inited.entry(group_id).or_insert(false), false)")?;
                writeln!(out, "    }}")?;
                writeln!(out)?;
            }
            if has_trial_teardown(layout, index) {
                writeln!(out, "    fn take_trial_{field}(group_id: u32) -> bool {{")?;
                writeln!(out, "        let mut inited = {slot}_TRIAL_INITED.lock().expect(\"flag map\");")?;
                writeln!(out, "        std::mem::replace(inited.entry(group_id).or_insert(false), false)")?;
                writeln!(out, "    }}")?;
                writeln!(out)?;
            }
        }
        Scope::Thread => {}
    }
    Ok(())
}

fn try_init_call(state: &StateObject) -> String {
    match state.scope {
        Scope::Group => format!("try_init_{}(group_id)", state.field_ident),
        _ => format!("try_init_{}()", state.field_ident),
    }
}

fn gate_arg(state: &StateObject) -> &'static str {
    match state.scope {
        Scope::Group => "group_id",
        _ => "",
    }
}

fn write_run_iteration(out: &mut String, plan: &ExecutionPlan) -> anyhow::Result<()> {
    let layout = &plan.layout;
    let has_group = layout.states.iter().any(|s| s.scope == Scope::Group);

    writeln!(out, "    /// One iteration of `{}`: level hooks around the", plan.benchmark_id)?;
    writeln!(out, "    /// measured loop. Thread rendezvous and the measurement window are")?;
    writeln!(out, "    /// driven by the engine through `Loop`.")?;
    writeln!(
        out,
        "    pub fn run_iteration(loop_: &mut Loop<'_>, group_id: u32) -> anyhow::Result<()> {{"
    )?;
    if !has_group {
        writeln!(out, "        let _ = group_id;")?;
    }

    // Local bindings in declared parameter order; Trial setups run inside
    // the slot initializer on first publication.
    for state in &layout.states {
        writeln!(out, "        let {} = {}?;", state.local_ident, try_init_call(state))?;
    }

    write_iteration_hooks(out, layout, HelperKind::Setup)?;

    writeln!(out, "        while !loop_.stop_requested() {{")?;
    for block in &layout.invocation.setup {
        let state = &layout.states[block.state_index];
        for helper in &block.helpers {
            writeln!(out, "            {}.0.{helper}()?;", state.local_ident)?;
        }
    }
    let args: String = layout
        .states
        .iter()
        .map(|s| format!(", &{}.0", s.local_ident))
        .collect();
    writeln!(
        out,
        "            {}::{}(loop_{args})?;",
        rust_path(&plan.owner_type),
        plan.method_name
    )?;
    writeln!(out, "            loop_.count_invocation();")?;
    for block in &layout.invocation.teardown {
        let state = &layout.states[block.state_index];
        for helper in &block.helpers {
            writeln!(out, "            {}.0.{helper}()?;", state.local_ident)?;
        }
    }
    writeln!(out, "        }}")?;

    write_iteration_hooks(out, layout, HelperKind::Teardown)?;

    writeln!(out, "        Ok(())")?;
    writeln!(out, "    }}")?;
    writeln!(out)?;
    Ok(())
}

fn write_iteration_hooks(
    out: &mut String,
    layout: &StateLayout,
    kind: HelperKind,
) -> anyhow::Result<()> {
    let order = match kind {
        HelperKind::Setup => &layout.bind_order,
        HelperKind::Teardown => &layout.teardown_order,
    };
    for &index in order {
        let state = &layout.states[index];
        let helpers = helpers_of(layout, index, Level::Iteration, kind);
        if state.scope == Scope::Thread {
            for helper in helpers {
                writeln!(out, "        {}.0.{helper}()?;", state.local_ident)?;
            }
            continue;
        }
        if !has_iteration_hooks(layout, index) {
            continue;
        }
        let field = &state.field_ident;
        let arg = gate_arg(state);
        match kind {
            HelperKind::Setup => {
                writeln!(out, "        if claim_iteration_{field}({arg}) {{")?;
                for helper in helpers {
                    writeln!(out, "            {}.0.{helper}()?;", state.local_ident)?;
                }
                writeln!(out, "            publish_iteration_{field}({arg});")?;
                writeln!(out, "        }}")?;
            }
            HelperKind::Teardown => {
                writeln!(out, "        if take_iteration_{field}({arg}) {{")?;
                for helper in helpers {
                    writeln!(out, "            {}.0.{helper}()?;", state.local_ident)?;
                }
                writeln!(out, "        }}")?;
            }
        }
    }
    Ok(())
}

fn write_finish_trial(out: &mut String, plan: &ExecutionPlan) -> anyhow::Result<()> {
    let layout = &plan.layout;
    let needs_group = layout
        .teardown_order
        .iter()
        .any(|&i| layout.states[i].scope == Scope::Group && has_trial_teardown(layout, i));

    writeln!(out, "    /// Trial teardown for `{}`; called once per worker,", plan.benchmark_id)?;
    writeln!(out, "    /// shared blocks run in exactly one of them.")?;
    writeln!(out, "    pub fn finish_trial(group_id: u32) -> anyhow::Result<()> {{")?;
    if !needs_group {
        writeln!(out, "        let _ = group_id;")?;
    }

    for &index in &layout.teardown_order {
        let state = &layout.states[index];
        let helpers = helpers_of(layout, index, Level::Trial, HelperKind::Teardown);
        if helpers.is_empty() {
            continue;
        }
        let slot = slot_name(state);
        let field = &state.field_ident;
        match state.scope {
            Scope::Thread => {
                writeln!(out, "        let {} = {}?;", state.local_ident, try_init_call(state))?;
                for helper in helpers {
                    writeln!(out, "        {}.0.{helper}()?;", state.local_ident)?;
                }
            }
            Scope::Benchmark => {
                writeln!(out, "        if take_trial_{field}() {{")?;
                writeln!(out, "            if let Some(value) = {slot}.get() {{")?;
                for helper in helpers {
                    writeln!(out, "                value.0.{helper}()?;")?;
                }
                writeln!(out, "            }}")?;
                writeln!(out, "        }}")?;
            }
            Scope::Group => {
                writeln!(out, "        if take_trial_{field}(group_id) {{")?;
                writeln!(
                    out,
                    "            if let Some(value) = {slot}.lock().expect(\"slot map\").get(&group_id) {{"
                )?;
                for helper in helpers {
                    writeln!(out, "                value.0.{helper}()?;")?;
                }
                writeln!(out, "            }}")?;
                writeln!(out, "        }}")?;
            }
        }
    }

    writeln!(out, "        Ok(())")?;
    writeln!(out, "    }}")?;
    Ok(())
}
