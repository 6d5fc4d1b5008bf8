//! In-memory stub linkage and execution.
//!
//! Build-time mode compiles emitted source; run-time mode links an
//! [`ExecutionPlan`] against closures supplied through [`StubBindings`] and
//! executes it directly. Both forms share one contract: the plan dictates
//! state binding, hook ordering and guards; the bindings supply the user's
//! factories, helpers and the benchmark body.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::anyhow;

use crate::descriptor::{HelperKind, Level, Mode};
use crate::error::{LinkError, RunError};
use crate::generator::layout::{ExecutionPlan, StateLayout};
use crate::output::OutputFormat;
use crate::profiler::ProfilerHook;
use crate::report::IterationData;
use crate::runtime::config::BenchmarkConfig;
use crate::runtime::control::Loop;
use crate::runtime::registry::StateHandle;
use crate::runtime::runner::ThreadGroupRunner;

/// Constructs one state instance.
pub type FactoryFn = Arc<dyn Fn() -> anyhow::Result<StateHandle> + Send + Sync>;

/// Runs one helper method against a state instance.
pub type HelperFn = Arc<dyn Fn(&StateHandle) -> anyhow::Result<()> + Send + Sync>;

/// The benchmark body: one invocation of the measured work.
pub type BodyFn =
    Arc<dyn Fn(&mut Loop<'_>, &StateSet<'_>) -> anyhow::Result<()> + Send + Sync>;

/// The state instances bound to one worker, in declared parameter order.
pub struct StateSet<'a> {
    handles: &'a [StateHandle],
}

impl<'a> StateSet<'a> {
    pub(crate) fn new(handles: &'a [StateHandle]) -> Self {
        Self { handles }
    }

    /// Borrows the state parameter at `index` as `T`.
    pub fn get<T: Send + Sync + 'static>(&self, index: usize) -> anyhow::Result<&T> {
        let handle = self
            .handles
            .get(index)
            .ok_or_else(|| anyhow!("no state parameter at position {index}"))?;
        handle.downcast_ref::<T>().ok_or_else(|| {
            anyhow!("state parameter {index} is not a `{}`", std::any::type_name::<T>())
        })
    }

    /// The raw handle at `index`.
    pub fn handle(&self, index: usize) -> Option<&StateHandle> {
        self.handles.get(index)
    }

    /// Number of bound state parameters.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// True when the benchmark binds no states.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

#[derive(Default)]
struct StateBinding {
    factory: Option<FactoryFn>,
    helpers: HashMap<String, HelperFn>,
}

/// Runtime closures for a benchmark: one body, plus a factory and named
/// helpers per state type.
pub struct StubBindings {
    body: BodyFn,
    states: HashMap<String, StateBinding>,
}

impl StubBindings {
    /// Creates bindings around the benchmark body.
    pub fn new(
        body: impl Fn(&mut Loop<'_>, &StateSet<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self { body: Arc::new(body), states: HashMap::new() }
    }

    /// Registers the factory of a state type.
    pub fn state<T, F>(mut self, state_type: &str, factory: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn() -> anyhow::Result<T> + Send + Sync + 'static,
    {
        let entry = self.states.entry(state_type.to_string()).or_default();
        entry.factory = Some(Arc::new(move || factory().map(StateHandle::new)));
        self
    }

    /// Registers a helper method of a state type.
    pub fn helper<T, F>(mut self, state_type: &str, helper: &str, f: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let name = helper.to_string();
        let wrapped: HelperFn = {
            let name = name.clone();
            Arc::new(move |handle: &StateHandle| {
                let state = handle
                    .downcast_ref::<T>()
                    .ok_or_else(|| anyhow!("helper `{name}` bound for a different state type"))?;
                f(state)
            })
        };
        self.states.entry(state_type.to_string()).or_default().helpers.insert(name, wrapped);
        self
    }
}

pub(crate) struct NamedHelper {
    pub name: String,
    pub run: HelperFn,
}

/// One state object's resolved closures.
pub(crate) struct LinkedState {
    pub factory: FactoryFn,
    hooks: BTreeMap<(Level, HelperKind), Vec<NamedHelper>>,
}

impl LinkedState {
    pub fn hooks(&self, level: Level, kind: HelperKind) -> &[NamedHelper] {
        self.hooks.get(&(level, kind)).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

/// A fully linked stub, shared with every worker thread.
pub(crate) struct LinkedStub {
    pub plan: ExecutionPlan,
    pub body: BodyFn,
    /// Parallel to `plan.layout.states`.
    pub states: Vec<LinkedState>,
}

fn helper_names(
    layout: &StateLayout,
    index: usize,
    level: Level,
    kind: HelperKind,
) -> &[String] {
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

/// An executable benchmark stub.
pub struct CompiledStub {
    inner: Arc<LinkedStub>,
}

impl CompiledStub {
    /// Links a plan against runtime bindings. Fails when a state type named
    /// by the plan has no factory or a scheduled helper has no closure.
    pub fn link(plan: ExecutionPlan, bindings: StubBindings) -> Result<CompiledStub, LinkError> {
        let mut states = Vec::with_capacity(plan.layout.states.len());
        for (index, state) in plan.layout.states.iter().enumerate() {
            let binding = bindings
                .states
                .get(&state.type_name)
                .ok_or_else(|| LinkError::MissingState(state.type_name.clone()))?;
            let factory = binding
                .factory
                .clone()
                .ok_or_else(|| LinkError::MissingState(state.type_name.clone()))?;

            let mut hooks = BTreeMap::new();
            for level in [Level::Trial, Level::Iteration, Level::Invocation] {
                for kind in [HelperKind::Setup, HelperKind::Teardown] {
                    let mut resolved = Vec::new();
                    for name in helper_names(&plan.layout, index, level, kind) {
                        let run = binding.helpers.get(name).cloned().ok_or_else(|| {
                            LinkError::MissingHelper {
                                state_type: state.type_name.clone(),
                                helper: name.clone(),
                            }
                        })?;
                        resolved.push(NamedHelper { name: name.clone(), run });
                    }
                    if !resolved.is_empty() {
                        hooks.insert((level, kind), resolved);
                    }
                }
            }
            states.push(LinkedState { factory, hooks });
        }

        Ok(CompiledStub {
            inner: Arc::new(LinkedStub { plan, body: bindings.body, states }),
        })
    }

    /// The benchmark id this stub executes.
    pub fn benchmark_id(&self) -> &str {
        &self.inner.plan.benchmark_id
    }

    /// The underlying plan.
    pub fn plan(&self) -> &ExecutionPlan {
        &self.inner.plan
    }

    /// Runs every selected mode, emitting iteration results to `output` and
    /// returning the measurement iterations in order.
    ///
    /// The modes run are the intersection of the benchmark's declared modes
    /// and the configured ones (configured-empty means all declared).
    pub fn run(
        &self,
        config: &BenchmarkConfig,
        output: &mut dyn OutputFormat,
        profilers: &mut [Box<dyn ProfilerHook>],
    ) -> Result<Vec<IterationData>, RunError> {
        config.validate()?;

        let declared = Mode::expand(&self.inner.plan.modes);
        let requested = if config.modes.is_empty() {
            declared.clone()
        } else {
            Mode::expand(&config.modes)
        };

        let mut measurements = Vec::new();
        for &mode in declared.intersection(&requested) {
            output.verbose_print(&format!("# {}: {mode} mode", self.benchmark_id()));
            let runner = ThreadGroupRunner::new(self.inner.clone(), config.clone(), mode);
            measurements.extend(runner.run(output, profilers)?);
        }
        Ok(measurements)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeSet, HashSet};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use crate::descriptor::{
        BenchmarkDescriptor, HelperKind, HelperMethod, Level, Scope, StateTypeInfo,
    };
    use crate::generator::StubGenerator;
    use crate::output::SilentOutput;
    use crate::report::IterationStatus;

    fn config(threads: u32, warmup: u32, measurement: u32) -> BenchmarkConfig {
        BenchmarkConfig {
            max_threads: threads,
            warmup_iterations: warmup,
            measurement_iterations: measurement,
            iteration_time: Duration::from_millis(10),
            shutdown_wait: Duration::from_secs(1),
            ..Default::default()
        }
    }

    fn compile(descriptor: &BenchmarkDescriptor, bindings: StubBindings) -> CompiledStub {
        let stub = StubGenerator::new().generate(descriptor).unwrap();
        CompiledStub::link(stub.plan, bindings).unwrap()
    }

    /// Counters shared with the closures of one test benchmark.
    #[derive(Default)]
    struct Probe {
        constructs: AtomicU32,
        trial_setups: AtomicU32,
        trial_teardowns: AtomicU32,
        iter_setups: AtomicU32,
        iter_teardowns: AtomicU32,
    }

    struct CounterState {
        probe: Arc<Probe>,
    }

    fn counter_descriptor(scope: Scope) -> BenchmarkDescriptor {
        BenchmarkDescriptor::new("bench.Counters", "count").with_param(
            "bench.CounterState",
            scope,
            StateTypeInfo::state(vec![
                HelperMethod::new("before_run", Level::Trial, HelperKind::Setup),
                HelperMethod::new("before_iter", Level::Iteration, HelperKind::Setup),
                HelperMethod::new("after_iter", Level::Iteration, HelperKind::Teardown),
                HelperMethod::new("after_run", Level::Trial, HelperKind::Teardown),
            ]),
        )
    }

    fn counter_bindings(probe: &Arc<Probe>) -> StubBindings {
        let p = probe.clone();
        let bindings = StubBindings::new(|_lp, states| {
            let _state: &CounterState = states.get(0)?;
            Ok(())
        })
        .state("bench.CounterState", move || {
            p.constructs.fetch_add(1, Ordering::SeqCst);
            Ok(CounterState { probe: p.clone() })
        });

        bindings
            .helper("bench.CounterState", "before_run", |s: &CounterState| {
                s.probe.trial_setups.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .helper("bench.CounterState", "before_iter", |s: &CounterState| {
                s.probe.iter_setups.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .helper("bench.CounterState", "after_iter", |s: &CounterState| {
                s.probe.iter_teardowns.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .helper("bench.CounterState", "after_run", |s: &CounterState| {
                s.probe.trial_teardowns.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
    }

    #[test]
    fn iteration_count_is_honored_with_zero_warmup() {
        // One measurement iteration, no warmup: the iteration-level setup
        // runs once, trial hooks still run.
        let probe = Arc::new(Probe::default());
        let stub = compile(&counter_descriptor(Scope::Benchmark), counter_bindings(&probe));

        let result = stub.run(&config(1, 0, 1), &mut SilentOutput, &mut []).unwrap();

        assert_eq!(result.len(), 1);
        assert!(result[0].status.is_ok());
        assert!(!result[0].warmup);
        assert_eq!(probe.iter_setups.load(Ordering::SeqCst), 1);
        assert_eq!(probe.iter_teardowns.load(Ordering::SeqCst), 1);
        assert_eq!(probe.trial_setups.load(Ordering::SeqCst), 1);
        assert_eq!(probe.trial_teardowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn warmup_iterations_run_hooks_but_are_excluded_from_results() {
        let probe = Arc::new(Probe::default());
        let stub = compile(&counter_descriptor(Scope::Benchmark), counter_bindings(&probe));

        let result = stub.run(&config(1, 2, 3), &mut SilentOutput, &mut []).unwrap();

        assert_eq!(result.len(), 3);
        assert!(result.iter().all(|d| !d.warmup));
        assert_eq!(probe.iter_setups.load(Ordering::SeqCst), 5);
        assert_eq!(probe.iter_teardowns.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn benchmark_scope_shares_one_instance_across_workers() {
        // Four workers racing on one benchmark-scoped slot: one construct,
        // hooks exactly once per cycle, one shared identity.
        let probe = Arc::new(Probe::default());
        let identities: Arc<parking_lot::Mutex<HashSet<usize>>> = Arc::default();

        let p = probe.clone();
        let ids = identities.clone();
        let bindings = StubBindings::new(move |_lp, states| {
            let state: &CounterState = states.get(0)?;
            ids.lock().insert(state as *const CounterState as usize);
            Ok(())
        })
        .state("bench.CounterState", move || {
            p.constructs.fetch_add(1, Ordering::SeqCst);
            Ok(CounterState { probe: p.clone() })
        })
        .helper("bench.CounterState", "before_run", |s: &CounterState| {
            s.probe.trial_setups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .helper("bench.CounterState", "before_iter", |s: &CounterState| {
            s.probe.iter_setups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .helper("bench.CounterState", "after_iter", |s: &CounterState| {
            s.probe.iter_teardowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .helper("bench.CounterState", "after_run", |s: &CounterState| {
            s.probe.trial_teardowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let stub = compile(&counter_descriptor(Scope::Benchmark), bindings);
        let result = stub.run(&config(4, 0, 2), &mut SilentOutput, &mut []).unwrap();

        assert_eq!(result.len(), 2);
        assert_eq!(probe.constructs.load(Ordering::SeqCst), 1);
        assert_eq!(identities.lock().len(), 1);
        // Shared-scope hooks run exactly once per cycle despite 4 workers.
        assert_eq!(probe.trial_setups.load(Ordering::SeqCst), 1);
        assert_eq!(probe.iter_setups.load(Ordering::SeqCst), 2);
        assert_eq!(probe.iter_teardowns.load(Ordering::SeqCst), 2);
        assert_eq!(probe.trial_teardowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn group_scope_partitions_workers_into_groups() {
        // thread_groups = [2, 2]: two instances, each shared by exactly the
        // two threads of its group.
        let constructs = Arc::new(AtomicU32::new(0));
        let sightings: Arc<parking_lot::Mutex<HashSet<(String, usize)>>> = Arc::default();

        struct GroupState;

        let c = constructs.clone();
        let seen = sightings.clone();
        let bindings = StubBindings::new(move |_lp, states| {
            let state: &GroupState = states.get(0)?;
            let thread = format!("{:?}", std::thread::current().id());
            seen.lock().insert((thread, state as *const GroupState as usize));
            Ok(())
        })
        .state("bench.GroupState", move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(GroupState)
        });

        let descriptor = BenchmarkDescriptor::new("bench.Groups", "grouped").with_param(
            "bench.GroupState",
            Scope::Group,
            StateTypeInfo::state(Vec::new()),
        );
        let stub = compile(&descriptor, bindings);

        let cfg = BenchmarkConfig {
            max_threads: 4,
            thread_groups: vec![2, 2],
            ..config(4, 0, 1)
        };
        stub.run(&cfg, &mut SilentOutput, &mut []).unwrap();

        assert_eq!(constructs.load(Ordering::SeqCst), 2);

        let sightings = sightings.lock();
        let instances: HashSet<usize> = sightings.iter().map(|(_, addr)| *addr).collect();
        assert_eq!(instances.len(), 2);
        for instance in instances {
            let threads: HashSet<&String> = sightings
                .iter()
                .filter(|(_, addr)| *addr == instance)
                .map(|(thread, _)| thread)
                .collect();
            assert_eq!(threads.len(), 2, "each instance is shared by one group of two");
        }
    }

    #[test]
    fn thread_scope_gives_each_worker_its_own_instance() {
        let constructs = Arc::new(AtomicU32::new(0));

        struct LocalState;

        let c = constructs.clone();
        let bindings = StubBindings::new(|_lp, states| {
            let _: &LocalState = states.get(0)?;
            Ok(())
        })
        .state("bench.LocalState", move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(LocalState)
        });

        let descriptor = BenchmarkDescriptor::new("bench.Locals", "local").with_param(
            "bench.LocalState",
            Scope::Thread,
            StateTypeInfo::state(Vec::new()),
        );
        let stub = compile(&descriptor, bindings);

        stub.run(&config(3, 0, 2), &mut SilentOutput, &mut []).unwrap();
        assert_eq!(constructs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn failing_body_marks_iteration_failed_but_teardown_still_runs() {
        // The body fails during iteration 2 of 3; with fail_on_error unset
        // the run continues and every teardown still fires.
        let probe = Arc::new(Probe::default());
        let iteration = Arc::new(AtomicU32::new(0));

        let p = probe.clone();
        let it = iteration.clone();
        let bindings = StubBindings::new(move |_lp, states| {
            let _: &CounterState = states.get(0)?;
            if it.load(Ordering::SeqCst) == 2 {
                anyhow::bail!("synthetic failure");
            }
            Ok(())
        })
        .state("bench.CounterState", {
            let p = p.clone();
            move || Ok(CounterState { probe: p.clone() })
        })
        .helper("bench.CounterState", "before_run", |_: &CounterState| Ok(()))
        .helper("bench.CounterState", "before_iter", {
            let p = p.clone();
            let it = iteration.clone();
            move |_: &CounterState| {
                it.fetch_add(1, Ordering::SeqCst);
                p.iter_setups.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .helper("bench.CounterState", "after_iter", {
            let p = p.clone();
            move |_: &CounterState| {
                p.iter_teardowns.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .helper("bench.CounterState", "after_run", {
            let p = p.clone();
            move |_: &CounterState| {
                p.trial_teardowns.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let stub = compile(&counter_descriptor(Scope::Benchmark), bindings);
        let result = stub.run(&config(1, 0, 3), &mut SilentOutput, &mut []).unwrap();

        let statuses: Vec<bool> = result.iter().map(|d| d.status.is_ok()).collect();
        assert_eq!(statuses, [true, false, true]);
        assert!(matches!(result[1].status, IterationStatus::Failed(_)));
        assert_eq!(probe.iter_teardowns.load(Ordering::SeqCst), 3);
        assert_eq!(probe.trial_teardowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fail_on_error_aborts_after_the_failed_iteration() {
        let probe = Arc::new(Probe::default());
        let invocations = Arc::new(AtomicU32::new(0));

        let inv = invocations.clone();
        let bindings = StubBindings::new(move |_lp, states| {
            let _: &CounterState = states.get(0)?;
            if inv.fetch_add(1, Ordering::SeqCst) >= 4 {
                anyhow::bail!("stop here");
            }
            Ok(())
        })
        .state("bench.CounterState", {
            let p = probe.clone();
            move || Ok(CounterState { probe: p.clone() })
        })
        .helper("bench.CounterState", "before_run", |_: &CounterState| Ok(()))
        .helper("bench.CounterState", "before_iter", |_: &CounterState| Ok(()))
        .helper("bench.CounterState", "after_iter", |_: &CounterState| Ok(()))
        .helper("bench.CounterState", "after_run", {
            let p = probe.clone();
            move |_: &CounterState| {
                p.trial_teardowns.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let stub = compile(&counter_descriptor(Scope::Benchmark), bindings);
        let cfg = BenchmarkConfig { fail_on_error: true, ..config(1, 0, 5) };
        let err = stub.run(&cfg, &mut SilentOutput, &mut []).unwrap_err();

        assert!(matches!(err, RunError::IterationFailed { .. }));
        // Trial teardown still ran on the way out.
        assert_eq!(probe.trial_teardowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn trial_setup_failure_is_fatal_and_produces_no_iterations() {
        let iter_setups = Arc::new(AtomicU32::new(0));

        let bindings = StubBindings::new(|_lp, states| {
            let _: &CounterState = states.get(0)?;
            Ok(())
        })
        .state("bench.CounterState", || -> anyhow::Result<CounterState> {
            anyhow::bail!("cannot construct")
        })
        .helper("bench.CounterState", "before_run", |_: &CounterState| Ok(()))
        .helper("bench.CounterState", "before_iter", {
            let n = iter_setups.clone();
            move |_: &CounterState| {
                n.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .helper("bench.CounterState", "after_iter", |_: &CounterState| Ok(()))
        .helper("bench.CounterState", "after_run", |_: &CounterState| Ok(()));

        let stub = compile(&counter_descriptor(Scope::Benchmark), bindings);
        let err = stub.run(&config(2, 1, 2), &mut SilentOutput, &mut []).unwrap_err();

        assert!(matches!(err, RunError::TrialSetupFailed(_)));
        assert_eq!(iter_setups.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn single_shot_runs_exactly_the_batch() {
        let mut descriptor = BenchmarkDescriptor::new("bench.Shots", "shot");
        descriptor.modes = BTreeSet::from([Mode::SingleShotTime]);
        let stub = compile(&descriptor, StubBindings::new(|_lp, _states| Ok(())));

        let cfg = BenchmarkConfig { batch_size: 5, ..config(1, 0, 1) };
        let result = stub.run(&cfg, &mut SilentOutput, &mut []).unwrap();

        assert_eq!(result.len(), 1);
        assert_eq!(result[0].mode, Mode::SingleShotTime);
        assert_eq!(result[0].total_ops(), 5);
    }

    #[test]
    fn sample_mode_attaches_latency_summaries() {
        let mut descriptor = BenchmarkDescriptor::new("bench.Samples", "sampled");
        descriptor.modes = BTreeSet::from([Mode::SampleTime]);
        let stub = compile(&descriptor, StubBindings::new(|_lp, _states| Ok(())));

        let result = stub.run(&config(2, 0, 1), &mut SilentOutput, &mut []).unwrap();

        assert_eq!(result.len(), 1);
        let samples = result[0].samples.as_ref().expect("sample summary");
        assert!(samples.count > 0);
        assert!(samples.max >= samples.p50);
    }

    #[test]
    fn disjoint_mode_selection_runs_nothing() {
        let stub = compile(
            &BenchmarkDescriptor::new("bench.Plain", "noop"),
            StubBindings::new(|_lp, _states| Ok(())),
        );
        let cfg = BenchmarkConfig {
            modes: BTreeSet::from([Mode::SingleShotTime]),
            ..config(1, 0, 1)
        };
        assert!(stub.run(&cfg, &mut SilentOutput, &mut []).unwrap().is_empty());
    }

    #[test]
    fn observable_hook_sequence_follows_scope_phase_order() {
        // Single worker, single-shot batch of one: the full observable
        // sequence is thread setups, then benchmark setups, one guarded
        // invocation, and teardowns in the reverse scope order.
        let events: Arc<parking_lot::Mutex<Vec<&'static str>>> = Arc::default();

        struct SharedState;
        struct LocalState;

        // Benchmark-scoped parameter declared first; binding still runs
        // thread-scoped state ahead of it.
        let mut descriptor = BenchmarkDescriptor::new("bench.Order", "run")
            .with_param(
                "bench.SharedState",
                Scope::Benchmark,
                StateTypeInfo::state(vec![
                    HelperMethod::new("b_trial_up", Level::Trial, HelperKind::Setup),
                    HelperMethod::new("b_iter_up", Level::Iteration, HelperKind::Setup),
                    HelperMethod::new("b_inv_up", Level::Invocation, HelperKind::Setup),
                    HelperMethod::new("b_inv_down", Level::Invocation, HelperKind::Teardown),
                    HelperMethod::new("b_iter_down", Level::Iteration, HelperKind::Teardown),
                    HelperMethod::new("b_trial_down", Level::Trial, HelperKind::Teardown),
                ]),
            )
            .with_param(
                "bench.LocalState",
                Scope::Thread,
                StateTypeInfo::state(vec![
                    HelperMethod::new("t_trial_up", Level::Trial, HelperKind::Setup),
                    HelperMethod::new("t_iter_up", Level::Iteration, HelperKind::Setup),
                    HelperMethod::new("t_inv_up", Level::Invocation, HelperKind::Setup),
                    HelperMethod::new("t_inv_down", Level::Invocation, HelperKind::Teardown),
                    HelperMethod::new("t_iter_down", Level::Iteration, HelperKind::Teardown),
                    HelperMethod::new("t_trial_down", Level::Trial, HelperKind::Teardown),
                ]),
            );
        descriptor.modes = BTreeSet::from([Mode::SingleShotTime]);

        let log = |events: &Arc<parking_lot::Mutex<Vec<&'static str>>>, label: &'static str| {
            let events = events.clone();
            move |_: &SharedState| {
                events.lock().push(label);
                Ok(())
            }
        };
        let log_t = |events: &Arc<parking_lot::Mutex<Vec<&'static str>>>, label: &'static str| {
            let events = events.clone();
            move |_: &LocalState| {
                events.lock().push(label);
                Ok(())
            }
        };

        let body_events = events.clone();
        let bindings = StubBindings::new(move |_lp, _states| {
            body_events.lock().push("body");
            Ok(())
        })
        .state("bench.SharedState", || Ok(SharedState))
        .state("bench.LocalState", || Ok(LocalState))
        .helper("bench.SharedState", "b_trial_up", log(&events, "b_trial_up"))
        .helper("bench.SharedState", "b_iter_up", log(&events, "b_iter_up"))
        .helper("bench.SharedState", "b_inv_up", log(&events, "b_inv_up"))
        .helper("bench.SharedState", "b_inv_down", log(&events, "b_inv_down"))
        .helper("bench.SharedState", "b_iter_down", log(&events, "b_iter_down"))
        .helper("bench.SharedState", "b_trial_down", log(&events, "b_trial_down"))
        .helper("bench.LocalState", "t_trial_up", log_t(&events, "t_trial_up"))
        .helper("bench.LocalState", "t_iter_up", log_t(&events, "t_iter_up"))
        .helper("bench.LocalState", "t_inv_up", log_t(&events, "t_inv_up"))
        .helper("bench.LocalState", "t_inv_down", log_t(&events, "t_inv_down"))
        .helper("bench.LocalState", "t_iter_down", log_t(&events, "t_iter_down"))
        .helper("bench.LocalState", "t_trial_down", log_t(&events, "t_trial_down"));

        let stub = compile(&descriptor, bindings);
        stub.run(&config(1, 0, 1), &mut SilentOutput, &mut []).unwrap();

        assert_eq!(
            *events.lock(),
            [
                "t_trial_up", "b_trial_up",
                "t_iter_up", "b_iter_up",
                "t_inv_up", "b_inv_up",
                "body",
                "b_inv_down", "t_inv_down",
                "b_iter_down", "t_iter_down",
                "b_trial_down", "t_trial_down",
            ]
        );
    }

    #[test]
    fn profiler_results_attach_and_failures_are_swallowed() {
        use crate::profiler::{ProfilerHook, ProfilerResult};

        struct FixedProfiler {
            fail: bool,
        }

        impl ProfilerHook for FixedProfiler {
            fn label(&self) -> &str {
                "fixed"
            }
            fn start_profile(&mut self) -> anyhow::Result<()> {
                Ok(())
            }
            fn end_profile(&mut self) -> anyhow::Result<ProfilerResult> {
                if self.fail {
                    anyhow::bail!("probe unavailable");
                }
                Ok(ProfilerResult {
                    profiler: "fixed".into(),
                    value: serde_json::json!({ "cycles": 42 }),
                })
            }
        }

        let stub = compile(
            &BenchmarkDescriptor::new("bench.Profiled", "noop"),
            StubBindings::new(|_lp, _states| Ok(())),
        );
        let mut profilers: Vec<Box<dyn ProfilerHook>> =
            vec![Box::new(FixedProfiler { fail: false }), Box::new(FixedProfiler { fail: true })];

        let result = stub
            .run(&config(1, 0, 1), &mut SilentOutput, &mut profilers)
            .unwrap();

        // The failing profiler is logged and dropped; the iteration is
        // still Ok and carries the surviving result.
        assert!(result[0].status.is_ok());
        assert_eq!(result[0].profiler_results.len(), 1);
        assert_eq!(result[0].profiler_results[0].value["cycles"], 42);
    }

    #[test]
    fn linking_rejects_missing_factories_and_helpers() {
        let descriptor = counter_descriptor(Scope::Benchmark);
        let plan = StubGenerator::new().generate(&descriptor).unwrap().plan;
        let err = CompiledStub::link(plan, StubBindings::new(|_lp, _s| Ok(())));
        assert!(matches!(err, Err(LinkError::MissingState(_))));

        let plan = StubGenerator::new().generate(&descriptor).unwrap().plan;
        let partial = StubBindings::new(|_lp, _s| Ok(()))
            .state("bench.CounterState", || Ok(CounterState { probe: Arc::default() }));
        let err = CompiledStub::link(plan, partial);
        assert!(matches!(err, Err(LinkError::MissingHelper { .. })));
    }
}
