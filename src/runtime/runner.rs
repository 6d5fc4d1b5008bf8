//! Worker scheduling: barriers, state binding and the measured loop.
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use log::{error, warn};
use parking_lot::{Condvar, Mutex};

use crate::descriptor::{HelperKind, Level, Mode};
use crate::error::RunError;
use crate::histogram::SampleHistogram;
use crate::output::OutputFormat;
use crate::profiler::ProfilerHook;
use crate::report::IterationData;
use crate::runtime::config::BenchmarkConfig;
use crate::runtime::control::{CancelToken, Control, Loop};
use crate::runtime::coordinator;
use crate::runtime::executor::{WorkerPool, WorkerTask};
use crate::runtime::registry::{Slot, StateHandle, StateRegistry};
use crate::stub::{LinkedStub, StateSet};

/// Bounded number of logged waits at one rendezvous before the run is
/// declared dead.
pub(crate) const MAX_RENDEZVOUS_WAITS: u32 = 30;

#[derive(Default)]
struct RendezvousState {
    arrived: u32,
    generation: u64,
}

/// A reusable rendezvous point between the workers and the coordinator.
///
/// Workers arrive and block; the coordinator waits for full arrival (with
/// bounded, logged waits so a worker stuck in user code cannot hang the run
/// silently), performs its between-phases work, then releases everyone.
pub(crate) struct Rendezvous {
    parties: u32,
    state: Mutex<RendezvousState>,
    cv: Condvar,
}

impl Rendezvous {
    pub fn new(parties: u32) -> Self {
        Self { parties, state: Mutex::new(RendezvousState::default()), cv: Condvar::new() }
    }

    /// Worker side: register arrival and block until the coordinator
    /// releases this generation.
    pub fn arrive_and_wait(&self) {
        let mut state = self.state.lock();
        state.arrived += 1;
        if state.arrived == self.parties {
            self.cv.notify_all();
        }
        let generation = state.generation;
        while state.generation == generation {
            self.cv.wait(&mut state);
        }
    }

    /// Coordinator side: wait until every worker arrived. Each `wait`
    /// timeout logs a warning; exhausting the retry budget is fatal.
    pub fn await_arrivals(&self, wait: Duration) -> Result<(), RunError> {
        let mut state = self.state.lock();
        let mut waits = 0u32;
        while state.arrived < self.parties {
            if self.cv.wait_for(&mut state, wait).timed_out() && state.arrived < self.parties {
                waits += 1;
                warn!(
                    "waiting for {} of {} workers for {wait:?}; retrying",
                    self.parties - state.arrived,
                    self.parties
                );
                if waits >= MAX_RENDEZVOUS_WAITS {
                    return Err(RunError::ShutdownTimeout { waited: wait * waits });
                }
            }
        }
        Ok(())
    }

    /// Coordinator side: release every arrived worker and reset for reuse.
    pub fn release(&self) {
        let mut state = self.state.lock();
        state.arrived = 0;
        state.generation += 1;
        self.cv.notify_all();
    }
}

/// State shared between the coordinator and the workers of one mode-run.
pub(crate) struct RunnerShared {
    pub stub: Arc<LinkedStub>,
    pub config: BenchmarkConfig,
    pub mode: Mode,
    pub control: Control,
    pub cancel: CancelToken,
    pub registry: StateRegistry,
    /// Pre-loop rendezvous: workers bound their states (Trial setups ran).
    pub ready: Rendezvous,
    /// Delimits the start of the measured region.
    pub start: Rendezvous,
    /// Delimits the end of the measured region.
    pub end: Rendezvous,
    /// Workers finished iteration teardown.
    pub sync: Rendezvous,
    /// Per-worker operation counts, written before the end rendezvous.
    pub ops: Vec<AtomicU64>,
    /// Per-worker invocation latencies, allocated in sample-time mode.
    pub samples: Option<Vec<Mutex<SampleHistogram>>>,
    /// Errors recorded by workers during the current iteration.
    pub errors: Mutex<Vec<String>>,
    /// First Trial-setup failure; fatal for the benchmark.
    pub fatal: Mutex<Option<String>>,
}

/// Owns the executor, the [`Control`] flag and the rendezvous points that
/// delimit the measured region for one mode-run.
pub struct ThreadGroupRunner {
    shared: Arc<RunnerShared>,
}

impl ThreadGroupRunner {
    pub(crate) fn new(stub: Arc<LinkedStub>, config: BenchmarkConfig, mode: Mode) -> Self {
        let workers = config.active_threads();
        let samples = (mode == Mode::SampleTime)
            .then(|| (0..workers).map(|_| Mutex::new(SampleHistogram::new())).collect());
        let shared = RunnerShared {
            stub,
            mode,
            control: Control::new(),
            cancel: CancelToken::new(),
            registry: StateRegistry::new(),
            ready: Rendezvous::new(workers),
            start: Rendezvous::new(workers),
            end: Rendezvous::new(workers),
            sync: Rendezvous::new(workers),
            ops: (0..workers).map(|_| AtomicU64::new(0)).collect(),
            samples,
            errors: Mutex::new(Vec::new()),
            fatal: Mutex::new(None),
            config,
        };
        Self { shared: Arc::new(shared) }
    }

    /// Token cancelling the run: mid-iteration it ends the measured region
    /// early, between iterations it abandons the remaining ones. Trial
    /// teardown still runs.
    pub fn cancel_token(&self) -> CancelToken {
        self.shared.cancel.clone()
    }

    /// Launches the workers, drives all iterations and shuts the pool down.
    pub fn run(
        self,
        output: &mut dyn OutputFormat,
        profilers: &mut [Box<dyn ProfilerHook>],
    ) -> Result<Vec<IterationData>, RunError> {
        let workers = self.shared.config.active_threads();
        let tasks: Vec<WorkerTask> = (0..workers)
            .map(|worker_id| {
                let shared = self.shared.clone();
                Box::new(move || worker_main(&shared, worker_id)) as WorkerTask
            })
            .collect();

        let pool = WorkerPool::launch(self.shared.config.executor, tasks)?;
        let result = coordinator::run_iterations(&self.shared, output, profilers);
        let shutdown = pool.shutdown(self.shared.config.shutdown_wait);

        let iterations = result?;
        shutdown?;
        Ok(iterations)
    }
}

/// One state parameter bound to its instance (and, for shared scopes, its
/// guarded slot).
struct BoundState {
    handle: StateHandle,
    slot: Option<Arc<Mutex<Slot>>>,
}

struct Bound {
    /// Parallel to the plan's state list (declared parameter order).
    states: Vec<BoundState>,
    /// Instances in declared parameter order, for the body call.
    handles: Vec<StateHandle>,
}

pub(crate) fn worker_main(shared: &RunnerShared, worker_id: u32) {
    let group_id = shared.config.group_of(worker_id);

    let bound = match bind_states(shared, group_id) {
        Ok(bound) => Some(bound),
        Err(err) => {
            let message = format!("worker {worker_id}: {err:#}");
            error!("{message}");
            shared.fatal.lock().get_or_insert(message);
            None
        }
    };

    shared.ready.arrive_and_wait();

    if let Some(bound) = &bound {
        if !shared.control.aborted() {
            let total = shared.config.warmup_iterations + shared.config.measurement_iterations;
            for _ in 0..total {
                run_iteration(shared, worker_id, bound);
                if shared.control.aborted() {
                    break;
                }
            }
        }
        trial_teardown(shared, bound);
    }
}

/// Binds every state parameter in scope-phase order, running Trial setups
/// inside the slot initializer.
fn bind_states(shared: &RunnerShared, group_id: u32) -> anyhow::Result<Bound> {
    let layout = &shared.stub.plan.layout;
    let mut pairs: Vec<(usize, BoundState)> = Vec::with_capacity(layout.states.len());

    for &index in &layout.bind_order {
        let state = &layout.states[index];
        let linked = &shared.stub.states[index];

        let init = || {
            let handle = (linked.factory)()
                .with_context(|| format!("constructing state `{}`", state.type_name))?;
            for helper in linked.hooks(Level::Trial, HelperKind::Setup) {
                (helper.run)(&handle).with_context(|| {
                    format!("trial setup `{}` of `{}`", helper.name, state.type_name)
                })?;
            }
            Ok(handle)
        };

        let handle = shared
            .registry
            .get_or_init(state.scope, &state.field_ident, group_id, init)?;
        let slot = shared.registry.shared_slot(state.scope, &state.field_ident, group_id);
        pairs.push((index, BoundState { handle, slot }));
    }

    pairs.sort_by_key(|(index, _)| *index);
    let states: Vec<BoundState> = pairs.into_iter().map(|(_, bound)| bound).collect();
    let handles = states.iter().map(|b| b.handle.clone()).collect();
    Ok(Bound { states, handles })
}

fn run_iteration(shared: &RunnerShared, worker_id: u32, bound: &Bound) {
    let mut skip_body = false;
    if let Err(err) = run_level_hooks(shared, bound, Level::Iteration, HelperKind::Setup) {
        record_error(shared, worker_id, "iteration setup", &err);
        skip_body = true;
    }

    shared.start.arrive_and_wait();

    let mut lp = Loop::new(&shared.control);
    if !skip_body {
        measured_loop(shared, worker_id, bound, &mut lp);
    }
    shared.ops[worker_id as usize].store(lp.ops(), Ordering::Release);

    shared.end.arrive_and_wait();

    if let Err(err) = run_level_hooks(shared, bound, Level::Iteration, HelperKind::Teardown) {
        record_error(shared, worker_id, "iteration teardown", &err);
    }

    shared.sync.arrive_and_wait();
}

fn measured_loop(shared: &RunnerShared, worker_id: u32, bound: &Bound, lp: &mut Loop<'_>) {
    let single_shot = shared.mode == Mode::SingleShotTime;
    let mut invocations = 0u64;

    loop {
        if shared.control.stop_measurement() {
            break;
        }
        if single_shot && invocations >= shared.config.batch_size {
            break;
        }

        let started = shared.samples.as_ref().map(|_| Instant::now());
        if let Err(err) = run_invocation(shared, bound, lp) {
            record_error(shared, worker_id, "invocation", &err);
            break;
        }
        invocations += 1;

        if let (Some(samples), Some(started)) = (&shared.samples, started) {
            if let Err(err) = samples[worker_id as usize].lock().record(started.elapsed()) {
                warn!("worker {worker_id}: failed to record sample: {err}");
            }
        }
    }
}

fn run_invocation(shared: &RunnerShared, bound: &Bound, lp: &mut Loop<'_>) -> anyhow::Result<()> {
    let layout = &shared.stub.plan.layout;

    for &index in &layout.bind_order {
        run_hooks(shared, bound, index, Level::Invocation, HelperKind::Setup)?;
    }

    let states = StateSet::new(&bound.handles);
    (shared.stub.body)(lp, &states).context("benchmark body")?;
    lp.count_invocation();

    for &index in &layout.teardown_order {
        run_hooks(shared, bound, index, Level::Invocation, HelperKind::Teardown)?;
    }
    Ok(())
}

/// Runs one level's hooks for every bound state in scope-phase order,
/// gating shared scopes so each block executes in exactly one worker.
fn run_level_hooks(
    shared: &RunnerShared,
    bound: &Bound,
    level: Level,
    kind: HelperKind,
) -> anyhow::Result<()> {
    let layout = &shared.stub.plan.layout;
    let order = match kind {
        HelperKind::Setup => &layout.bind_order,
        HelperKind::Teardown => &layout.teardown_order,
    };

    for &index in order {
        let state = &layout.states[index];
        match (&bound.states[index].slot, kind) {
            // Thread scope: every worker runs its own hooks.
            (None, _) => run_hooks(shared, bound, index, level, kind)?,
            (Some(slot), HelperKind::Setup) => {
                if slot.lock().claim_setup() {
                    run_hooks(shared, bound, index, level, kind).with_context(|| {
                        format!("shared setup of `{}`", state.type_name)
                    })?;
                    slot.lock().publish_setup();
                }
            }
            (Some(slot), HelperKind::Teardown) => {
                if slot.lock().take_teardown() {
                    run_hooks(shared, bound, index, level, kind)?;
                }
            }
        }
    }
    Ok(())
}

/// Runs the hooks of one state at one (level, kind), declared order.
fn run_hooks(
    shared: &RunnerShared,
    bound: &Bound,
    index: usize,
    level: Level,
    kind: HelperKind,
) -> anyhow::Result<()> {
    let linked = &shared.stub.states[index];
    let handle = &bound.states[index].handle;
    for helper in linked.hooks(level, kind) {
        (helper.run)(handle).with_context(|| format!("helper `{}`", helper.name))?;
    }
    Ok(())
}

/// Trial teardown in reverse scope order; shared blocks run in exactly one
/// worker, gated by the inverted trial flag. Errors are logged, never
/// propagated.
fn trial_teardown(shared: &RunnerShared, bound: &Bound) {
    let layout = &shared.stub.plan.layout;
    for &index in &layout.teardown_order {
        let run = match &bound.states[index].slot {
            None => true,
            Some(slot) => slot.lock().take_trial(),
        };
        if run {
            if let Err(err) = run_hooks(shared, bound, index, Level::Trial, HelperKind::Teardown) {
                error!(
                    "trial teardown of `{}` failed: {err:#}",
                    layout.states[index].type_name
                );
            }
        }
    }
}

fn record_error(shared: &RunnerShared, worker_id: u32, phase: &str, err: &anyhow::Error) {
    let message = format!("worker {worker_id}: {phase} failed: {err:#}");
    error!("{message}");
    shared.errors.lock().push(message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn rendezvous_releases_all_workers_together() {
        let rendezvous = Arc::new(Rendezvous::new(3));
        let released = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let rendezvous = rendezvous.clone();
                let released = released.clone();
                thread::spawn(move || {
                    rendezvous.arrive_and_wait();
                    released.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        rendezvous.await_arrivals(Duration::from_secs(1)).unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 0);
        rendezvous.release();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(released.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn rendezvous_is_reusable_across_generations() {
        let rendezvous = Arc::new(Rendezvous::new(1));
        let worker = {
            let rendezvous = rendezvous.clone();
            thread::spawn(move || {
                rendezvous.arrive_and_wait();
                rendezvous.arrive_and_wait();
            })
        };

        for _ in 0..2 {
            rendezvous.await_arrivals(Duration::from_secs(1)).unwrap();
            rendezvous.release();
        }
        worker.join().unwrap();
    }
}
