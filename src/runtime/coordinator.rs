//! The per-iteration measurement protocol, coordinator side.
use std::sync::atomic::Ordering;
use std::time::Instant;

use log::warn;

use crate::descriptor::Mode;
use crate::error::RunError;
use crate::histogram::SampleHistogram;
use crate::output::OutputFormat;
use crate::profiler::ProfilerHook;
use crate::report::{IterationData, IterationStatus};
use crate::runtime::runner::{Rendezvous, RunnerShared};

/// Drives all warmup and measurement iterations of one mode-run, returning
/// the measurement sequence in order.
///
/// Per iteration: workers run Iteration-Setup; profilers start; the start
/// rendezvous releases workers into the measured region and the timer
/// starts; after the time budget (or the single-shot batch) the stop flag
/// is raised; the end rendezvous collects per-worker op counts and profiler
/// results; workers run Iteration-Teardown; the sync rendezvous closes the
/// iteration and its result goes to the sink.
pub(crate) fn run_iterations(
    shared: &RunnerShared,
    output: &mut dyn OutputFormat,
    profilers: &mut [Box<dyn ProfilerHook>],
) -> Result<Vec<IterationData>, RunError> {
    let config = &shared.config;

    // Workers are binding states; Trial setups run in there. A failure is
    // fatal for the benchmark: no iterations follow.
    await_point(shared, &shared.ready)?;
    if let Some(reason) = shared.fatal.lock().clone() {
        shared.control.set_abort();
        shared.ready.release();
        return Err(RunError::TrialSetupFailed(reason));
    }
    shared.ready.release();

    let warmups = config.warmup_iterations;
    let total = warmups + config.measurement_iterations;
    let mut measurements = Vec::with_capacity(config.measurement_iterations as usize);
    let mut first_failure: Option<(u32, String)> = None;

    for i in 0..total {
        let warmup = i < warmups;
        if !warmup && shared.control.warming_up() {
            shared.control.finish_warmup();
        }
        let index = if warmup { i + 1 } else { i - warmups + 1 };

        // No worker can observe the stop flag here: the measured region of
        // this iteration opens only at the start release below.
        shared.control.clear_stop();

        for profiler in profilers.iter_mut() {
            if let Err(err) = profiler.start_profile() {
                warn!("profiler `{}` failed to start: {err:#}", profiler.label());
            }
        }

        await_point(shared, &shared.start)?;
        shared.start.release();
        let timer = Instant::now();

        if shared.mode != Mode::SingleShotTime {
            // Sleep out the budget; external cancellation ends it early.
            shared.cancel.wait_timeout(config.iteration_time);
            shared.control.set_stop();
        }

        await_point(shared, &shared.end)?;
        let duration = timer.elapsed();
        if shared.mode == Mode::SingleShotTime {
            // Workers stop themselves after the batch; raise the flag once
            // they all left the measured region.
            shared.control.set_stop();
        }

        let operation_counts: Vec<u64> =
            shared.ops.iter().map(|ops| ops.load(Ordering::Acquire)).collect();

        let mut profiler_results = Vec::new();
        for profiler in profilers.iter_mut() {
            match profiler.end_profile() {
                Ok(result) => profiler_results.push(result),
                Err(err) => warn!("profiler `{}` failed: {err:#}", profiler.label()),
            }
        }

        let samples = shared.samples.as_ref().and_then(|per_worker| {
            let mut merged = SampleHistogram::new();
            for histogram in per_worker {
                histogram.lock().drain_into(&mut merged);
            }
            merged.summary()
        });

        shared.end.release();

        // Workers are running Iteration-Teardown now.
        await_point(shared, &shared.sync)?;

        let errors: Vec<String> = std::mem::take(&mut *shared.errors.lock());
        let status = match errors.into_iter().next() {
            None => IterationStatus::Ok,
            Some(first) => IterationStatus::Failed(first),
        };

        let data = IterationData {
            mode: shared.mode,
            index,
            warmup,
            duration,
            operation_counts,
            profiler_results,
            samples,
            status,
        };
        output.iteration_result(&data);

        if let IterationStatus::Failed(reason) = &data.status {
            if config.fail_on_error {
                first_failure.get_or_insert((index, reason.clone()));
                shared.control.set_abort();
            }
        }
        if !warmup {
            measurements.push(data);
        }
        if shared.cancel.is_cancelled() {
            // Cancellation between iterations: abandon the rest; workers
            // still run Trial-Teardown on their way out.
            shared.control.set_abort();
        }

        shared.sync.release();
        if shared.control.aborted() {
            break;
        }
    }

    if let Some((index, reason)) = first_failure {
        return Err(RunError::IterationFailed { index, reason });
    }
    Ok(measurements)
}

/// Waits for full arrival at a rendezvous; a fatal wait aborts the run and
/// releases whoever arrived so they can drain.
fn await_point(shared: &RunnerShared, point: &Rendezvous) -> Result<(), RunError> {
    point.await_arrivals(shared.config.shutdown_wait).inspect_err(|_| {
        shared.control.set_abort();
        shared.control.set_stop();
        point.release();
    })
}
