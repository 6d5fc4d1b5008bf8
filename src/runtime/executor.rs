//! Worker pool construction and the bounded-wait shutdown protocol.
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use log::warn;

use crate::error::RunError;
use crate::runtime::config::ExecutorKind;

/// One worker's entry point.
pub(crate) type WorkerTask = Box<dyn FnOnce() + Send + 'static>;

/// Bounded number of logged shutdown waits before the run is declared dead.
const SHUTDOWN_RETRIES: u32 = 30;

/// The launched worker pool of one mode-run.
pub(crate) struct WorkerPool {
    kind: PoolKind,
    done_rx: Receiver<u32>,
    launched: u32,
}

enum PoolKind {
    Threads(Vec<thread::JoinHandle<()>>),
    Owned(rayon::ThreadPool),
    Shared,
}

impl WorkerPool {
    /// Launches one task per worker on the configured executor.
    pub fn launch(kind: ExecutorKind, tasks: Vec<WorkerTask>) -> Result<WorkerPool, RunError> {
        let launched = tasks.len() as u32;
        let (done_tx, done_rx) = channel();

        let instrumented = tasks.into_iter().enumerate().map(|(id, task)| {
            let done_tx = done_tx.clone();
            move || {
                task();
                let _ = done_tx.send(id as u32);
            }
        });

        let kind = match kind {
            ExecutorKind::Fixed => {
                let mut handles = Vec::with_capacity(launched as usize);
                for (id, task) in instrumented.enumerate() {
                    let handle = thread::Builder::new()
                        .name(format!("rmh-worker-{id}"))
                        .spawn(task)
                        .map_err(|e| RunError::ExecutorBuild(e.to_string()))?;
                    handles.push(handle);
                }
                PoolKind::Threads(handles)
            }
            ExecutorKind::Cached => {
                PoolKind::Threads(instrumented.map(thread::spawn).collect())
            }
            ExecutorKind::ForkJoin => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(launched as usize)
                    .thread_name(|i| format!("rmh-worker-{i}"))
                    .build()
                    .map_err(|e| RunError::ExecutorBuild(e.to_string()))?;
                for task in instrumented {
                    pool.spawn(task);
                }
                PoolKind::Owned(pool)
            }
            ExecutorKind::SharedForkJoin => {
                for task in instrumented {
                    rayon::spawn(task);
                }
                PoolKind::Shared
            }
        };

        Ok(WorkerPool { kind, done_rx, launched })
    }

    /// Waits for every worker to finish, logging a warning and retrying on
    /// each bounded timeout. Owned resources are reclaimed afterwards; the
    /// shared pool is never shut down.
    pub fn shutdown(self, wait: Duration) -> Result<(), RunError> {
        let mut remaining = self.launched;
        let mut waits = 0u32;
        while remaining > 0 {
            match self.done_rx.recv_timeout(wait) {
                Ok(_) => remaining -= 1,
                Err(RecvTimeoutError::Timeout) => {
                    waits += 1;
                    warn!("{remaining} worker(s) still running after {wait:?}; retrying shutdown");
                    if waits >= SHUTDOWN_RETRIES {
                        return Err(RunError::ShutdownTimeout { waited: wait * waits });
                    }
                }
                // Every sender dropped: all workers returned already.
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        match self.kind {
            PoolKind::Threads(handles) => {
                for handle in handles {
                    if handle.join().is_err() {
                        warn!("a worker thread panicked during shutdown");
                    }
                }
            }
            PoolKind::Owned(pool) => drop(pool),
            PoolKind::Shared => {}
        }
        Ok(())
    }
}
