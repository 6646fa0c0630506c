//! Fan-out/fan-in execution of partitioned work.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;

use clap::ValueEnum;
use log::{debug, error, warn};

use crate::error::LoadError;
use crate::partition::Partition;

/// How the pool reacts to the first failing worker.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[value(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Stop handing out positions in every other worker.
    #[default]
    Abort,
    /// Let the other workers finish their ranges.
    Drain,
}

/// Outcome of a successful [`WorkerPool::run`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolReport {
    /// Positions for which the work function returned `Ok`.
    pub processed: usize,
    pub workers: usize,
}

/// Runs one OS thread per partition and waits for all of them.
///
/// Parallelism is bounded by the number of partitions, not by the number of
/// positions. Within a partition positions are processed in increasing
/// order; across partitions the order is unspecified.
#[derive(Clone, Debug)]
pub struct WorkerPool {
    policy: FailurePolicy,
}

/// Worker threads are named `dbload-worker-<index>`.
const THREAD_NAME: &str = "dbload-worker";

struct Shared {
    cancelled: AtomicBool,
    processed: AtomicUsize,
    failures: AtomicUsize,
    first_error: Mutex<Option<LoadError>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            processed: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            first_error: Mutex::new(None),
        }
    }

    fn fail(&self, worker: usize, error: LoadError, policy: FailurePolicy) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        if policy == FailurePolicy::Abort {
            self.cancelled.store(true, Ordering::Release);
        }

        let mut first = self
            .first_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if first.is_none() {
            error!("worker {worker} failed: {error:#}");
            *first = Some(error);
        } else {
            warn!("worker {worker} also failed: {error:#}");
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(FailurePolicy::default())
    }
}

impl WorkerPool {
    pub fn new(policy: FailurePolicy) -> Self {
        Self { policy }
    }

    /// Runs `work` for every position of every partition.
    ///
    /// Each worker first builds its private state with `init` (typically a
    /// store session), then calls `work` for each position of its range in
    /// increasing order. Returns once every worker has returned. If any
    /// `init` or `work` call fails, or a worker panics, the first error is
    /// returned; with [`FailurePolicy::Abort`] the remaining workers stop at
    /// their next position.
    pub fn run<S, I, W>(
        &self,
        partitions: &[Partition],
        init: I,
        work: W,
    ) -> Result<PoolReport, LoadError>
    where
        I: Fn(&Partition) -> Result<S, LoadError> + Sync,
        W: Fn(&mut S, usize) -> Result<(), LoadError> + Sync,
    {
        let shared = Shared::new();
        let policy = self.policy;

        thread::scope(|scope| {
            let mut handles = Vec::with_capacity(partitions.len());
            for partition in partitions {
                let (shared, init, work) = (&shared, &init, &work);
                let spawned = thread::Builder::new()
                    .name(format!("{THREAD_NAME}-{}", partition.worker))
                    .spawn_scoped(scope, move || {
                        run_partition(shared, policy, partition, init, work)
                    });
                match spawned {
                    Ok(handle) => handles.push((partition.worker, handle)),
                    Err(e) => {
                        // Threads that did start still get joined by the scope.
                        shared.fail(partition.worker, LoadError::Spawn(e), FailurePolicy::Abort);
                        break;
                    }
                }
            }

            for (worker, handle) in handles {
                if handle.join().is_err() {
                    shared.fail(worker, LoadError::WorkerPanicked { worker }, policy);
                }
            }
        });

        let failures = shared.failures.load(Ordering::Relaxed);
        let processed = shared.processed.load(Ordering::Relaxed);
        match shared
            .first_error
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
        {
            Some(error) => {
                debug!("{failures} worker(s) failed after processing {processed} positions");
                Err(error)
            }
            None => Ok(PoolReport {
                processed,
                workers: partitions.len(),
            }),
        }
    }
}

fn run_partition<S, I, W>(
    shared: &Shared,
    policy: FailurePolicy,
    partition: &Partition,
    init: &I,
    work: &W,
) where
    I: Fn(&Partition) -> Result<S, LoadError>,
    W: Fn(&mut S, usize) -> Result<(), LoadError>,
{
    let mut state = match init(partition) {
        Ok(state) => state,
        Err(e) => return shared.fail(partition.worker, e, policy),
    };

    for position in partition.range() {
        if shared.is_cancelled() {
            debug!(
                "worker {} cancelled at position {position}",
                partition.worker
            );
            return;
        }
        if let Err(e) = work(&mut state, position) {
            return shared.fail(partition.worker, e, policy);
        }
        shared.processed.fetch_add(1, Ordering::Relaxed);
    }
}
