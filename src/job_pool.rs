//! Fixed-size worker pool for forward-model evaluations.
//!
//! Jobs are handed to the workers through a bounded channel, so `submit`
//! blocks once the queue holds `queue_bound` jobs that no worker has picked
//! up yet. Results come back through an unbounded channel and can be read in
//! completion order or in submission order.

use std::{
    collections::{BTreeMap, BTreeSet},
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        mpsc::{channel, sync_channel, Receiver, Sender, SyncSender},
        Arc, Mutex,
    },
};

use anyhow::{anyhow, Context, Result};
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, warn};

use crate::error::InversionError;

/// A unit of work that can run on a pool worker.
pub trait Job: Send + 'static {
    type Output: Send + 'static;

    fn run(self) -> Result<Self::Output>;
}

/// A job wrapping an arbitrary closure, used for example by output formatters
/// that want to write files in parallel.
pub struct FnJob<T> {
    func: Box<dyn FnOnce() -> Result<T> + Send>,
}

impl<T: Send + 'static> FnJob<T> {
    pub fn new(func: impl FnOnce() -> Result<T> + Send + 'static) -> Self {
        Self {
            func: Box::new(func),
        }
    }
}

impl<T: Send + 'static> Job for FnJob<T> {
    type Output = T;

    fn run(self) -> Result<T> {
        (self.func)()
    }
}

pub type WriteJob = FnJob<()>;

/// Order in which results are handed back by [`JobPool::collect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectMode {
    /// Completion order.
    Unordered,
    /// Submission order.
    Ordered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobHandle(u64);

impl JobHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Pool configuration.
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    /// Number of worker threads.
    pub num_workers: usize,
    /// Memory budget for jobs waiting in the submission queue.
    pub batch_memory_bytes: usize,
    /// Overrides the queue bound derived from `batch_memory_bytes`.
    pub queue_bound: Option<usize>,
    /// Keep running after a failed job instead of aborting the inversion.
    pub degraded: bool,
    /// How often a failed job is resubmitted in degraded mode.
    pub max_retries: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            num_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            batch_memory_bytes: 256 * 1024 * 1024,
            queue_bound: None,
            degraded: false,
            max_retries: 1,
        }
    }
}

impl PoolSettings {
    /// Number of jobs that may wait in the queue, given the size of one job.
    pub fn queue_bound(&self, bytes_per_job: usize) -> usize {
        self.queue_bound
            .unwrap_or_else(|| self.batch_memory_bytes / bytes_per_job.max(1))
            .max(1)
    }
}

/// The result of one job.
#[derive(Debug)]
pub struct JobResult<T> {
    pub handle: JobHandle,
    pub outcome: Result<T>,
}

/// What happened to outstanding work when the pool was shut down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Jobs that finished but whose results were never collected.
    pub discarded: usize,
}

enum WorkerMessage<T> {
    Finished(JobHandle, Result<T>),
    Retired(usize),
}

pub struct JobPool<J: Job> {
    submit: Option<SyncSender<(JobHandle, J)>>,
    results: Receiver<WorkerMessage<J::Output>>,
    next_handle: u64,
    outstanding: BTreeSet<JobHandle>,
    buffered: BTreeMap<JobHandle, Result<J::Output>>,
    live_workers: usize,
    degraded: bool,
    closed: bool,
    queue_bound: usize,
    failed: usize,
    _threads: ThreadPool,
}

impl<J: Job> JobPool<J> {
    /// Start `settings.num_workers` workers with a queue of `queue_bound` jobs.
    pub fn new(settings: &PoolSettings, queue_bound: usize) -> Result<Self> {
        let num_workers = settings.num_workers.max(1);
        let queue_bound = queue_bound.max(1);
        let threads = ThreadPoolBuilder::new()
            .num_threads(num_workers)
            .thread_name(|i| format!("mtinv-worker-{}", i))
            .build()
            .context("Could not start thread pool")?;

        let (submit_tx, submit_rx) = sync_channel::<(JobHandle, J)>(queue_bound);
        let (results_tx, results_rx) = channel();
        let queue = Arc::new(Mutex::new(submit_rx));

        for worker in 0..num_workers {
            let queue = queue.clone();
            let results = results_tx.clone();
            threads.spawn(move || worker_loop(worker, queue, results));
        }
        drop(results_tx);

        debug!(workers = num_workers, queue_bound, "job pool started");

        Ok(Self {
            submit: Some(submit_tx),
            results: results_rx,
            next_handle: 0,
            outstanding: BTreeSet::new(),
            buffered: BTreeMap::new(),
            live_workers: num_workers,
            degraded: settings.degraded,
            closed: false,
            queue_bound,
            failed: 0,
            _threads: threads,
        })
    }

    /// Queue a job. Blocks while the submission queue is full.
    pub fn submit(&mut self, job: J) -> Result<JobHandle> {
        if self.closed {
            return Err(InversionError::PoolClosed.into());
        }
        let Some(submit) = self.submit.as_ref() else {
            return Err(InversionError::PoolClosed.into());
        };
        let handle = JobHandle(self.next_handle);
        if submit.send((handle, job)).is_err() {
            self.closed = true;
            return Err(anyhow!(InversionError::PoolClosed)).context("All workers have stopped");
        }
        self.next_handle += 1;
        self.outstanding.insert(handle);
        Ok(handle)
    }

    /// Number of submitted jobs whose results have not been collected.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn queue_bound(&self) -> usize {
        self.queue_bound
    }

    pub fn live_workers(&self) -> usize {
        self.live_workers
    }

    /// Number of jobs that failed so far.
    pub fn failed(&self) -> usize {
        self.failed
    }

    /// Wait for the next result.
    ///
    /// Returns `Ok(None)` when nothing is outstanding. A failed job closes the
    /// pool and is returned as an error unless the pool runs in degraded mode,
    /// in which case the failure is handed back as the job's outcome.
    pub fn collect(&mut self, mode: CollectMode) -> Result<Option<JobResult<J::Output>>> {
        loop {
            let ready = match mode {
                CollectMode::Unordered => self.buffered.keys().next().copied(),
                CollectMode::Ordered => self
                    .outstanding
                    .first()
                    .filter(|handle| self.buffered.contains_key(handle))
                    .copied(),
            };
            let ready = ready.and_then(|handle| {
                self.buffered
                    .remove(&handle)
                    .map(|outcome| (handle, outcome))
            });
            if let Some((handle, outcome)) = ready {
                self.outstanding.remove(&handle);
                return self.finish(handle, outcome).map(Some);
            }
            if self.outstanding.is_empty() {
                return Ok(None);
            }
            match self.results.recv() {
                Ok(WorkerMessage::Finished(handle, outcome)) => {
                    self.buffered.insert(handle, outcome);
                }
                Ok(WorkerMessage::Retired(worker)) => {
                    self.live_workers -= 1;
                    warn!(
                        worker,
                        live_workers = self.live_workers,
                        "worker retired after a panic"
                    );
                }
                Err(_) => {
                    self.closed = true;
                    return Err(anyhow!(InversionError::PoolClosed))
                        .context("No workers left to run outstanding jobs");
                }
            }
        }
    }

    fn finish(
        &mut self,
        handle: JobHandle,
        outcome: Result<J::Output>,
    ) -> Result<JobResult<J::Output>> {
        let Err(err) = outcome else {
            return Ok(JobResult { handle, outcome });
        };
        self.failed += 1;
        warn!(job = handle.0, error = %err, degraded = self.degraded, "job failed");
        if self.degraded {
            return Ok(JobResult {
                handle,
                outcome: Err(err),
            });
        }
        self.closed = true;
        self.submit = None;
        Err(InversionError::WorkerFailure {
            job: handle.0,
            cause: err.into(),
        }
        .into())
    }

    /// Stop accepting jobs, wait for the workers to drain the queue and exit.
    ///
    /// Results that were not collected are discarded.
    pub fn shutdown(&mut self) -> ShutdownReport {
        self.closed = true;
        drop(self.submit.take());
        let mut discarded = self.buffered.len();
        self.buffered.clear();
        while let Ok(message) = self.results.recv() {
            if let WorkerMessage::Finished(..) = message {
                discarded += 1;
            }
        }
        self.outstanding.clear();
        if discarded > 0 {
            debug!(discarded, "discarded results of in-flight jobs");
        }
        ShutdownReport { discarded }
    }
}

impl<J: Job> Drop for JobPool<J> {
    fn drop(&mut self) {
        if self.submit.is_some() || !self.outstanding.is_empty() {
            self.shutdown();
        }
    }
}

fn worker_loop<J: Job>(
    worker: usize,
    queue: Arc<Mutex<Receiver<(JobHandle, J)>>>,
    results: Sender<WorkerMessage<J::Output>>,
) {
    loop {
        let next = queue.lock().expect("Poisoned lock").recv();
        // The sending side is gone, the pool is shutting down
        let Ok((handle, job)) = next else {
            return;
        };
        match catch_unwind(AssertUnwindSafe(|| job.run())) {
            Ok(outcome) => {
                if results.send(WorkerMessage::Finished(handle, outcome)).is_err() {
                    return;
                }
            }
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                // Retirement is announced first so that the pool knows about
                // the smaller worker set before it sees the failed job.
                let _ = results.send(WorkerMessage::Retired(worker));
                let _ = results.send(WorkerMessage::Finished(
                    handle,
                    Err(anyhow!("Worker {} panicked: {}", worker, message)),
                ));
                return;
            }
        }
    }
}
