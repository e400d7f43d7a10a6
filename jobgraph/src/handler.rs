//! `JobHandler`: owns the worker bank, the three admission pools, and the
//! optional per-job-graph metadata registry.
//!
//! Grounded on `gdul::jh_detail::job_handler_impl` (original_source
//! `source/gdul/execution/job_handler/job_handler_impl.h`): three memory
//! pools (`m_jobImplMemPool`, `m_jobNodeMemPool`, `m_batchJobMemPool`), an
//! array of worker slots, and `make_job`/`make_worker` factory methods. The
//! pool allocator and worker-array-with-atomic-index are replaced here with
//! [`crate::allocator::Pool`] (admission control, not allocation -- see that
//! module's docs) and a plain growable `Vec<Worker>` respectively, since this
//! crate does not reimplement the original's fixed-capacity `Max_Workers`
//! array or its own slab allocator.

use crate::allocator::{Pool, PoolExhausted};
use crate::batch::{BatchBuffer, BatchJob, Process};
use crate::graph::JobMetrics;
use crate::job::Job;
use crate::queue::JobQueue;
use crate::worker::Worker;
use jobgraph_support::jg_info;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Default per-thread admission capacity for each pool, used by
/// [`JobHandler::new`]. Mirrors the original's pool block size choices --
/// generous enough that ordinary graphs never observe [`PoolExhausted`].
pub const DEFAULT_POOL_CAPACITY: usize = 4096;

/// Default idle-sleep threshold handed to workers created through
/// [`JobHandler::make_worker`].
pub const DEFAULT_SLEEP_THRESHOLD: Duration = Duration::from_millis(2);

/// A reasonable default worker count: one OS thread per logical CPU, minus
/// one to leave room for whatever thread drives the handler itself. Never
/// less than one.
pub fn default_worker_count() -> usize {
    num_cpus::get().saturating_sub(1).max(1)
}

/// Owns the three admission pools (`JobImpl`, `JobNode`, `BatchJobImpl`) and
/// the bank of workers spawned through it. A handler has no opinion on which
/// queues exist -- callers construct [`crate::queue::AsyncQueue`] /
/// [`crate::queue::SyncQueue`] instances directly and wire workers to them
/// via [`Worker::add_assignment`].
pub struct JobHandler {
    job_pool: Pool,
    node_pool: Pool,
    batch_pool: Pool,
    job_metrics: Mutex<HashMap<String, Arc<JobMetrics>>>,
}

impl JobHandler {
    /// Construct a handler with [`DEFAULT_POOL_CAPACITY`] for every pool.
    pub fn new() -> Self {
        Self::with_pool_capacity(DEFAULT_POOL_CAPACITY)
    }

    /// Construct a handler whose three pools all share the given per-thread
    /// admission capacity.
    pub fn with_pool_capacity(capacity: usize) -> Self {
        Self {
            job_pool: Pool::new(capacity),
            node_pool: Pool::new(capacity),
            batch_pool: Pool::new(capacity),
            job_metrics: Mutex::new(HashMap::new()),
        }
    }

    /// Look up (or lazily create) the [`JobMetrics`] tracked under `name` --
    /// the "job graph metadata" component from the spec, keyed by physical
    /// id rather than by pointer identity. Attach the result to a job via
    /// [`JobHandler::make_job_with_metrics`] to opt it into
    /// `SyncQueue`-priority-aware scheduling.
    pub fn job_metrics(&self, name: &str) -> Arc<JobMetrics> {
        let mut table = self.job_metrics.lock();
        table
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(JobMetrics::new()))
            .clone()
    }

    /// Construct a not-yet-enabled job with no propagation-time tracking.
    pub fn make_job<F>(&self, work: F, target: Arc<dyn JobQueue>) -> Result<Job, PoolExhausted>
    where
        F: FnOnce(&Job) + Send + 'static,
    {
        self.make_job_with_metrics(work, target, None)
    }

    /// Construct a not-yet-enabled job, attaching `metrics` (typically from
    /// [`JobHandler::job_metrics`]) so it participates in `SyncQueue`
    /// priority ordering.
    pub fn make_job_with_metrics<F>(
        &self,
        work: F,
        target: Arc<dyn JobQueue>,
        metrics: Option<Arc<JobMetrics>>,
    ) -> Result<Job, PoolExhausted>
    where
        F: FnOnce(&Job) + Send + 'static,
    {
        let ticket = self.job_pool.acquire()?;
        Ok(Job::new(
            Box::new(work),
            target,
            metrics,
            self.node_pool.clone(),
            ticket,
        ))
    }

    /// Construct a batch job: an initialize job, `batch_hint`-derived process
    /// slices over `input`, and a finalize job, fanned out over `target`.
    pub fn make_batch_job<In, Out>(
        &self,
        input: BatchBuffer<In>,
        output: Option<BatchBuffer<Out>>,
        process: Process<In, Out>,
        batch_hint: usize,
        target: Arc<dyn JobQueue>,
    ) -> Result<BatchJob<In, Out>, PoolExhausted>
    where
        In: Send + Sync + 'static,
        Out: Send + Sync + 'static,
    {
        BatchJob::new(
            input,
            output,
            process,
            batch_hint,
            target,
            self.job_pool.clone(),
            self.node_pool.clone(),
            self.batch_pool.clone(),
        )
    }

    /// Construct a disabled worker. The caller assigns queues via
    /// [`Worker::add_assignment`] and then calls [`Worker::enable`] to spawn
    /// its dispatch thread.
    pub fn make_worker(&self, name: impl Into<String>) -> Worker {
        let name = name.into();
        jg_info!("constructing worker '{}'", name);
        Worker::new(name, DEFAULT_SLEEP_THRESHOLD)
    }

    /// Construct a disabled worker with an explicit idle-sleep threshold.
    pub fn make_worker_with_sleep_threshold(
        &self,
        name: impl Into<String>,
        sleep_threshold: Duration,
    ) -> Worker {
        Worker::new(name.into(), sleep_threshold)
    }
}

impl Default for JobHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::AsyncQueue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn make_job_runs_through_a_queue() {
        let handler = JobHandler::new();
        let queue: Arc<dyn JobQueue> = AsyncQueue::new();
        let mut worker = handler.make_worker("w0");
        worker.add_assignment(queue.clone());
        worker.enable();

        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let job = handler
            .make_job(move |_| { ran2.fetch_add(1, Ordering::SeqCst); }, queue)
            .unwrap();
        job.enable();
        job.wait_until_finished();

        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn job_metrics_are_shared_by_name() {
        let handler = JobHandler::new();
        let a = handler.job_metrics("physical-id-1");
        let b = handler.job_metrics("physical-id-1");
        a.store_runtime(2.0);
        assert_eq!(b.propagation_estimate(), 0.0);
        a.accumulate_dependant_time(1.0);
        assert_eq!(b.propagation_estimate(), 3.0);
    }
}
