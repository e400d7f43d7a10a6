//! `JobImpl`: the heap-resident core job object, and `Job`, the public handle
//! around it.
//!
//! Grounded on `gdul::jh_detail::job_impl` / `gdul::job` (original_source
//! `include/gdul/job_handler/job_impl.h`, `source/gdul/job_handler/job.cpp`),
//! reworked from a manually-refcounted `shared_ptr` into `std::sync::Arc`, and
//! from an intrusive atomic-shared-ptr dependee list into an
//! [`arc_swap::ArcSwapOption`] head over [`crate::node::JobNode`].

use crate::allocator::{Pool, PoolTicket};
use crate::graph::JobMetrics;
use crate::node::JobNode;
use crate::queue::JobQueue;
use crate::worker;
use arc_swap::ArcSwapOption;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Subtracted from the dependency counter by [`JobImpl::enable`], collapsing
/// "not yet enabled" and "waiting on real dependencies" into a single atomic
/// word: a job carrying `N` real dependencies sits at `ENABLE_OFFSET + N`
/// until enabled, then at `N` until each dependency resolves down to zero.
pub const ENABLE_OFFSET: u32 = u32::MAX / 2 + 1;

/// Upper bound on how many real dependencies one job may carry. Exceeding it
/// is a programming error (an unreasonably wide dependency fan-in), not a
/// transient condition, so it is only checked in debug builds.
pub const MAX_REAL_DEPS: u32 = u32::MAX / 2;

type WorkUnit = Box<dyn FnOnce(&Job) + Send>;

/// Outcome of [`JobImpl::enable`] / [`Job::enable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnableOutcome {
    /// Transitioned from "not yet enabled" to enabled; dependencies remain
    /// outstanding.
    EnabledPending,
    /// Transitioned to enabled with zero outstanding dependencies; the job
    /// has already been submitted to its target queue.
    EnabledAndSubmitted,
    /// `enable()` had already been called once before; this call was a
    /// no-op.
    AlreadyEnabled,
}

impl EnableOutcome {
    pub fn is_enabled(self) -> bool {
        !matches!(self, EnableOutcome::AlreadyEnabled)
    }
}

/// The heap-resident core job object. Never constructed directly by callers
/// -- reached through [`Job`] and produced by `JobHandler::make_job`.
pub struct JobImpl {
    work: std::cell::UnsafeCell<Option<WorkUnit>>,
    target: Arc<dyn JobQueue>,
    dependencies: AtomicU32,
    head_dependees: ArcSwapOption<JobNode>,
    finished: AtomicBool,
    metrics: Option<Arc<JobMetrics>>,
    node_pool: Pool,
    _ticket: PoolTicket,
}

// SAFETY: `work` is written once at construction and taken exactly once, by
// whichever single thread ends up executing the job -- guaranteed by the
// submit/fetch protocol, under which a job reaches a queue (and hence a
// worker) at most once per `enable()`.
unsafe impl Sync for JobImpl {}

impl JobImpl {
    pub(crate) fn new(
        work: WorkUnit,
        target: Arc<dyn JobQueue>,
        metrics: Option<Arc<JobMetrics>>,
        node_pool: Pool,
        ticket: PoolTicket,
    ) -> Self {
        Self {
            work: std::cell::UnsafeCell::new(Some(work)),
            target,
            dependencies: AtomicU32::new(ENABLE_OFFSET),
            head_dependees: ArcSwapOption::from(None),
            finished: AtomicBool::new(false),
            metrics,
            node_pool,
            _ticket: ticket,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn is_ready(&self) -> bool {
        self.dependencies.load(Ordering::SeqCst) == 0
    }

    pub fn is_enabled(&self) -> bool {
        self.dependencies.load(Ordering::SeqCst) < ENABLE_OFFSET
    }

    /// Priority fed to a `SyncQueue`: the largest propagation-time estimate
    /// accumulated from this job's dependants, or `0.0` if it carries no
    /// [`JobMetrics`].
    pub fn priority(&self) -> f32 {
        self.metrics
            .as_ref()
            .map(|m| m.propagation_estimate())
            .unwrap_or(0.0)
    }

    /// Attempt to add `n` dependencies. Succeeds only while the job has not
    /// yet been enabled (the counter is still at or above [`ENABLE_OFFSET`]).
    pub(crate) fn try_add_dependencies(&self, n: u32) -> bool {
        let mut current = self.dependencies.load(Ordering::SeqCst);
        loop {
            if current < ENABLE_OFFSET {
                return false;
            }
            debug_assert!(
                current - ENABLE_OFFSET + n <= MAX_REAL_DEPS,
                "jobgraph: dependency count would exceed the maximum for one job"
            );
            match self.dependencies.compare_exchange(
                current,
                current + n,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Subtract `n` from the dependency counter. If this crosses zero from
    /// above while the job is already enabled, submit it to its target
    /// queue.
    pub(crate) fn remove_dependencies(self: &Arc<Self>, n: u32) {
        let old = self.dependencies.fetch_sub(n, Ordering::SeqCst);
        let new = old - n;
        if old < ENABLE_OFFSET && new == 0 {
            self.submit();
        }
    }

    /// At-most-once transition out of "not yet enabled".
    pub(crate) fn enable(self: &Arc<Self>) -> EnableOutcome {
        let mut current = self.dependencies.load(Ordering::SeqCst);
        loop {
            if current < ENABLE_OFFSET {
                return EnableOutcome::AlreadyEnabled;
            }
            let new = current - ENABLE_OFFSET;
            match self
                .dependencies
                .compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => {
                    if new == 0 {
                        self.submit();
                        return EnableOutcome::EnabledAndSubmitted;
                    }
                    return EnableOutcome::EnabledPending;
                }
                Err(observed) => current = observed,
            }
        }
    }

    fn submit(self: &Arc<Self>) {
        self.target.clone().submit_job(self.clone());
    }

    /// Try to register `child` as a dependant. Fails if `self` has already
    /// finished -- the window in which attachment is meaningful has closed.
    /// Re-checks `finished` on every CAS retry, so a racing finish is never
    /// missed.
    pub(crate) fn try_attach_child(self: &Arc<Self>, child: Arc<JobImpl>) -> bool {
        let mut attached = false;
        self.head_dependees.rcu(|current| {
            if self.finished.load(Ordering::SeqCst) {
                attached = false;
                current.clone()
            } else {
                attached = true;
                let ticket = self.node_pool.acquire().ok();
                Some(Arc::new(JobNode::new(child.clone(), current.clone(), ticket)))
            }
        });
        attached
    }

    /// Swap the dependee list out for `None` and walk it, decrementing each
    /// dependant's dependency count and feeding this job's runtime into its
    /// propagation-time accounting. Called exactly once, from [`JobImpl::execute`].
    fn detach_children(self: &Arc<Self>) {
        let mut node = self.head_dependees.swap(None);
        while let Some(n) = node {
            if let Some(metrics) = &self.metrics {
                metrics.accumulate_dependant_time(n.job.priority());
            }
            n.job.remove_dependencies(1);
            node = n.next.clone();
        }
    }

    /// Run the work unit and perform completion bookkeeping. If the work
    /// unit panics, the panic propagates out unwound: `finished` is never
    /// set and children are never detached. The worker dispatch loop (see
    /// [`crate::worker::consume`]) catches that unwind and aborts the
    /// process rather than continuing with a half-updated graph.
    pub(crate) fn execute(self: &Arc<Self>) {
        let start = Instant::now();

        let work = unsafe { (*self.work.get()).take() }
            .expect("jobgraph: job executed more than once");

        let handle = Job(self.clone());
        work(&handle);

        self.finished.store(true, Ordering::SeqCst);

        if let Some(metrics) = &self.metrics {
            metrics.store_runtime(start.elapsed().as_secs_f32());
        }

        self.detach_children();
    }
}

/// A shared handle to a job. Cheaply cloneable; clones refer to the same
/// underlying [`JobImpl`]. This is the type callers construct and chain
/// dependencies on.
#[derive(Clone)]
pub struct Job(pub(crate) Arc<JobImpl>);

impl Job {
    pub(crate) fn from_impl(imp: Arc<JobImpl>) -> Self {
        Self(imp)
    }

    /// Build a fresh, not-yet-enabled job directly from its parts. Shared by
    /// `JobHandler::make_job` and `BatchJob::new` so both go through the
    /// same admission-controlled construction path.
    pub(crate) fn new(
        work: WorkUnit,
        target: Arc<dyn JobQueue>,
        metrics: Option<Arc<JobMetrics>>,
        node_pool: Pool,
        ticket: PoolTicket,
    ) -> Self {
        Self(Arc::new(JobImpl::new(work, target, metrics, node_pool, ticket)))
    }

    /// Register `self` as dependent on `other`: `self` will not become ready
    /// until `other` has finished. Calling this twice for the same pair is
    /// not set-like -- it produces two decrements on completion, which
    /// `other` finishing only once can never satisfy, so callers should not
    /// add the same dependency edge more than once.
    ///
    /// # Panics
    /// Panics if called after `self` has already been enabled -- per the
    /// dependency engine's contract, dependencies may only be declared
    /// before `enable()`.
    pub fn add_dependency(&self, other: &Job) {
        if self.0.try_add_dependencies(1) {
            if !other.0.try_attach_child(self.0.clone()) {
                self.0.remove_dependencies(1);
            }
        } else {
            panic!("jobgraph: add_dependency called after enable()");
        }
    }

    /// At-most-once transition releasing this job into its queue once ready.
    /// Safe to call more than once; later calls report
    /// [`EnableOutcome::AlreadyEnabled`] and have no effect.
    pub fn enable(&self) -> EnableOutcome {
        self.0.enable()
    }

    /// If this job is both unenabled and already free of real dependencies,
    /// run it synchronously on the calling thread instead of round-tripping
    /// through its target queue. Returns whether it ran.
    pub fn enable_locally_if_ready(&self) -> bool {
        if self
            .0
            .dependencies
            .compare_exchange(ENABLE_OFFSET, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            JobImpl::execute(&self.0);
            true
        } else {
            false
        }
    }

    pub fn is_ready(&self) -> bool {
        self.0.is_ready()
    }

    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }

    pub fn is_enabled(&self) -> bool {
        self.0.is_enabled()
    }

    pub fn priority(&self) -> f32 {
        self.0.priority()
    }

    /// Spin until the job finishes. The only blocking primitives allowed
    /// anywhere in worker dispatch are `thread::sleep` and `thread::join`;
    /// job completion itself is observed by spinning, not parking.
    pub fn wait_until_finished(&self) {
        while !self.is_finished() {
            std::hint::spin_loop();
        }
    }

    /// Spin until the job becomes ready (enabled, dependency count at zero).
    pub fn wait_until_ready(&self) {
        while !self.is_ready() {
            std::hint::spin_loop();
        }
    }

    /// Consume jobs from `queue` until this job finishes. May recurse
    /// through further nested `work_until_*` calls from within a job's work
    /// closure; deep recursion risks stack overflow, as in the
    /// implementation this is ported from.
    pub fn work_until_finished(&self, queue: &Arc<dyn JobQueue>) {
        worker::drain_until(queue, || self.is_finished());
    }

    /// Consume jobs from `queue` until this job becomes ready.
    pub fn work_until_ready(&self, queue: &Arc<dyn JobQueue>) {
        worker::drain_until(queue, || self.is_ready());
    }
}

pub(crate) fn execute_caught(job: &Arc<JobImpl>) -> std::thread::Result<()> {
    std::panic::catch_unwind(AssertUnwindSafe(|| JobImpl::execute(job)))
}
