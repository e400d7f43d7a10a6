//! `WorkerImpl`: the dispatch loop that pulls jobs off queues and runs them.
//!
//! Grounded on gdul's `worker_impl.h`/`worker_impl.cpp`: a small bounded set
//! of "target" queues polled round-robin, and an idle heuristic
//! (`is_sleepy`/`idle`) that yields while jobs have been arriving recently
//! and falls back to a short sleep once the gap since the last job exceeds a
//! threshold -- trading latency for CPU usage. `thread::sleep` and
//! `thread::join` are the only blocking primitives used anywhere in worker
//! dispatch; job completion itself is observed by spinning (see
//! [`crate::job::Job::wait_until_finished`]).

use crate::job::{self, JobImpl};
use crate::qsbr;
use crate::queue::JobQueue;
use jobgraph_support::{jg_error, thread as thread_registry};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Upper bound on how many queues a single worker may subscribe to. Kept
/// small and fixed, as in the original: a worker round-robins a short,
/// explicit list rather than discovering queues dynamically.
pub const MAX_TARGETS: usize = 2;

thread_local! {
    static CURRENT_JOB: RefCell<Option<Arc<JobImpl>>> = RefCell::new(None);
    static CURRENT_WORKER: RefCell<Option<String>> = RefCell::new(None);
}

/// The name of the worker dispatching on this thread, if any.
pub fn current_worker_name() -> Option<String> {
    CURRENT_WORKER.with(|c| c.borrow().clone())
}

/// The job currently executing on this thread, if any. Valid from within a
/// job's work closure, including through nested `work_until_*` recursion.
pub fn current_job() -> Option<job::Job> {
    CURRENT_JOB.with(|c| c.borrow().clone().map(job::Job::from_impl))
}

/// Run one job on the calling thread, catching panics so a misbehaving work
/// unit cannot silently leave the graph half-updated: on panic the process
/// aborts, matching the upstream implementation's own choice to treat a job
/// panic as fatal rather than risk a stuck dependency subgraph.
pub(crate) fn consume(job: Arc<JobImpl>) {
    let previous = CURRENT_JOB.with(|c| c.replace(Some(job.clone())));
    let result = crate::job::execute_caught(&job);
    CURRENT_JOB.with(|c| *c.borrow_mut() = previous);

    if result.is_err() {
        jg_error!("job panicked; aborting process to avoid a partially-torn dependency graph");
        std::process::abort();
    }
}

/// Drain jobs from `queue` until `predicate` returns `true`. Used by
/// `work_until_finished`/`work_until_ready` for cooperative, re-entrant
/// draining from any thread, worker or not.
pub(crate) fn drain_until(queue: &Arc<dyn JobQueue>, mut predicate: impl FnMut() -> bool) {
    while !predicate() {
        match queue.fetch_job() {
            Some(job) => consume(job),
            None => std::thread::yield_now(),
        }
    }
}

struct Inner {
    name: String,
    queues: Mutex<Vec<Arc<dyn JobQueue>>>,
    active: AtomicBool,
    sleep_threshold: Duration,
    on_enable: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    on_disable: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

fn idle(inner: &Inner, last_job_at: &mut Instant) {
    if last_job_at.elapsed() < inner.sleep_threshold {
        std::thread::yield_now();
    } else {
        std::thread::sleep(Duration::from_micros(500));
    }
}

fn run(inner: Arc<Inner>) {
    qsbr::register_thread();
    thread_registry::set_thread_name(std::thread::current().id(), inner.name.clone());
    CURRENT_WORKER.with(|c| *c.borrow_mut() = Some(inner.name.clone()));

    if let Some(hook) = inner.on_enable.lock().take() {
        hook();
    }

    let mut round_robin = 0usize;
    let mut last_job_at = Instant::now();

    while inner.active.load(Ordering::Acquire) {
        let job = {
            let queues = inner.queues.lock();
            let n = queues.len();
            if n == 0 {
                None
            } else {
                let mut found = None;
                for step in 0..n {
                    let idx = (round_robin + step) % n;
                    if let Some(job) = queues[idx].fetch_job() {
                        round_robin = idx + 1;
                        found = Some(job);
                        break;
                    }
                }
                found
            }
        };

        match job {
            Some(job) => {
                last_job_at = Instant::now();
                consume(job);
            }
            None => idle(&inner, &mut last_job_at),
        }
    }

    if let Some(hook) = inner.on_disable.lock().take() {
        hook();
    }
    qsbr::unregister_thread();
}

/// A worker thread: constructed idle, wired up with target queues and
/// lifecycle hooks, then enabled to start dispatching. Disabling and
/// dropping joins the underlying OS thread.
pub struct Worker {
    inner: Arc<Inner>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    pub(crate) fn new(name: String, sleep_threshold: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                queues: Mutex::new(Vec::with_capacity(MAX_TARGETS)),
                active: AtomicBool::new(false),
                sleep_threshold,
                on_enable: Mutex::new(None),
                on_disable: Mutex::new(None),
            }),
            thread: None,
        }
    }

    /// Subscribe this worker to `queue`. At most [`MAX_TARGETS`] may be
    /// registered.
    ///
    /// # Panics
    /// Panics if called after [`Worker::enable`] has already started the
    /// dispatch thread, or if already at [`MAX_TARGETS`] queues.
    pub fn add_assignment(&self, queue: Arc<dyn JobQueue>) {
        assert!(
            !self.inner.active.load(Ordering::Acquire),
            "jobgraph: cannot add a queue assignment to a running worker"
        );
        let mut queues = self.inner.queues.lock();
        assert!(
            queues.len() < MAX_TARGETS,
            "jobgraph: worker already has the maximum number of target queues"
        );
        queue.register_assignee();
        queues.push(queue);
    }

    pub fn on_enable<F: FnOnce() + Send + 'static>(&self, hook: F) {
        *self.inner.on_enable.lock() = Some(Box::new(hook));
    }

    pub fn on_disable<F: FnOnce() + Send + 'static>(&self, hook: F) {
        *self.inner.on_disable.lock() = Some(Box::new(hook));
    }

    /// Spawn the dispatch thread. A no-op if already enabled.
    pub fn enable(&mut self) {
        if self.inner.active.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = self.inner.clone();
        let name = inner.name.clone();
        self.thread = Some(
            std::thread::Builder::new()
                .name(name)
                .spawn(move || run(inner))
                .expect("jobgraph: failed to spawn worker thread"),
        );
    }

    /// Signal the dispatch loop to stop after its current iteration. Does
    /// not block; join happens on drop.
    pub fn disable(&self) {
        self.inner.active.store(false, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.disable();
        if let Some(thread) = self.thread.take() {
            thread.join().ok();
        }
    }
}
