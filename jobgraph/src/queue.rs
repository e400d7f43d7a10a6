//! Job queues: the hand-off point between `enable()`/dependency-resolution
//! and worker dispatch.
//!
//! Two flavors, matching the spec's deferred choice of internal data
//! structure for each:
//!
//! - [`AsyncQueue`] is a relaxed FIFO -- ordering across producers is not
//!   guaranteed, only that a single producer's jobs come out in submission
//!   order. Backed by `crossbeam::queue::SegQueue`, already reachable through
//!   the `crossbeam` facade dependency.
//! - [`SyncQueue`] orders by propagation-time priority (see
//!   [`crate::graph`]), highest first. Backed by `parking_lot::Mutex` over a
//!   `BinaryHeap`; a lock-free skip list was the other option gdul's own
//!   `job_queue.h` comment block leaves open, but a short critical section
//!   around a heap is the simpler idiomatic choice and parking_lot is
//!   already part of the teacher's dependency stack.

use crate::job::JobImpl;
use crossbeam::queue::SegQueue;
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Common interface workers dispatch against and jobs submit into.
pub trait JobQueue: Send + Sync {
    fn submit_job(self: Arc<Self>, job: Arc<JobImpl>);
    fn fetch_job(&self) -> Option<Arc<JobImpl>>;

    /// Called once by a worker when it subscribes to this queue, so
    /// `assignee_count` can inform idle heuristics (e.g. a queue with many
    /// assignees can afford a shorter sleep threshold per worker).
    fn register_assignee(&self);
    fn assignee_count(&self) -> usize;
}

/// Relaxed-FIFO job queue.
pub struct AsyncQueue {
    jobs: SegQueue<Arc<JobImpl>>,
    assignees: std::sync::atomic::AtomicUsize,
}

impl AsyncQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            jobs: SegQueue::new(),
            assignees: std::sync::atomic::AtomicUsize::new(0),
        })
    }
}

impl Default for AsyncQueue {
    fn default() -> Self {
        Self {
            jobs: SegQueue::new(),
            assignees: std::sync::atomic::AtomicUsize::new(0),
        }
    }
}

impl JobQueue for AsyncQueue {
    fn submit_job(self: Arc<Self>, job: Arc<JobImpl>) {
        self.jobs.push(job);
    }

    fn fetch_job(&self) -> Option<Arc<JobImpl>> {
        self.jobs.pop()
    }

    fn register_assignee(&self) {
        self.assignees.fetch_add(1, Ordering::Relaxed);
    }

    fn assignee_count(&self) -> usize {
        self.assignees.load(Ordering::Relaxed)
    }
}

struct FloatOrd(f32);

impl PartialEq for FloatOrd {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for FloatOrd {}
impl PartialOrd for FloatOrd {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for FloatOrd {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.0.partial_cmp(&other.0).unwrap_or(CmpOrdering::Equal)
    }
}

struct Entry {
    priority: FloatOrd,
    sequence: u64,
    job: Arc<JobImpl>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Higher priority first; break ties by submission order (earlier first)
        // so that equal-priority jobs still behave FIFO-like.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Priority-ordered job queue, keyed on propagation-time estimate.
pub struct SyncQueue {
    heap: Mutex<BinaryHeap<Entry>>,
    sequence: AtomicU64,
    assignees: std::sync::atomic::AtomicUsize,
}

impl SyncQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            heap: Mutex::new(BinaryHeap::new()),
            sequence: AtomicU64::new(0),
            assignees: std::sync::atomic::AtomicUsize::new(0),
        })
    }
}

impl JobQueue for SyncQueue {
    fn submit_job(self: Arc<Self>, job: Arc<JobImpl>) {
        let priority = job.priority();
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.heap.lock().push(Entry {
            priority: FloatOrd(priority),
            sequence,
            job,
        });
    }

    fn fetch_job(&self) -> Option<Arc<JobImpl>> {
        self.heap.lock().pop().map(|entry| entry.job)
    }

    fn register_assignee(&self) {
        self.assignees.fetch_add(1, Ordering::Relaxed);
    }

    fn assignee_count(&self) -> usize {
        self.assignees.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_ord_matches_partial_cmp() {
        assert!(FloatOrd(2.0) > FloatOrd(1.0));
        assert!(FloatOrd(1.0) < FloatOrd(2.0));
        assert_eq!(FloatOrd(1.0).cmp(&FloatOrd(1.0)), CmpOrdering::Equal);
    }
}
