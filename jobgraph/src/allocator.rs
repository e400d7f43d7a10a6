//! Bounded object pools for `JobImpl`, `JobNode` and `BatchJobImpl`.
//!
//! The original collaborator named by the job-handler's memory pool
//! interface is out of scope for this crate (see the crate-level docs): we
//! do not reimplement a slab allocator. What we do own is the *admission
//! control* those pools provided -- each job type is allocated against a
//! fixed per-thread capacity, matching the ring-buffer bound in the
//! teacher's `job_allocator.rs` (`Error::Exhausted` when a thread's
//! outstanding job count hits its cap).
//!
//! A permit is handed back to its pool only once quiescent-state-based
//! reclamation confirms no thread is still mid-critical-section from before
//! the owning object finished -- this protects readers that snapshot a raw,
//! non-owning pointer to a job or node for introspection (the `this_job`
//! thread-local during reentrant `work_until_*` calls, or a debug graph dump)
//! without holding a strong `Arc`.

use crate::qsbr;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::Arc;
use thread_local::ThreadLocal;

struct PendingReturn {
    item: qsbr::Item,
    count: usize,
}

struct Inner {
    capacity: usize,
    outstanding: ThreadLocal<Cell<usize>>,
    pending: ThreadLocal<RefCell<VecDeque<PendingReturn>>>,
}

/// A bounded pool of admission permits for one job-like type.
#[derive(Clone)]
pub struct Pool(Arc<Inner>);

/// Error returned when a pool's per-thread capacity is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolExhausted;

impl Pool {
    pub fn new(capacity: usize) -> Self {
        Self(Arc::new(Inner {
            capacity,
            outstanding: ThreadLocal::new(),
            pending: ThreadLocal::new(),
        }))
    }

    /// Acquire one permit, reclaiming any permits whose grace period has
    /// elapsed first.
    pub fn acquire(&self) -> Result<PoolTicket, PoolExhausted> {
        self.reclaim_pending();

        let cell = self.0.outstanding.get_or(|| Cell::new(0));
        if cell.get() >= self.0.capacity {
            return Err(PoolExhausted);
        }
        cell.set(cell.get() + 1);
        Ok(PoolTicket { pool: self.0.clone() })
    }

    fn reclaim_pending(&self) {
        let pending = self.0.pending.get_or(|| RefCell::new(VecDeque::new()));
        let mut pending = pending.borrow_mut();
        while let Some(front) = pending.front() {
            if qsbr::update(&front.item) {
                let front = pending.pop_front().unwrap();
                let cell = self.0.outstanding.get_or(|| Cell::new(0));
                cell.set(cell.get().saturating_sub(front.count));
            } else {
                break;
            }
        }
    }

    fn release(&self) {
        let item = qsbr::Item::new();
        let immediately_safe = qsbr::initialize(&item);
        if immediately_safe {
            let cell = self.0.outstanding.get_or(|| Cell::new(0));
            cell.set(cell.get().saturating_sub(1));
            return;
        }

        let pending = self.0.pending.get_or(|| RefCell::new(VecDeque::new()));
        pending.borrow_mut().push_back(PendingReturn { item, count: 1 });
    }
}

/// RAII permit handed out by [`Pool::acquire`]. Returning the permit to its
/// pool is deferred behind a QSBR grace period; see the module docs.
pub struct PoolTicket {
    pool: Arc<Inner>,
}

impl Drop for PoolTicket {
    fn drop(&mut self) {
        Pool(self.pool.clone()).release();
    }
}
