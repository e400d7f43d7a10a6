//! `JobNode`: the intrusive element of a dependee list.
//!
//! Grounded on `gdul::jh_detail::job_node` (`{ shared_ptr<job_node> next; shared_ptr<job_impl> job; }`),
//! translated from a manually refcounted pointer to an `Arc`-of-node chain. The
//! head of the chain lives on the parent [`crate::job::JobImpl`] as an
//! `ArcSwapOption<JobNode>` -- the direct analogue of the spec's "atomically
//! swappable shared reference" external interface.

use crate::allocator::PoolTicket;
use crate::job::JobImpl;
use std::sync::Arc;

/// One link in a parent job's dependee stack: points at the dependant job and
/// at the next node pushed before it.
///
/// Carries an (optional) admission ticket against the handler's node pool --
/// optional because a node created under pool exhaustion must still be
/// linked for correctness (a missing dependant would silently drop a real
/// dependency edge), so exhaustion here degrades the admission accounting
/// rather than the dependency graph itself.
pub struct JobNode {
    pub(crate) job: Arc<JobImpl>,
    pub(crate) next: Option<Arc<JobNode>>,
    _ticket: Option<PoolTicket>,
}

impl JobNode {
    pub(crate) fn new(
        job: Arc<JobImpl>,
        next: Option<Arc<JobNode>>,
        ticket: Option<PoolTicket>,
    ) -> Self {
        Self {
            job,
            next,
            _ticket: ticket,
        }
    }
}
