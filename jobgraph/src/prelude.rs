//! Convenience re-export of the surface most callers need.
//!
//! ```
//! use jobgraph::prelude::*;
//! ```

pub use crate::allocator::PoolExhausted;
pub use crate::batch::{buffer, dense_output_buffer, BatchBuffer, BatchJob, Process, MAX_SLICES};
pub use crate::graph::JobMetrics;
pub use crate::handler::JobHandler;
pub use crate::job::{EnableOutcome, Job};
pub use crate::qsbr::{self, CriticalSection};
pub use crate::queue::{AsyncQueue, JobQueue, SyncQueue};
pub use crate::worker::{current_job, current_worker_name, Worker, MAX_TARGETS};
