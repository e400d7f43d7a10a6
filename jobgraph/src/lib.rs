//! `jobgraph`: a work-stealing-adjacent, DAG-scheduled concurrent job system
//! with QSBR reclamation.
//!
//! A job is a work unit plus a dependency counter and an intrusive list of
//! dependants (see [`job`]/[`node`]). `enable()` releases a job into its
//! target queue ([`queue`]) once its dependencies resolve; a bank of
//! [`worker`]s drains queues and runs jobs, propagating completion through
//! the graph. [`batch`] builds a fork/process/join composite of plain jobs
//! over a container, for data-parallel work. [`qsbr`] underlies safe,
//! lock-free reclamation of dependee-list nodes inside [`allocator`]'s
//! admission pools. [`handler`] ties the pools and worker bank together
//! behind one entry point.
//!
//! Grounded throughout on `gdul` (original_source/), a C++ job-handler
//! library built around the same dependency-counter/intrusive-dependee-list
//! design; see `DESIGN.md` at the workspace root for the per-module
//! grounding ledger.
//!
//! ```
//! use jobgraph::prelude::*;
//! use std::sync::Arc;
//!
//! let handler = JobHandler::new();
//! let queue: Arc<dyn JobQueue> = AsyncQueue::new();
//! let mut worker = handler.make_worker("worker-0");
//! worker.add_assignment(queue.clone());
//! worker.enable();
//!
//! let job = handler.make_job(|_job| println!("hello from a job"), queue).unwrap();
//! job.enable();
//! job.wait_until_finished();
//! ```

pub mod allocator;
pub mod batch;
pub mod graph;
pub mod handler;
pub mod job;
pub mod node;
pub mod prelude;
pub mod qsbr;
pub mod queue;
pub mod worker;

pub use batch::{buffer, dense_output_buffer, BatchBuffer, BatchJob, Process, MAX_SLICES};
pub use graph::JobMetrics;
pub use handler::JobHandler;
pub use job::{EnableOutcome, Job};
pub use queue::{AsyncQueue, JobQueue, SyncQueue};
pub use worker::{current_job, current_worker_name, Worker, MAX_TARGETS};

#[cfg(test)]
mod tests;
