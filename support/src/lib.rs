//! Ambient support crate shared by `jobgraph`: structured logging with pluggable
//! sinks and a thread name registry, used for worker diagnostics.
//!
//! Kept separate from `jobgraph` itself so the scheduler core has no opinion on
//! where its log lines end up; a host application registers its own [`logger::Sink`].

pub mod logger;
pub mod sync;
pub mod thread;
