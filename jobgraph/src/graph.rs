//! Optional per-job timing metadata used to drive `SyncQueue` priority.
//!
//! Grounded on gdul's `tracking/job_info.h` / `job_info.cpp`: a job's
//! "propagation time" is the largest, over its dependants, of that
//! dependant's own propagation estimate plus this job's last observed
//! runtime -- lazily maintained with a CAS-loop max-accumulation so that
//! concurrent dependants racing to report don't need a lock. `time_set.h`'s
//! bucketed history is not carried over; a single exponential-ish estimate is
//! enough for the scheduler's purposes (priority ordering, not profiling).

use std::sync::atomic::{AtomicU32, Ordering};

/// Per-job timing record. Attaching one to a job via `JobHandler::make_job`
/// opts that job into priority-aware scheduling on a `SyncQueue`; jobs
/// without one sort FIFO-like (priority `0.0`) among themselves.
#[derive(Default)]
pub struct JobMetrics {
    last_runtime: AtomicU32,
    propagation_estimate: AtomicU32,
}

impl JobMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store_runtime(&self, seconds: f32) {
        self.last_runtime.store(seconds.to_bits(), Ordering::Release);
    }

    fn last_runtime(&self) -> f32 {
        f32::from_bits(self.last_runtime.load(Ordering::Acquire))
    }

    /// Called once per dependant when a job finishes and detaches its
    /// children: folds `dependant_estimate` (the dependant's own propagation
    /// estimate) plus this job's last runtime into this job's running
    /// maximum.
    pub fn accumulate_dependant_time(&self, dependant_estimate: f32) {
        let candidate = dependant_estimate + self.last_runtime();
        let mut current = self.propagation_estimate.load(Ordering::Acquire);
        loop {
            let current_value = f32::from_bits(current);
            if current_value >= candidate {
                return;
            }
            match self.propagation_estimate.compare_exchange_weak(
                current,
                candidate.to_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn propagation_estimate(&self) -> f32 {
        f32::from_bits(self.propagation_estimate.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulation_keeps_the_maximum() {
        let metrics = JobMetrics::new();
        metrics.store_runtime(1.0);
        metrics.accumulate_dependant_time(2.0);
        metrics.accumulate_dependant_time(0.5);
        assert_eq!(metrics.propagation_estimate(), 3.0);
    }
}
