use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Scheduler operational metrics.
///
/// Counters and per-routine timings are updated as the scheduler runs; the
/// gauge fields (`ready_depth`, `registered`, `processor_utilization`) are
/// filled in when a snapshot is taken. Per-routine entries only cover
/// registered routines and are dropped when a routine is removed or finishes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerMetrics {
    /// Steps executed by routine name.
    pub steps_executed: HashMap<String, u64>,
    /// Average step duration by routine name.
    pub avg_step_duration: HashMap<String, Duration>,
    /// Last step time by routine name.
    pub last_run: HashMap<String, DateTime<Utc>>,
    /// Ready-queue depth per priority level, highest priority first.
    pub ready_depth: Vec<usize>,
    /// Routines currently registered.
    pub registered: usize,
    /// Share of processors currently running a routine (0.0 - 1.0).
    pub processor_utilization: f64,
    /// Accepted submissions.
    pub submitted: u64,
    /// Submissions rejected as duplicates, collisions, or during shutdown.
    pub rejected_submits: u64,
    /// Submissions whose priority had to be clamped.
    pub clamped_priorities: u64,
    /// Notify calls for registered routines.
    pub notifies: u64,
    /// Notifies that moved a routine out of DATA_WAIT.
    pub wakeups: u64,
    /// Successful removals.
    pub removals: u64,
    /// Routines that completed on their own.
    pub finished: u64,
    /// Steps executed across all routines, including deregistered ones.
    pub steps_total: u64,
}

impl SchedulerMetrics {
    /// Record one step of `routine`.
    pub fn record_step(&mut self, routine: &str, duration: Duration) {
        *self.steps_executed.entry(routine.to_string()).or_default() += 1;
        self.steps_total += 1;
        self.last_run.insert(routine.to_string(), Utc::now());

        let count = self.steps_executed[routine];
        let prev_avg = self
            .avg_step_duration
            .get(routine)
            .copied()
            .unwrap_or_default();

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let new_avg = if count == 1 {
            duration
        } else {
            let prev_nanos = prev_avg.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / count as f64;
            Duration::from_nanos(avg_nanos as u64)
        };

        self.avg_step_duration.insert(routine.to_string(), new_avg);
    }

    /// Total steps across all routines, including deregistered ones.
    pub fn total_steps(&self) -> u64 {
        self.steps_total
    }

    /// Drop the per-routine entries of a deregistered routine.
    pub fn forget(&mut self, routine: &str) {
        self.steps_executed.remove(routine);
        self.avg_step_duration.remove(routine);
        self.last_run.remove(routine);
    }
}
