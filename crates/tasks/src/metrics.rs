//! Task group metrics
use metrics::Counter;
use metrics_derive::Metrics;

/// Task group metrics
#[derive(Metrics, Clone)]
#[metrics(scope = "backfill.tasks")]
pub(crate) struct TaskGroupMetrics {
    /// Number of spawned tasks
    pub(crate) spawned_tasks: Counter,
    /// Number of tasks that finished successfully
    pub(crate) finished_tasks: Counter,
    /// Number of tasks that returned an error or panicked
    pub(crate) failed_tasks: Counter,
}

impl TaskGroupMetrics {
    pub(crate) fn inc_spawned(&self) {
        self.spawned_tasks.increment(1);
    }

    pub(crate) fn inc_finished(&self) {
        self.finished_tasks.increment(1);
    }

    pub(crate) fn inc_failed(&self) {
        self.failed_tasks.increment(1);
    }
}
