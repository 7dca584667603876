//! Backfill metrics
use metrics::{Counter, Gauge, Histogram};
use metrics_derive::Metrics;

/// Scheduler metrics
#[derive(Metrics, Clone)]
#[metrics(scope = "backfill.scheduler")]
pub(crate) struct SchedulerMetrics {
    /// Number of jobs planned
    pub(crate) jobs_planned: Counter,
    /// Number of jobs dispatched to a worker, retries included
    pub(crate) jobs_dispatched: Counter,
    /// Number of jobs that completed
    pub(crate) jobs_completed: Counter,
    /// Number of retried jobs
    pub(crate) jobs_retried: Counter,
    /// Number of jobs that failed for good
    pub(crate) jobs_failed: Counter,
    /// Sub-requests currently in flight
    pub(crate) jobs_in_flight: Gauge,
    /// Duration of successful sub-requests, in seconds
    pub(crate) job_duration_seconds: Histogram,
}

/// Squasher metrics, labelled by module
#[derive(Metrics, Clone)]
#[metrics(scope = "backfill.squasher")]
pub(crate) struct SquasherMetrics {
    /// Number of partial snapshots merged
    pub(crate) partials_merged: Counter,
    /// Number of blocks merged
    pub(crate) blocks_merged: Counter,
    /// Time spent loading and merging one partial, in seconds
    pub(crate) merge_duration_seconds: Histogram,
    /// Number of complete snapshots written
    pub(crate) snapshots_written: Counter,
    /// Partial ranges waiting for a gap to be filled
    pub(crate) pending_ranges: Gauge,
    /// Block the store has reached
    pub(crate) next_expected_start: Gauge,
}

/// Linear output reader metrics
#[derive(Metrics, Clone)]
#[metrics(scope = "backfill.reader")]
pub(crate) struct ReaderMetrics {
    /// Number of segments streamed
    pub(crate) segments_read: Counter,
    /// Number of blocks streamed
    pub(crate) blocks_sent: Counter,
    /// Number of polls of a segment not written yet
    pub(crate) segment_misses: Counter,
}
