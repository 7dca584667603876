//! Dispatches jobs to workers as their parent stores become ready.

use crate::{
    error::panic_message,
    metrics::SchedulerMetrics,
    progress::ProgressEmitter,
    squasher::{MultiSquasher, SquasherEvent, SquasherEventsReceiver},
    work::{Job, JobKind, JobQueue},
    worker::{Subrequest, WorkResult, Worker, WorkerError, WorkerPool},
    BackfillError,
};
use backfill_config::BackfillConfig;
use backfill_primitives::{BlockRanges, ModuleGraph};
use futures::FutureExt;
use std::{
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

/// What a worker task hands back.
#[derive(Debug)]
struct JobOutcome {
    job: Job,
    worker_id: usize,
    elapsed: Duration,
    result: Result<WorkResult, WorkerError>,
}

/// Workers borrowed by a scheduler. Every worker goes back to the pool when dropped, including
/// the ones whose task was aborted.
#[derive(Debug)]
struct Lease {
    pool: Arc<WorkerPool>,
    busy: HashMap<usize, Worker>,
}

impl Lease {
    /// Keeps `worker` until it is released and returns a handle for its task.
    fn hold(&mut self, worker: Worker) -> Worker {
        let handle = worker.clone();
        self.busy.insert(worker.id(), worker);
        handle
    }

    fn release(&mut self, worker_id: usize) {
        if let Some(worker) = self.busy.remove(&worker_id) {
            self.pool.give(worker);
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        for (_, worker) in self.busy.drain() {
            self.pool.give(worker);
        }
    }
}

/// Runs the jobs of a request on a [`WorkerPool`].
///
/// A job is dispatched once every parent store has been squashed up to its start block.
/// Retryable failures put the job back in the queue until `retry_max_attempts` is reached, any
/// other failure cancels the request.
#[derive(Debug)]
pub struct Scheduler {
    queue: JobQueue,
    pool: Arc<WorkerPool>,
    modules: Arc<ModuleGraph>,
    trace_id: String,
    parallel: usize,
    receive_timeout: Duration,
    retry_max_attempts: u32,
    metrics: SchedulerMetrics,
}

impl Scheduler {
    /// Creates a scheduler for the jobs of `queue`.
    pub fn new(
        queue: JobQueue,
        pool: Arc<WorkerPool>,
        modules: Arc<ModuleGraph>,
        trace_id: String,
        config: &BackfillConfig,
    ) -> Self {
        let parallel = config.parallel_subrequests.min(pool.size()).max(1);
        Self {
            queue,
            pool,
            modules,
            trace_id,
            parallel,
            receive_timeout: config.worker_receive_timeout,
            retry_max_attempts: config.retry_max_attempts.max(1),
            metrics: SchedulerMetrics::default(),
        }
    }

    /// Runs every job to completion.
    ///
    /// Squasher events move parents forward. Returns early with [`BackfillError::Cancelled`] if
    /// `cancel` fires.
    pub async fn run(
        mut self,
        squashers: &MultiSquasher,
        events: &mut SquasherEventsReceiver,
        progress: &mut ProgressEmitter,
        cancel: &CancellationToken,
    ) -> Result<(), BackfillError> {
        info!(target: "backfill::scheduler", jobs = self.queue.len(), parallel = self.parallel, "Scheduling jobs");
        self.metrics.jobs_planned.increment(self.queue.len() as u64);

        let mut lease = Lease { pool: self.pool.clone(), busy: HashMap::new() };
        let mut in_flight: JoinSet<JobOutcome> = JoinSet::new();
        let mut events_open = true;

        loop {
            if self.queue.is_empty() && in_flight.is_empty() {
                break
            }
            if in_flight.is_empty() && !events_open && !self.queue.has_ready() {
                warn!(target: "backfill::scheduler", pending = self.queue.len(), "No job can run anymore");
                break
            }
            let can_dispatch = in_flight.len() < self.parallel && self.queue.has_ready();
            let flush_at = progress.next_flush();

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BackfillError::Cancelled),
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    let outcome = match joined {
                        Ok(outcome) => outcome,
                        Err(err) => {
                            cancel.cancel();
                            return Err(BackfillError::Panicked {
                                module: "scheduler".to_string(),
                                message: err.to_string(),
                            })
                        }
                    };
                    lease.release(outcome.worker_id);
                    self.metrics.jobs_in_flight.set(in_flight.len() as f64);
                    if let Err(err) = self.on_outcome(outcome, squashers, progress).await {
                        cancel.cancel();
                        return Err(err)
                    }
                }
                event = events.recv(), if events_open => match event {
                    Some(event) => self.on_event(event, progress),
                    None => events_open = false,
                },
                worker = self.pool.borrow(), if can_dispatch => {
                    let Some(worker) = worker else { continue };
                    match self.queue.pop_ready() {
                        Some(job) => {
                            let worker = lease.hold(worker);
                            progress.job_started(&job);
                            self.dispatch(job, worker, &mut in_flight);
                            self.metrics.jobs_in_flight.set(in_flight.len() as f64);
                        }
                        None => self.pool.give(worker),
                    }
                }
                _ = sleep_until(flush_at), if flush_at.is_some() => progress.flush(),
            }
        }

        debug!(target: "backfill::scheduler", "All jobs done");
        Ok(())
    }

    fn dispatch(&self, job: Job, worker: Worker, in_flight: &mut JoinSet<JobOutcome>) {
        let request = Subrequest {
            trace_id: self.trace_id.clone(),
            modules: self.modules.clone(),
            output_module: job.module.clone(),
            kind: job.kind,
            start_block: job.range.start(),
            stop_block: job.range.end(),
            partial_mode: true,
        };
        let span = tracing::debug_span!(
            target: "backfill::scheduler",
            "subrequest",
            module = %job.module,
            range = %job.range,
            attempt = job.attempt,
            worker = worker.id(),
        );
        debug!(target: "backfill::scheduler", %job, attempt = job.attempt, worker = worker.id(), "Dispatching job");
        self.metrics.jobs_dispatched.increment(1);

        let receive_timeout = self.receive_timeout;
        in_flight.spawn(
            async move {
                let started = Instant::now();
                let result = AssertUnwindSafe(worker.work(request, receive_timeout))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|payload| Err(WorkerError::Panicked(panic_message(&*payload))));
                JobOutcome { job, worker_id: worker.id(), elapsed: started.elapsed(), result }
            }
            .instrument(span),
        );
    }

    async fn on_outcome(
        &mut self,
        outcome: JobOutcome,
        squashers: &MultiSquasher,
        progress: &mut ProgressEmitter,
    ) -> Result<(), BackfillError> {
        let JobOutcome { job, elapsed, result, .. } = outcome;
        let result = result.and_then(|result| check_coverage(&job, result));
        match result {
            Ok(WorkResult { written }) => {
                debug!(target: "backfill::scheduler", %job, %written, ?elapsed, "Job done");
                self.metrics.jobs_completed.increment(1);
                self.metrics.job_duration_seconds.record(elapsed.as_secs_f64());
                match job.kind {
                    JobKind::Store => {
                        progress.job_finished(&job, &BlockRanges::new());
                        squashers.squash(&job.module, written).await?;
                    }
                    JobKind::ExecOut => progress.job_finished(&job, &written),
                }
                Ok(())
            }
            Err(err) if err.is_retryable() && job.attempt + 1 < self.retry_max_attempts => {
                warn!(target: "backfill::scheduler", %job, attempt = job.attempt + 1, %err, "Retrying job");
                self.metrics.jobs_retried.increment(1);
                progress.job_finished(&job, &BlockRanges::new());
                self.queue.requeue(Job { attempt: job.attempt + 1, ..job });
                Ok(())
            }
            Err(source) => {
                self.metrics.jobs_failed.increment(1);
                Err(BackfillError::Worker {
                    module: job.module,
                    range: job.range,
                    attempts: job.attempt + 1,
                    source,
                })
            }
        }
    }

    fn on_event(&mut self, event: SquasherEvent, progress: &mut ProgressEmitter) {
        match event {
            SquasherEvent::Merged { module, range } => {
                self.queue.report_progress(&module, range.end());
                progress.merged(&module, range);
            }
            SquasherEvent::Completed { module, end } => {
                debug!(target: "backfill::scheduler", %module, end, "Store reached its target");
                self.queue.report_progress(&module, end);
            }
        }
    }
}

/// Every block of the job must be covered by a written file, otherwise dependents would wait
/// forever.
fn check_coverage(job: &Job, result: WorkResult) -> Result<WorkResult, WorkerError> {
    if result.written.merged() != BlockRanges::from(vec![job.range]) {
        return Err(WorkerError::InvalidTrailer {
            trailer: result.written.to_string(),
            cause: format!("written files do not cover {}", job.range),
        })
    }
    Ok(result)
}

async fn sleep_until(at: Option<tokio::time::Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backfill_primitives::BlockRange;

    fn job(start: u64, end: u64) -> Job {
        Job {
            module: "counter".into(),
            kind: JobKind::Store,
            range: BlockRange::new(start, end).unwrap(),
            required_parents: vec![],
            priority: 0,
            attempt: 0,
        }
    }

    #[test]
    fn written_files_must_cover_the_job() {
        let covered = WorkResult { written: "0-10,10-20".parse().unwrap() };
        assert!(check_coverage(&job(0, 20), covered).is_ok());

        let gap = WorkResult { written: "0-10".parse().unwrap() };
        let err = check_coverage(&job(0, 20), gap).unwrap_err();
        assert!(!err.is_retryable());
    }
}
