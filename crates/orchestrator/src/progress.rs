//! Rate-limited progress reporting.

use crate::{
    response::{ModuleProgress, Response, ResponseSender},
    work::{Job, WorkPlan},
    BackfillError,
};
use backfill_primitives::{BlockRange, BlockRanges};
use std::{collections::BTreeMap, time::Duration};
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug, Default)]
struct ModuleState {
    completed: BlockRanges,
    running: Vec<BlockRange>,
}

impl ModuleState {
    fn complete(&mut self, range: BlockRange) {
        self.completed.push(range);
        self.completed.sort();
        self.completed = self.completed.merged();
    }
}

/// Tracks completed and running ranges of every module and reports them to the caller.
///
/// Bursts of events are coalesced: at most one message is sent per interval, and the latest
/// state is sent by [`ProgressEmitter::flush`] once the interval has elapsed.
#[derive(Debug)]
pub struct ProgressEmitter {
    modules: BTreeMap<String, ModuleState>,
    responses: ResponseSender,
    interval: Duration,
    last_sent: Option<Instant>,
    dirty: bool,
}

impl ProgressEmitter {
    /// Creates an emitter seeded with what storage already holds.
    pub fn new(plan: &WorkPlan, responses: ResponseSender, interval: Duration) -> Self {
        let mut modules = BTreeMap::new();
        for unit in &plan.stores {
            modules.insert(
                unit.module.clone(),
                ModuleState { completed: unit.completed_ranges(), running: Vec::new() },
            );
        }
        if let Some(exec_out) = &plan.exec_out {
            modules.insert(
                exec_out.module.clone(),
                ModuleState { completed: exec_out.present.merged(), running: Vec::new() },
            );
        }
        Self { modules, responses, interval, last_sent: None, dirty: false }
    }

    /// Sends the initial snapshot, waiting for the caller to accept it.
    pub async fn send_initial(&mut self) -> Result<(), BackfillError> {
        self.responses.send(Response::Progress(self.snapshot())).await?;
        self.last_sent = Some(Instant::now());
        self.dirty = false;
        Ok(())
    }

    /// A job was handed to a worker.
    pub fn job_started(&mut self, job: &Job) {
        self.module(&job.module).running.push(job.range);
        self.emit();
    }

    /// A job ended. `written` lists the output segments it produced, empty for store jobs
    /// whose progress is reported by their squasher.
    pub fn job_finished(&mut self, job: &Job, written: &BlockRanges) {
        let state = self.module(&job.module);
        state.running.retain(|range| *range != job.range);
        for range in written {
            state.complete(*range);
        }
        self.emit();
    }

    /// A squasher merged `range` of `module`.
    pub fn merged(&mut self, module: &str, range: BlockRange) {
        self.module(module).complete(range);
        self.emit();
    }

    /// Sends the latest state if it changed and the interval has elapsed.
    pub fn flush(&mut self) {
        if self.dirty {
            self.emit();
        }
    }

    /// When a pending update can be flushed, if any.
    pub fn next_flush(&self) -> Option<Instant> {
        if !self.dirty {
            return None
        }
        Some(self.last_sent.map_or_else(Instant::now, |last| last + self.interval))
    }

    /// Sends the latest state if it was not sent yet, waiting for the caller.
    pub async fn finish(&mut self) -> Result<(), BackfillError> {
        if self.dirty {
            self.responses.send(Response::Progress(self.snapshot())).await?;
            self.dirty = false;
        }
        Ok(())
    }

    /// Per-module progress, by module name.
    pub fn snapshot(&self) -> Vec<ModuleProgress> {
        self.modules
            .iter()
            .map(|(name, state)| {
                let mut running: BlockRanges = state.running.iter().copied().collect();
                running.sort();
                ModuleProgress {
                    name: name.clone(),
                    completed_ranges: state.completed.clone(),
                    running_ranges: running,
                }
            })
            .collect()
    }

    fn module(&mut self, module: &str) -> &mut ModuleState {
        self.modules.entry(module.to_string()).or_default()
    }

    fn emit(&mut self) {
        self.dirty = true;
        let now = Instant::now();
        if self.last_sent.is_some_and(|last| now < last + self.interval) {
            return
        }
        // a full response stream keeps the update pending until the next interval
        self.last_sent = Some(now);
        if self.responses.try_send(Response::Progress(self.snapshot())) {
            trace!(target: "backfill::scheduler", "Sent progress");
            self.dirty = false;
        } else {
            trace!(target: "backfill::scheduler", "Response stream full, progress deferred");
        }
    }
}
