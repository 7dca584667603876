use backfill_primitives::{BlockNumber, BlockRange};
use std::{cmp::Reverse, collections::HashMap, fmt};

/// What a job produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Partial snapshots of a store module.
    Store,
    /// Cached outputs of the output map module.
    ExecOut,
}

/// A sub-request to run one module over one range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Module to run.
    pub module: String,
    /// What the job writes.
    pub kind: JobKind,
    /// Blocks to process.
    pub range: BlockRange,
    /// Stores whose squasher must have reached `range.start()` before the job runs.
    pub required_parents: Vec<String>,
    /// Number of stores depending on the module. Higher runs first.
    pub priority: usize,
    /// Attempts already made.
    pub attempt: u32,
}

impl Job {
    fn sort_key(&self) -> (Reverse<usize>, &str, BlockNumber) {
        (Reverse(self.priority), &self.module, self.range.start())
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.module, self.range)
    }
}

/// Pending jobs, in dispatch order, and the squasher progress gating them.
#[derive(Debug, Default)]
pub struct JobQueue {
    jobs: Vec<Job>,
    progress: HashMap<String, BlockNumber>,
}

impl JobQueue {
    /// Creates a queue. `progress` holds, per store, the block its squasher has reached.
    pub fn new(
        mut jobs: Vec<Job>,
        progress: impl IntoIterator<Item = (String, BlockNumber)>,
    ) -> Self {
        jobs.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        Self { jobs, progress: progress.into_iter().collect() }
    }

    /// Number of pending jobs.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Returns `true` if no job is pending.
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Pending jobs, in dispatch order.
    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    /// Block reached by the squasher of `module`.
    pub fn progress_of(&self, module: &str) -> Option<BlockNumber> {
        self.progress.get(module).copied()
    }

    /// Returns `true` if every parent of `job` has reached its start block.
    pub fn is_ready(&self, job: &Job) -> bool {
        job.required_parents
            .iter()
            .all(|parent| self.progress_of(parent).is_some_and(|done| done >= job.range.start()))
    }

    /// Returns `true` if some pending job can run.
    pub fn has_ready(&self) -> bool {
        self.jobs.iter().any(|job| self.is_ready(job))
    }

    /// Removes and returns the first job that can run.
    pub fn pop_ready(&mut self) -> Option<Job> {
        let idx = self.jobs.iter().position(|job| self.is_ready(job))?;
        Some(self.jobs.remove(idx))
    }

    /// Puts a job back at its place in the dispatch order.
    pub fn requeue(&mut self, job: Job) {
        let idx = self.jobs.partition_point(|other| other.sort_key() <= job.sort_key());
        self.jobs.insert(idx, job);
    }

    /// Records that the squasher of `module` has merged everything below `block`.
    pub fn report_progress(&mut self, module: &str, block: BlockNumber) {
        let done = self.progress.entry(module.to_string()).or_default();
        *done = (*done).max(block);
    }
}
