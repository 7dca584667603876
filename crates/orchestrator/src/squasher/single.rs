use super::{SquasherEvent, SquasherEventsSender};
use crate::{metrics::SquasherMetrics, work::WorkUnit, BackfillError, MissingRanges};
use backfill_primitives::{BlockNumber, BlockRange, BlockRanges};
use backfill_storage::{KvStore, SnapshotFile, StoreConfig, StoreError};
use backfill_tasks::{TaskError, TaskGroup};
use futures::future::try_join_all;
use std::{fmt, mem, time::Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Lifecycle of a [`Squasher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SquasherState {
    /// Waiting for partials.
    Idle,
    /// Merging a batch.
    Squashing,
    /// Target block reached.
    Done,
    /// A merge or a storage operation failed.
    Failed,
}

/// What a squasher hands back once its input is closed.
#[derive(Debug)]
pub struct SquasherOutput {
    /// Running store.
    pub store: KvStore,
    /// Block the store has reached.
    pub next_expected_start: BlockNumber,
    /// Block the store had to reach.
    pub target_end: BlockNumber,
    /// Partials received but never merged.
    pub pending: BlockRanges,
}

impl SquasherOutput {
    /// Returns `true` if the store reached its target.
    pub fn is_done(&self) -> bool {
        self.pending.is_empty() && self.next_expected_start >= self.target_end
    }

    /// Describes what the store is missing.
    pub fn missing_ranges(&self) -> MissingRanges {
        MissingRanges {
            module: self.store.name().to_string(),
            next_expected_start: self.next_expected_start,
            target_end: self.target_end,
            pending: self.pending.clone(),
        }
    }
}

/// A squasher that stopped on an error.
#[derive(Debug, thiserror::Error)]
#[error("{missing}: {source}")]
pub struct SquasherError {
    /// What the store was still missing when it stopped.
    pub missing: MissingRanges,
    /// Cause.
    #[source]
    pub source: BackfillError,
}

impl SquasherError {
    /// Returns `true` if the squasher stopped because the request was cancelled.
    pub const fn is_cancelled(&self) -> bool {
        self.source.is_cancelled()
    }
}

/// Merges the partial snapshots of one store into its running state.
///
/// Partials are merged in ascending, contiguous order. A partial arriving ahead of the cursor
/// waits in `pending` until the gap is filled. Once the target block is reached, a complete
/// snapshot is written at the target and the merged partials are deleted after it. Storage
/// operations run on an internal task group, so merging does not wait for them.
pub struct Squasher {
    store: KvStore,
    pending: BlockRanges,
    /// Partials merged into the store and not yet covered by a complete snapshot.
    merged: BlockRanges,
    next_expected_start: BlockNumber,
    target_end: BlockNumber,
    interval: u64,
    state: SquasherState,
    events: SquasherEventsSender,
    io: TaskGroup<StoreError>,
    metrics: SquasherMetrics,
}

impl fmt::Debug for Squasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Squasher")
            .field("module", &self.store.name())
            .field("pending", &self.pending)
            .field("next_expected_start", &self.next_expected_start)
            .field("target_end", &self.target_end)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Squasher {
    /// Creates the squasher of `unit`, loading its initial complete snapshot.
    ///
    /// Partials already present in storage are merged when [`Squasher::run`] starts.
    pub async fn load(
        config: StoreConfig,
        unit: &WorkUnit,
        interval: u64,
        io_concurrency: usize,
        events: SquasherEventsSender,
    ) -> Result<Self, BackfillError> {
        let store = match unit.initial_complete_range {
            Some(range) => config
                .load_full(range.end())
                .await
                .map_err(|err| BackfillError::store(config.name(), Some(range), err))?,
            None => config.new_full_kv(),
        };
        let metrics = SquasherMetrics::new_with_labels(&[("module", unit.module.clone())]);
        metrics.next_expected_start.set(unit.next_expected_start() as f64);
        debug!(
            target: "backfill::squasher",
            module = %unit.module,
            start = unit.next_expected_start(),
            target = unit.work_up_to,
            keys = store.len(),
            "Loaded running store"
        );

        Ok(Self {
            store,
            pending: unit.partials_present.clone(),
            merged: BlockRanges::new(),
            next_expected_start: unit.next_expected_start(),
            target_end: unit.work_up_to,
            interval: interval.max(1),
            state: SquasherState::Idle,
            events,
            io: TaskGroup::new("squasher_io", io_concurrency),
            metrics,
        })
    }

    /// Store module.
    pub fn module(&self) -> &str {
        self.store.name()
    }

    /// Current state.
    pub const fn state(&self) -> SquasherState {
        self.state
    }

    /// Block the running store has reached.
    pub const fn next_expected_start(&self) -> BlockNumber {
        self.next_expected_start
    }

    /// Partials waiting for a gap to be filled.
    pub const fn pending(&self) -> &BlockRanges {
        &self.pending
    }

    fn is_done(&self) -> bool {
        self.pending.is_empty() && self.next_expected_start >= self.target_end
    }

    /// Merges partials received on `input` until it is closed, then waits for pending storage
    /// operations.
    ///
    /// On failure the error reports how far the store got.
    pub async fn run(
        mut self,
        mut input: mpsc::Receiver<BlockRanges>,
        cancel: CancellationToken,
    ) -> Result<SquasherOutput, SquasherError> {
        let result = self.process(&mut input, &cancel).await;
        let Self { store, pending, next_expected_start, target_end, io, .. } = self;
        let output = SquasherOutput { store, next_expected_start, target_end, pending };
        match result {
            Err(source) => {
                if source.is_cancelled() {
                    // let deletes and snapshot writes already started finish
                    let _ = io.wait().await;
                }
                Err(SquasherError { missing: output.missing_ranges(), source })
            }
            Ok(()) => match io.wait().await {
                Ok(()) => Ok(output),
                Err(err) => Err(SquasherError {
                    missing: output.missing_ranges(),
                    source: io_error(output.store.name(), err),
                }),
            },
        }
    }

    async fn process(
        &mut self,
        input: &mut mpsc::Receiver<BlockRanges>,
        cancel: &CancellationToken,
    ) -> Result<(), BackfillError> {
        // partials found in storage when the request started
        self.squash(BlockRanges::new()).await?;
        loop {
            let ranges = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BackfillError::Cancelled),
                ranges = input.recv() => match ranges {
                    Some(ranges) => ranges,
                    None => return Ok(()),
                },
            };
            self.squash(ranges).await?;
        }
    }

    /// Adds `ranges` to the pending partials and merges everything contiguous to the cursor.
    async fn squash(&mut self, ranges: BlockRanges) -> Result<(), BackfillError> {
        let was_done = self.state == SquasherState::Done;
        self.state = SquasherState::Squashing;
        let result = self.squash_batch(ranges).await;
        self.state = match &result {
            Err(_) => SquasherState::Failed,
            Ok(()) if self.is_done() => SquasherState::Done,
            Ok(()) => SquasherState::Idle,
        };
        if self.state == SquasherState::Done && !was_done {
            debug!(target: "backfill::squasher", module = %self.module(), end = self.next_expected_start, "Store complete");
            let _ = self.events.send(SquasherEvent::Completed {
                module: self.module().to_string(),
                end: self.next_expected_start,
            });
        }
        result
    }

    async fn squash_batch(&mut self, ranges: BlockRanges) -> Result<(), BackfillError> {
        self.pending.extend(ranges);
        self.pending.sort();

        while let Some(&range) = self.pending.first() {
            if range.start() < self.next_expected_start {
                return Err(BackfillError::NonContiguous {
                    module: self.module().to_string(),
                    range,
                    next_expected_start: self.next_expected_start,
                })
            }
            if range.start() > self.next_expected_start {
                break
            }
            self.merge(range).await?;
            self.pending.pop_front();
            let _ =
                self.events.send(SquasherEvent::Merged { module: self.module().to_string(), range });
        }
        self.metrics.pending_ranges.set(self.pending.len() as f64);

        if self.is_done() && !self.merged.is_empty() {
            self.persist(self.next_expected_start).await?;
        }
        match self.io.take_error() {
            Some(err) => Err(io_error(self.module(), err)),
            None => Ok(()),
        }
    }

    async fn merge(&mut self, range: BlockRange) -> Result<(), BackfillError> {
        let config = self.store.config().clone();
        let started = Instant::now();
        let partial = config
            .load_partial(range)
            .await
            .map_err(|err| BackfillError::store(config.name(), Some(range), err))?;
        self.store
            .merge(&partial)
            .map_err(|err| BackfillError::store(config.name(), Some(range), err))?;
        self.next_expected_start = range.end();
        self.merged.push(range);
        trace!(target: "backfill::squasher", module = %config.name(), %range, keys = partial.len(), "Merged partial");

        self.metrics.merge_duration_seconds.record(started.elapsed().as_secs_f64());
        self.metrics.partials_merged.increment(1);
        self.metrics.blocks_merged.increment(range.size());
        self.metrics.next_expected_start.set(self.next_expected_start as f64);
        Ok(())
    }

    /// Writes the complete snapshot at `end`, then deletes the partials it covers.
    ///
    /// Off the snapshot grid no complete snapshot is written: aligned partials stay in storage
    /// for a later request, the trailing one is deleted.
    async fn persist(&mut self, end: BlockNumber) -> Result<(), BackfillError> {
        let merged = mem::take(&mut self.merged);
        let config = self.store.config().clone();
        let interval = self.interval;

        let file = self.store.snapshot_file(end).filter(|_| end % interval == 0);
        let Some(file) = file else {
            debug!(target: "backfill::squasher", module = %self.module(), end, "Target off the snapshot grid, keeping aligned partials");
            for range in merged.into_iter().filter(|range| range.end() % interval != 0) {
                let config = config.clone();
                self.io.spawn(async move { config.delete(SnapshotFile::partial(range)).await }).await;
            }
            return Ok(())
        };

        let bytes =
            self.store.encode().map_err(|err| BackfillError::store(self.module(), None, err))?;
        debug!(target: "backfill::squasher", module = %self.module(), %file, keys = self.store.len(), partials = merged.len(), "Writing complete snapshot");
        self.io
            .spawn(async move {
                config.objects().write(&file.filename(), bytes).await?;
                try_join_all(
                    merged.into_iter().map(|range| config.delete(SnapshotFile::partial(range))),
                )
                .await?;
                Ok::<_, StoreError>(())
            })
            .await;
        self.metrics.snapshots_written.increment(1);
        Ok(())
    }
}

fn io_error(module: &str, err: TaskError<StoreError>) -> BackfillError {
    match err {
        TaskError::Failed(err) => BackfillError::store(module, None, err),
        TaskError::Panicked { message, .. } => {
            BackfillError::Panicked { module: module.to_string(), message }
        }
    }
}
