//! Streams cached map outputs below the linear handoff block, in block order.

use crate::{
    metrics::ReaderMetrics,
    response::{BlockScopedData, Clock, Response, ResponseSender},
    BackfillError,
};
use backfill_primitives::{BlockNumber, BlockRange, Segmenter};
use backfill_storage::{ExecOutputCache, OutputFile, OutputItem};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Reads the output cache segment by segment, waiting for segments still being produced.
#[derive(Debug)]
pub struct LinearOutputReader {
    cache: ExecOutputCache,
    segmenter: Segmenter,
    range: BlockRange,
    poll_interval: Duration,
    responses: ResponseSender,
}

impl LinearOutputReader {
    /// Creates a reader streaming `range` from `cache`, whose files follow `segmenter`.
    pub fn new(
        cache: ExecOutputCache,
        segmenter: Segmenter,
        range: BlockRange,
        poll_interval: Duration,
        responses: ResponseSender,
    ) -> Self {
        Self { cache, segmenter, range, poll_interval, responses }
    }

    /// Streams every cached block of the range. Returns the last block sent.
    pub async fn run(self, cancel: CancellationToken) -> Result<Option<BlockNumber>, BackfillError> {
        let metrics = ReaderMetrics::default();
        let mut last_sent = None;
        debug!(target: "backfill::reader", module = %self.cache.module(), range = %self.range, "Starting linear reader");

        for segment in self.segmenter.iter().filter(|segment| segment.end() > self.range.start()) {
            let file = self.load(segment, &cancel, &metrics).await?;
            metrics.segments_read.increment(1);

            for item in file.into_sorted_items() {
                if item.block_num < self.range.start() {
                    continue
                }
                if item.block_num >= self.range.end() {
                    return Ok(last_sent)
                }
                if last_sent.is_some_and(|last| item.block_num <= last) {
                    trace!(target: "backfill::reader", block = item.block_num, "Skipping duplicate block");
                    continue
                }
                let block = item.block_num;
                let response = Response::BlockScopedData(self.block_scoped_data(item));
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(BackfillError::Cancelled),
                    sent = self.responses.send(response) => sent?,
                }
                metrics.blocks_sent.increment(1);
                last_sent = Some(block);
            }
        }
        debug!(target: "backfill::reader", module = %self.cache.module(), ?last_sent, "Linear reader done");
        Ok(last_sent)
    }

    async fn load(
        &self,
        segment: BlockRange,
        cancel: &CancellationToken,
        metrics: &ReaderMetrics,
    ) -> Result<OutputFile, BackfillError> {
        let mut misses = 0u64;
        loop {
            if cancel.is_cancelled() {
                return Err(BackfillError::Cancelled)
            }
            match self.cache.load(segment).await {
                Ok(file) => return Ok(file),
                Err(err) if err.is_not_found() => {
                    misses += 1;
                    metrics.segment_misses.increment(1);
                    if misses == 1 {
                        debug!(target: "backfill::reader", %segment, "Segment not cached yet");
                    } else {
                        warn!(target: "backfill::reader", %segment, misses, "Still waiting for segment");
                    }
                }
                Err(err) => {
                    return Err(BackfillError::store(self.cache.module(), Some(segment), err))
                }
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BackfillError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    fn block_scoped_data(&self, item: OutputItem) -> BlockScopedData {
        BlockScopedData {
            clock: Clock { id: item.block_id, number: item.block_num, timestamp: item.timestamp },
            cursor: item.cursor,
            module: self.cache.module().to_string(),
            payload: item.payload,
        }
    }
}
