use crate::{error::SegmenterError, BlockNumber, BlockRange};

/// Fixed grid of `interval`-sized segments covering `[initial_block, handoff_block]`.
///
/// Segment `i` covers `[base + i * interval, base + (i + 1) * interval)` where
/// `base = initial_block - initial_block % interval`, clipped at its lower bound to
/// `initial_block` and at its upper bound to `handoff_block`.
///
/// When `handoff_block` is itself interval-aligned, the last counted segment starts at
/// `handoff_block` and is empty after clipping; [`Segmenter::range_of`] returns `None` for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segmenter {
    interval: u64,
    initial_block: BlockNumber,
    handoff_block: BlockNumber,
}

impl Segmenter {
    /// Creates a new segmenter. A `handoff_block` below `initial_block` is raised to it.
    ///
    /// # Panics
    ///
    /// If `interval` is zero.
    pub fn new(interval: u64, initial_block: BlockNumber, handoff_block: BlockNumber) -> Self {
        assert!(interval > 0, "segment interval must be positive");
        Self { interval, initial_block, handoff_block: handoff_block.max(initial_block) }
    }

    /// Segment size in blocks.
    pub const fn interval(&self) -> u64 {
        self.interval
    }

    /// Lower bound of the segmented span.
    pub const fn initial_block(&self) -> BlockNumber {
        self.initial_block
    }

    /// Upper bound of the segmented span.
    pub const fn handoff_block(&self) -> BlockNumber {
        self.handoff_block
    }

    /// Absolute index (from block zero) of the segment containing `initial_block`.
    pub const fn first_index(&self) -> u64 {
        self.initial_block / self.interval
    }

    /// Absolute index (from block zero) of the segment containing `handoff_block`.
    pub const fn last_index(&self) -> u64 {
        self.handoff_block / self.interval
    }

    /// Total number of segments.
    pub const fn count(&self) -> u64 {
        self.last_index() - self.first_index() + 1
    }

    /// Returns the `i`-th segment, clipped to the span.
    pub fn range_of(&self, index: u64) -> Option<BlockRange> {
        if index >= self.count() {
            return None
        }
        let absolute = self.first_index() + index;
        let start = (absolute * self.interval).max(self.initial_block);
        let end = absolute.saturating_add(1).saturating_mul(self.interval).min(self.handoff_block);
        BlockRange::new(start, end)
    }

    /// Returns the index of the segment containing `block`.
    pub const fn index_of(&self, block: BlockNumber) -> Result<u64, SegmenterError> {
        if block < self.initial_block || block > self.handoff_block {
            return Err(SegmenterError::OutOfRange {
                block,
                low: self.initial_block,
                high: self.handoff_block,
            })
        }
        Ok(block / self.interval - self.first_index())
    }

    /// Returns `true` if segment `index` ends before the next interval boundary.
    pub fn is_partial(&self, index: u64) -> bool {
        self.range_of(index).is_some_and(|r| r.end() % self.interval != 0)
    }

    /// Iterates over all non-empty segments in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = BlockRange> + '_ {
        (0..self.count()).filter_map(|i| self.range_of(i))
    }
}
