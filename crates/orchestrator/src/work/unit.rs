use crate::BackfillError;
use backfill_primitives::{next_boundary, BlockNumber, BlockRange, BlockRanges};
use backfill_storage::Snapshots;

/// What remains to be computed for one store module.
///
/// `initial_complete_range`, `partials_present` and `partials_missing` together cover
/// `[module_initial_block, work_up_to)` exactly, without overlap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    /// Store module.
    pub module: String,
    /// First block of the module.
    pub module_initial_block: BlockNumber,
    /// Exclusive block up to which the store must be built.
    pub work_up_to: BlockNumber,
    /// Complete snapshot to start from.
    pub initial_complete_range: Option<BlockRange>,
    /// Partial snapshots already persisted, waiting to be squashed.
    pub partials_present: BlockRanges,
    /// Segments still to be computed, ascending and contiguous.
    pub partials_missing: BlockRanges,
}

impl WorkUnit {
    /// Plans the work of a store from its persisted snapshots.
    ///
    /// Segments are `interval`-aligned on both bounds, except the last one which stops at
    /// `work_up_to`.
    pub fn build(
        module: impl Into<String>,
        module_initial_block: BlockNumber,
        snapshots: &Snapshots,
        interval: u64,
        work_up_to: BlockNumber,
    ) -> Result<Self, BackfillError> {
        let mut unit = Self {
            module: module.into(),
            module_initial_block,
            work_up_to,
            initial_complete_range: None,
            partials_present: BlockRanges::new(),
            partials_missing: BlockRanges::new(),
        };
        if work_up_to <= module_initial_block {
            return Ok(unit)
        }

        let mut ptr = module_initial_block;
        if let Some(best) = snapshots.last_complete_at_or_before(work_up_to) {
            if best.end() <= module_initial_block {
                return Err(BackfillError::CorruptStorage {
                    module: unit.module,
                    range: Some(best),
                    cause: format!(
                        "complete snapshot ends before the module initial block {module_initial_block}"
                    ),
                })
            }
            unit.initial_complete_range = BlockRange::new(module_initial_block, best.end());
            ptr = best.end();
        }

        while ptr < work_up_to {
            let end = next_boundary(ptr, interval).min(work_up_to);
            let Some(segment) = BlockRange::new(ptr, end) else { break };
            if snapshots.contains_partial(&segment) {
                unit.partials_present.push(segment);
            } else {
                unit.partials_missing.push(segment);
            }
            ptr = end;
        }
        Ok(unit)
    }

    /// Returns `true` if nothing remains to be computed.
    pub fn is_complete(&self) -> bool {
        self.partials_missing.is_empty()
    }

    /// First block not covered by the initial complete snapshot.
    pub fn next_expected_start(&self) -> BlockNumber {
        self.initial_complete_range.map_or(self.module_initial_block, |range| range.end())
    }

    /// Ranges already persisted, merged.
    pub fn completed_ranges(&self) -> BlockRanges {
        let mut ranges: BlockRanges = self.initial_complete_range.into_iter().collect();
        ranges.extend(self.partials_present.iter().copied());
        ranges.sort();
        ranges.merged()
    }
}
