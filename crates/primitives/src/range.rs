use crate::{error::RangeParseError, BlockNumber};
use serde::{Deserialize, Serialize};
use std::{fmt, ops::Deref, str::FromStr};

/// A non-empty, half-open range of blocks `[start, end)`.
///
/// An empty range is never constructed: [`BlockRange::new`] returns `None` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRange {
    start: BlockNumber,
    end: BlockNumber,
}

impl BlockRange {
    /// Creates a new range `[start, end)`, or `None` if it would be empty.
    pub const fn new(start: BlockNumber, end: BlockNumber) -> Option<Self> {
        if start < end {
            Some(Self { start, end })
        } else {
            None
        }
    }

    /// First block of the range.
    pub const fn start(&self) -> BlockNumber {
        self.start
    }

    /// Exclusive upper bound of the range.
    pub const fn end(&self) -> BlockNumber {
        self.end
    }

    /// Number of blocks covered. Always at least one.
    pub const fn size(&self) -> u64 {
        self.end - self.start
    }

    /// Returns `true` if `block` is inside the range.
    pub const fn contains(&self, block: BlockNumber) -> bool {
        self.start <= block && block < self.end
    }

    /// Returns `true` if `next` starts exactly where this range ends.
    pub const fn is_contiguous_to(&self, next: &Self) -> bool {
        self.end == next.start
    }

    /// Returns the union of two contiguous ranges.
    pub const fn join(&self, next: &Self) -> Option<Self> {
        if self.is_contiguous_to(next) {
            Some(Self { start: self.start, end: next.end })
        } else {
            None
        }
    }

    /// Cuts the range into pieces of `chunk` blocks. The last piece may be shorter.
    ///
    /// # Panics
    ///
    /// If `chunk` is zero.
    pub fn split(&self, chunk: u64) -> BlockRanges {
        assert!(chunk > 0, "cannot split a block range into empty chunks");

        let mut out = Vec::with_capacity(self.size().div_ceil(chunk) as usize);
        let mut ptr = self.start;
        while ptr < self.end {
            let end = ptr.saturating_add(chunk).min(self.end);
            out.push(Self { start: ptr, end });
            ptr = end;
        }
        BlockRanges(out)
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

impl FromStr for BlockRange {
    type Err = RangeParseError;

    /// Parses `start-end`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (start, end) = s.split_once('-').ok_or_else(|| RangeParseError::Format(s.into()))?;
        let start = start.trim().parse().map_err(|_| RangeParseError::Number(s.into()))?;
        let end = end.trim().parse().map_err(|_| RangeParseError::Number(s.into()))?;
        Self::new(start, end).ok_or_else(|| RangeParseError::Empty(s.into()))
    }
}

/// An ordered list of [`BlockRange`]s.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRanges(Vec<BlockRange>);

impl BlockRanges {
    /// Creates an empty list.
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Appends a range at the end of the list.
    pub fn push(&mut self, range: BlockRange) {
        self.0.push(range);
    }

    /// Extends the list with other ranges.
    pub fn extend(&mut self, ranges: impl IntoIterator<Item = BlockRange>) {
        self.0.extend(ranges);
    }

    /// Sorts the list by `start`.
    pub fn sort(&mut self) {
        self.0.sort_unstable_by_key(|r| (r.start, r.end));
    }

    /// Removes and returns the first range.
    pub fn pop_front(&mut self) -> Option<BlockRange> {
        if self.0.is_empty() {
            None
        } else {
            Some(self.0.remove(0))
        }
    }

    /// Returns `true` if `range` is an element of the list.
    pub fn contains_range(&self, range: &BlockRange) -> bool {
        self.0.contains(range)
    }

    /// Returns `true` if any range contains `block`.
    pub fn covers(&self, block: BlockNumber) -> bool {
        self.0.iter().any(|r| r.contains(block))
    }

    /// Total number of blocks covered by all ranges.
    pub fn total_size(&self) -> u64 {
        self.0.iter().map(BlockRange::size).sum()
    }

    /// Collapses every run of contiguous ranges into a single range.
    ///
    /// The input is expected to be sorted.
    pub fn merged(&self) -> Self {
        self.merged_by_bucket(u64::MAX)
    }

    /// Like [`BlockRanges::merged`], but never grows a merged range beyond `max` blocks.
    ///
    /// A range that is already larger than `max` is kept as is.
    pub fn merged_by_bucket(&self, max: u64) -> Self {
        let mut out = Vec::with_capacity(self.0.len());
        let mut iter = self.0.iter().copied();
        let Some(mut current) = iter.next() else { return Self::new() };

        for next in iter {
            match current.join(&next) {
                Some(joined) if joined.size() <= max => current = joined,
                _ => {
                    out.push(current);
                    current = next;
                }
            }
        }
        out.push(current);
        Self(out)
    }

    /// Consumes the list, returning the inner vector.
    pub fn into_inner(self) -> Vec<BlockRange> {
        self.0
    }
}

impl Deref for BlockRanges {
    type Target = [BlockRange];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Vec<BlockRange>> for BlockRanges {
    fn from(ranges: Vec<BlockRange>) -> Self {
        Self(ranges)
    }
}

impl FromIterator<BlockRange> for BlockRanges {
    fn from_iter<T: IntoIterator<Item = BlockRange>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for BlockRanges {
    type Item = BlockRange;
    type IntoIter = std::vec::IntoIter<BlockRange>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a BlockRanges {
    type Item = &'a BlockRange;
    type IntoIter = std::slice::Iter<'a, BlockRange>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Formats as `start-end,start-end`, the inverse of [`BlockRanges::from_str`].
impl fmt::Display for BlockRanges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, r) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}-{}", r.start, r.end)?;
        }
        Ok(())
    }
}

impl FromStr for BlockRanges {
    type Err = RangeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Ok(Self::new())
        }
        s.split(',').map(BlockRange::from_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    fn r(start: u64, end: u64) -> BlockRange {
        BlockRange::new(start, end).unwrap()
    }

    fn ranges(items: &[(u64, u64)]) -> BlockRanges {
        items.iter().map(|&(s, e)| r(s, e)).collect()
    }

    #[test]
    fn empty_range_is_absent() {
        assert_eq!(BlockRange::new(10, 10), None);
        assert_eq!(BlockRange::new(11, 10), None);
        assert_eq!(r(10, 11).size(), 1);
    }

    #[test]
    fn contains_is_half_open() {
        let range = r(10, 20);
        assert!(!range.contains(9));
        assert!(range.contains(10));
        assert!(range.contains(19));
        assert!(!range.contains(20));
    }

    #[test]
    fn split_leaves_short_tail() {
        assert_eq!(r(0, 25).split(10), ranges(&[(0, 10), (10, 20), (20, 25)]));
        assert_eq!(r(0, 20).split(10), ranges(&[(0, 10), (10, 20)]));
        assert_eq!(r(5, 6).split(10), ranges(&[(5, 6)]));
    }

    #[test]
    #[should_panic]
    fn split_by_zero_panics() {
        let _ = r(0, 10).split(0);
    }

    #[test]
    fn merged_collapses_contiguous_runs() {
        let input = ranges(&[(0, 10), (10, 20), (30, 40), (40, 50), (60, 70)]);
        assert_eq!(input.merged(), ranges(&[(0, 20), (30, 50), (60, 70)]));
    }

    #[test]
    fn merged_by_bucket_respects_max() {
        let input = ranges(&[(0, 10), (10, 20), (20, 30), (30, 40), (40, 50)]);
        assert_eq!(input.merged_by_bucket(20), ranges(&[(0, 20), (20, 40), (40, 50)]));
        assert_eq!(input.merged_by_bucket(25), ranges(&[(0, 20), (20, 40), (40, 50)]));
        assert_eq!(input.merged_by_bucket(5), input);
    }

    #[test]
    fn merged_by_bucket_ten_segments() {
        let input: BlockRanges = (10..20).map(|i| r(i * 100, (i + 1) * 100)).collect();
        assert_eq!(input.merged_by_bucket(1000), ranges(&[(1000, 2000)]));
    }

    #[test]
    fn text_round_trip() {
        let input = ranges(&[(0, 10), (20, 30)]);
        assert_eq!(input.to_string(), "0-10,20-30");
        assert_eq!("0-10,20-30".parse::<BlockRanges>().unwrap(), input);
        assert_eq!("".parse::<BlockRanges>().unwrap(), BlockRanges::new());
        assert_matches!("10".parse::<BlockRanges>(), Err(RangeParseError::Format(_)));
        assert_matches!("a-10".parse::<BlockRanges>(), Err(RangeParseError::Number(_)));
        assert_matches!("10-10".parse::<BlockRanges>(), Err(RangeParseError::Empty(_)));
    }

    #[test]
    fn sort_by_start() {
        let mut input = ranges(&[(20, 30), (0, 10), (10, 20)]);
        input.sort();
        assert_eq!(input, ranges(&[(0, 10), (10, 20), (20, 30)]));
    }

    fn arb_ranges() -> impl Strategy<Value = BlockRanges> {
        // Sorted, non-overlapping ranges built from (gap, len) pairs.
        prop::collection::vec((0u64..3, 1u64..50), 0..20).prop_map(|steps| {
            let mut ptr = 0;
            steps
                .into_iter()
                .map(|(gap, len)| {
                    let start = ptr + gap * 10;
                    ptr = start + len;
                    r(start, ptr)
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn merged_is_idempotent(input in arb_ranges()) {
            let merged = input.merged();
            prop_assert_eq!(merged.merged_by_bucket(u64::MAX), merged.clone());
            prop_assert_eq!(merged.merged(), merged.clone());
            prop_assert_eq!(merged.total_size(), input.total_size());
        }

        #[test]
        fn contiguous_pair_fits_bucket(start in 0u64..1_000_000, a in 1u64..10_000, b in 1u64..10_000, extra in 0u64..10_000) {
            let first = r(start, start + a);
            let second = r(start + a, start + a + b);
            let pair = BlockRanges::from(vec![first, second]);
            prop_assert_eq!(pair.merged_by_bucket(a + b + extra), ranges(&[(start, start + a + b)]));
        }

        #[test]
        fn split_covers_range(start in 0u64..1_000_000, len in 1u64..10_000, chunk in 1u64..500) {
            let range = r(start, start + len);
            let pieces = range.split(chunk);
            prop_assert_eq!(pieces.len() as u64, len.div_ceil(chunk));
            prop_assert_eq!(pieces.merged(), ranges(&[(start, start + len)]));
            prop_assert!(pieces.iter().all(|p| p.size() <= chunk));
        }

        #[test]
        fn bucketed_ranges_stay_bounded(input in arb_ranges(), max in 1u64..200) {
            for bucket in input.merged_by_bucket(max).iter() {
                let original_single = input.iter().any(|r| r == bucket);
                prop_assert!(bucket.size() <= max || original_single);
            }
        }
    }
}
