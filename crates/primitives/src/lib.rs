//! Commonly used types for the backfill engine.
//!
//! This crate holds the block range algebra, the fixed-interval [`Segmenter`] and the module
//! dependency graph that every other backfill crate builds on.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

mod error;
mod graph;
mod hash;
mod module;
mod range;
mod segment;

pub use error::{GraphError, RangeParseError, SegmenterError};
pub use graph::ModuleGraph;
pub use hash::{ModuleHash, ModuleHashes};
pub use module::{Module, ModuleInput, ModuleKind, StoreMode, UpdatePolicy, ValueType};
pub use range::{BlockRange, BlockRanges};
pub use segment::Segmenter;

/// Block number.
pub type BlockNumber = u64;

/// Returns the interval boundary at or below `block`.
pub const fn boundary_at_or_below(block: BlockNumber, interval: u64) -> BlockNumber {
    block - block % interval
}

/// Returns the first interval boundary strictly above `block`.
pub const fn next_boundary(block: BlockNumber, interval: u64) -> BlockNumber {
    block - block % interval + interval
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundaries() {
        assert_eq!(boundary_at_or_below(0, 10), 0);
        assert_eq!(boundary_at_or_below(19, 10), 10);
        assert_eq!(boundary_at_or_below(20, 10), 20);
        assert_eq!(next_boundary(20, 10), 30);
        assert_eq!(next_boundary(25, 10), 30);
    }
}
