use crate::BlockNumber;

/// Errors returned by [`Segmenter`](crate::Segmenter) lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SegmenterError {
    /// The block lies outside of `[low, high]`.
    #[error("block {block} is outside of the segmented span [{low}, {high}]")]
    OutOfRange {
        /// The requested block.
        block: BlockNumber,
        /// Inclusive lower bound of the span.
        low: BlockNumber,
        /// Inclusive upper bound of the span.
        high: BlockNumber,
    },
}

/// Errors returned when parsing textual block ranges such as `10-20,20-30`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RangeParseError {
    /// The element is not of the form `start-end`.
    #[error("invalid block range {0:?}: expected `start-end`")]
    Format(String),
    /// One of the bounds is not a number.
    #[error("invalid block number in range {0:?}")]
    Number(String),
    /// The range is empty or inverted.
    #[error("empty block range {0:?}")]
    Empty(String),
}

/// Errors raised while building a [`ModuleGraph`](crate::ModuleGraph).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    /// A lookup referenced a module that is not part of the graph.
    #[error("module {0:?} not found in graph")]
    UnknownModule(String),
    /// Two modules share a name.
    #[error("duplicate module name {0:?}")]
    DuplicateModule(String),
    /// A module consumes the output of a module that is not defined.
    #[error("module {module:?} has unknown input {input:?}")]
    UnknownInput {
        /// The consuming module.
        module: String,
        /// The missing input name.
        input: String,
    },
    /// The input declarations contain a cycle.
    #[error("module graph contains a cycle through {0:?}")]
    Cycle(String),
    /// A store input refers to a module that is not a store.
    #[error("module {module:?} reads {input:?} as a store, but it is a map")]
    NotAStore {
        /// The consuming module.
        module: String,
        /// The input name.
        input: String,
    },
}
