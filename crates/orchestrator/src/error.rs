use crate::{squasher::SquasherError, worker::WorkerError};
use backfill_primitives::{BlockNumber, BlockRange, BlockRanges, GraphError};
use backfill_storage::{BlobError, ProbeError, StoreError};
use std::{any::Any, fmt};

/// Range a squasher still lacked when the backfill ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingRanges {
    /// Store module.
    pub module: String,
    /// First block not yet merged.
    pub next_expected_start: BlockNumber,
    /// Block the squasher had to reach.
    pub target_end: BlockNumber,
    /// Partials received but not mergeable.
    pub pending: BlockRanges,
}

impl fmt::Display for MissingRanges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: missing [{}, {})", self.module, self.next_expected_start, self.target_end)?;
        if !self.pending.is_empty() {
            write!(f, ", pending {}", self.pending)?;
        }
        Ok(())
    }
}

fn join_missing(missing: &[MissingRanges]) -> String {
    missing.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

/// Errors returned by a backfill.
#[derive(Debug, thiserror::Error)]
pub enum BackfillError {
    /// The request cannot be served.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Storage kept failing.
    #[error("storage failure on module {module}: {source}")]
    Storage {
        /// Module name.
        module: String,
        /// Backend error.
        #[source]
        source: BlobError,
    },
    /// Persisted files contradict each other.
    #[error("corrupt storage for module {module}{}: {cause}", display_range(.range))]
    CorruptStorage {
        /// Module name.
        module: String,
        /// Offending range.
        range: Option<BlockRange>,
        /// What is inconsistent.
        cause: String,
    },
    /// A partial starts before the squasher cursor.
    #[error("module {module}: partial {range} does not continue at block {next_expected_start}")]
    NonContiguous {
        /// Module name.
        module: String,
        /// Offending partial.
        range: BlockRange,
        /// Squasher cursor.
        next_expected_start: BlockNumber,
    },
    /// A store rejected a write or merge.
    #[error("module {module}{}: {source}", display_range(.range))]
    Store {
        /// Module name.
        module: String,
        /// Range being merged or persisted.
        range: Option<BlockRange>,
        /// Store error.
        #[source]
        source: StoreError,
    },
    /// No squasher exists for the module.
    #[error("unknown module {0}")]
    UnknownModule(String),
    /// A sub-request failed.
    #[error("sub-request for module {module} on {range} failed after {attempts} attempt(s): {source}")]
    Worker {
        /// Module of the sub-request.
        module: String,
        /// Range of the sub-request.
        range: BlockRange,
        /// Attempts made.
        attempts: u32,
        /// Last worker error.
        #[source]
        source: WorkerError,
    },
    /// A background task panicked.
    #[error("module {module}: {message}")]
    Panicked {
        /// Module owning the task.
        module: String,
        /// Panic message.
        message: String,
    },
    /// Squashers ended before reaching their target.
    #[error("squashers incomplete: {}", join_missing(.0))]
    SquashersIncomplete(Vec<MissingRanges>),
    /// One or more squashers failed.
    #[error("squashers failed: {}{}", join_failures(.failures), display_incomplete(.incomplete))]
    SquashersFailed {
        /// Every failed squasher, with what its store still missed.
        failures: Vec<SquasherError>,
        /// The other stores short of their target, cancelled by the failure.
        incomplete: Vec<MissingRanges>,
    },
    /// The request was cancelled.
    #[error("request cancelled")]
    Cancelled,
}

fn join_failures(failures: &[SquasherError]) -> String {
    failures.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

fn display_incomplete(incomplete: &[MissingRanges]) -> String {
    if incomplete.is_empty() {
        return String::new()
    }
    format!("; also incomplete: {}", join_missing(incomplete))
}

fn display_range(range: &Option<BlockRange>) -> String {
    range.map(|range| format!(" on {range}")).unwrap_or_default()
}

impl BackfillError {
    /// Returns `true` if the request was cancelled rather than failed.
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns `true` if the error carries a retryable worker failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Worker { source, .. } if source.is_retryable())
    }

    /// Maps a failure of a store operation on `range` of `module`.
    pub(crate) fn store(module: &str, range: Option<BlockRange>, source: StoreError) -> Self {
        match source {
            StoreError::Blob(source) if !source.is_not_found() => {
                Self::Storage { module: module.to_string(), source }
            }
            StoreError::Blob(BlobError::NotFound(name)) => Self::CorruptStorage {
                module: module.to_string(),
                range,
                cause: format!("reported snapshot {name} does not exist"),
            },
            source => Self::Store { module: module.to_string(), range, source },
        }
    }
}

/// Renders a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    match payload.downcast_ref::<String>() {
        Some(message) => message.clone(),
        None => payload
            .downcast_ref::<&str>()
            .map(|message| (*message).to_string())
            .unwrap_or_else(|| "unknown panic payload".to_string()),
    }
}

impl From<ProbeError> for BackfillError {
    fn from(err: ProbeError) -> Self {
        match err {
            ProbeError::Storage { module, source } => Self::Storage { module, source },
        }
    }
}

impl From<GraphError> for BackfillError {
    fn from(err: GraphError) -> Self {
        Self::InvalidRequest(err.to_string())
    }
}
