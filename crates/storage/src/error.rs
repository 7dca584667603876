use backfill_primitives::{UpdatePolicy, ValueType};
use std::io;

/// Errors returned by a [`BlobStore`](crate::BlobStore).
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    /// The object does not exist.
    #[error("object {0:?} not found")]
    NotFound(String),
    /// Local filesystem failure.
    #[error("i/o error on {name:?}: {source}")]
    Io {
        /// Object name.
        name: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// Failure reported by a remote backend.
    #[error("storage backend error: {message}")]
    Backend {
        /// Backend message.
        message: String,
        /// Whether retrying may succeed.
        transient: bool,
    },
}

impl BlobError {
    pub(crate) fn io(name: impl Into<String>, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            return Self::NotFound(name.into())
        }
        Self::Io { name: name.into(), source }
    }

    /// Returns `true` if the object does not exist.
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns `true` if the operation may succeed when retried.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NotFound(_) => false,
            Self::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::Interrupted |
                    io::ErrorKind::TimedOut |
                    io::ErrorKind::WouldBlock |
                    io::ErrorKind::ConnectionReset |
                    io::ErrorKind::ConnectionAborted
            ),
            Self::Backend { transient, .. } => *transient,
        }
    }
}

/// Failure to list the snapshots of a module.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// The backend kept failing after all retries, or failed permanently.
    #[error("listing snapshots of module {module}: {source}")]
    Storage {
        /// Module name.
        module: String,
        /// Last backend error.
        #[source]
        source: BlobError,
    },
}

/// Errors raised while mutating, merging or persisting a store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Update policy or value type of two stores differ, or the policy does not support the type.
    #[error("store {module}: policy mismatch: {cause}")]
    PolicyMismatch {
        /// Module name.
        module: String,
        /// What did not match.
        cause: String,
    },
    /// Empty key or key starting with `0xFF`.
    #[error("store {module}: invalid key {key:?}")]
    InvalidKey {
        /// Module name.
        module: String,
        /// Lossy rendering of the key.
        key: String,
    },
    /// Value exceeds the configured size limit.
    #[error("store {module}: value of key {key:?} is {size} bytes, limit is {limit}")]
    ValueTooLarge {
        /// Module name.
        module: String,
        /// Lossy rendering of the key.
        key: String,
        /// Value size.
        size: usize,
        /// Limit.
        limit: usize,
    },
    /// An append would grow a value beyond the per-key limit.
    #[error("store {module}: append to key {key:?} reaches {size} bytes, limit is {limit}")]
    AppendLimit {
        /// Module name.
        module: String,
        /// Lossy rendering of the key.
        key: String,
        /// Resulting size.
        size: usize,
        /// Limit.
        limit: usize,
    },
    /// A stored value could not be parsed as the declared numeric type.
    #[error("store {module}: key {key:?} holds invalid {value_type}: {cause}")]
    InvalidNumber {
        /// Module name.
        module: String,
        /// Lossy rendering of the key.
        key: String,
        /// Declared value type.
        value_type: ValueType,
        /// Parse failure.
        cause: String,
    },
    /// A write used an ordinal lower than the last one applied.
    #[error("store {module}: ordinal {ordinal} is lower than last applied ordinal {last}")]
    OrdinalRegression {
        /// Module name.
        module: String,
        /// Rejected ordinal.
        ordinal: u64,
        /// Last applied ordinal.
        last: u64,
    },
    /// Snapshot bytes could not be encoded or decoded.
    #[error("snapshot {name}: {cause}")]
    Codec {
        /// Object name.
        name: String,
        /// Failure description.
        cause: String,
    },
    /// Backend failure.
    #[error(transparent)]
    Blob(#[from] BlobError),
}

impl StoreError {
    pub(crate) fn policy_mismatch(
        module: &str,
        expected: (UpdatePolicy, ValueType),
        found: (UpdatePolicy, ValueType),
    ) -> Self {
        Self::PolicyMismatch {
            module: module.to_string(),
            cause: format!(
                "expected {}/{}, found {}/{}",
                expected.0, expected.1, found.0, found.1
            ),
        }
    }

    /// Returns `true` if the error is a missing object.
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::Blob(BlobError::NotFound(_)))
    }
}
