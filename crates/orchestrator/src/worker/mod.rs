//! Workers running sub-requests against peer runners.

use crate::work::JobKind;
use async_trait::async_trait;
use backfill_primitives::{BlockNumber, BlockRange, BlockRanges, ModuleGraph, RangeParseError};
use futures::{stream::BoxStream, StreamExt};
use std::{fmt, sync::Arc, time::Duration};
use tracing::trace;

mod pool;

pub use pool::WorkerPool;

/// A request for a peer runner to process one range of one module and persist its outputs.
#[derive(Debug, Clone)]
pub struct Subrequest {
    /// Identifier of the parent request.
    pub trace_id: String,
    /// Module graph.
    pub modules: Arc<ModuleGraph>,
    /// Module to run.
    pub output_module: String,
    /// Whether partial stores or cached outputs are written.
    pub kind: JobKind,
    /// First block.
    pub start_block: BlockNumber,
    /// Exclusive last block.
    pub stop_block: BlockNumber,
    /// Stores are written as partial snapshots. Always `true` for backfill jobs.
    pub partial_mode: bool,
}

impl Subrequest {
    /// Blocks of the sub-request.
    pub fn range(&self) -> Option<BlockRange> {
        BlockRange::new(self.start_block, self.stop_block)
    }
}

/// Message of a sub-request stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubrequestMessage {
    /// The runner is alive and has processed up to `processed_block`.
    Progress {
        /// Last processed block.
        processed_block: BlockNumber,
    },
    /// A module failed. Retrying would fail the same way.
    Failure {
        /// Failure description.
        reason: String,
        /// Module logs.
        logs: Vec<String>,
    },
    /// Final message, listing the files written as `start-end` pairs.
    Trailer {
        /// Written ranges, e.g. `0-10,10-20`.
        partials_written: String,
    },
}

/// Stream of messages of one sub-request.
pub type SubrequestStream = BoxStream<'static, Result<SubrequestMessage, WorkerError>>;

/// Opens sub-requests on peer runners.
#[async_trait]
#[auto_impl::auto_impl(&, Arc, Box)]
pub trait SubrequestClient: fmt::Debug + Send + Sync {
    /// Starts `request` and returns its message stream.
    async fn open(&self, request: Subrequest) -> Result<SubrequestStream, WorkerError>;
}

/// Failure of a sub-request.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkerError {
    /// Connection or stream failure.
    #[error("transport: {0}")]
    Transport(String),
    /// No message arrived in time.
    #[error("no message received in {0:?}")]
    Timeout(Duration),
    /// The stream ended before the trailer.
    #[error("stream ended without trailer")]
    MissingTrailer,
    /// The trailer lists ranges that cannot have been written.
    #[error("invalid trailer {trailer:?}: {cause}")]
    InvalidTrailer {
        /// Raw trailer.
        trailer: String,
        /// What is wrong with it.
        cause: String,
    },
    /// A module failed on the runner.
    #[error("module failure: {reason}")]
    ModuleFailure {
        /// Failure description.
        reason: String,
        /// Module logs.
        logs: Vec<String>,
    },
    /// The runner rejected the sub-request.
    #[error("rejected: {0}")]
    Validation(String),
    /// The task running the sub-request panicked.
    #[error("panicked: {0}")]
    Panicked(String),
}

impl WorkerError {
    /// Returns `true` if running the sub-request again may succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_) | Self::MissingTrailer)
    }
}

/// Outcome of a successful sub-request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkResult {
    /// Ranges of the files written.
    pub written: BlockRanges,
}

/// A handle able to run one sub-request at a time.
#[derive(Debug, Clone)]
pub struct Worker {
    id: usize,
    client: Arc<dyn SubrequestClient>,
}

impl Worker {
    /// Creates a worker using `client`.
    pub fn new(id: usize, client: Arc<dyn SubrequestClient>) -> Self {
        Self { id, client }
    }

    /// Worker identifier, unique within its pool.
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Runs `request` to completion.
    ///
    /// Every message, including the first, must arrive within `receive_timeout`.
    pub async fn work(
        &self,
        request: Subrequest,
        receive_timeout: Duration,
    ) -> Result<WorkResult, WorkerError> {
        let range = request.range().ok_or_else(|| {
            WorkerError::Validation(format!(
                "empty range [{}, {})",
                request.start_block, request.stop_block
            ))
        })?;
        let mut stream = tokio::time::timeout(receive_timeout, self.client.open(request))
            .await
            .map_err(|_| WorkerError::Timeout(receive_timeout))??;

        loop {
            let message = match tokio::time::timeout(receive_timeout, stream.next()).await {
                Err(_) => return Err(WorkerError::Timeout(receive_timeout)),
                Ok(None) => return Err(WorkerError::MissingTrailer),
                Ok(Some(message)) => message?,
            };
            match message {
                SubrequestMessage::Progress { processed_block } => {
                    trace!(target: "backfill::scheduler", worker = self.id, %range, processed_block, "Sub-request progress");
                }
                SubrequestMessage::Failure { reason, logs } => {
                    return Err(WorkerError::ModuleFailure { reason, logs })
                }
                SubrequestMessage::Trailer { partials_written } => {
                    let written = parse_trailer(&partials_written, range)?;
                    return Ok(WorkResult { written })
                }
            }
        }
    }
}

fn parse_trailer(trailer: &str, range: BlockRange) -> Result<BlockRanges, WorkerError> {
    let invalid = |cause: String| WorkerError::InvalidTrailer { trailer: trailer.to_string(), cause };
    let mut written: BlockRanges =
        trailer.parse().map_err(|err: RangeParseError| invalid(err.to_string()))?;
    written.sort();
    if let Some(outside) =
        written.iter().find(|w| w.start() < range.start() || w.end() > range.end())
    {
        return Err(invalid(format!("{outside} is outside of {range}")))
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use futures::stream;

    #[derive(Debug)]
    struct ScriptedClient {
        messages: Vec<Result<SubrequestMessage, WorkerError>>,
        stall: bool,
    }

    #[async_trait]
    impl SubrequestClient for ScriptedClient {
        async fn open(&self, _request: Subrequest) -> Result<SubrequestStream, WorkerError> {
            let messages = stream::iter(self.messages.clone());
            if self.stall {
                return Ok(messages.chain(stream::pending()).boxed())
            }
            Ok(messages.boxed())
        }
    }

    fn request() -> Subrequest {
        Subrequest {
            trace_id: "test".into(),
            modules: Arc::new(ModuleGraph::new(vec![]).unwrap()),
            output_module: "counter".into(),
            kind: JobKind::Store,
            start_block: 0,
            stop_block: 20,
            partial_mode: true,
        }
    }

    async fn run(
        messages: Vec<Result<SubrequestMessage, WorkerError>>,
        stall: bool,
    ) -> Result<WorkResult, WorkerError> {
        let worker = Worker::new(0, Arc::new(ScriptedClient { messages, stall }));
        worker.work(request(), Duration::from_millis(50)).await
    }

    #[tokio::test]
    async fn trailer_lists_written_ranges() {
        let result = run(
            vec![
                Ok(SubrequestMessage::Progress { processed_block: 5 }),
                Ok(SubrequestMessage::Trailer { partials_written: "10-20,0-10".into() }),
            ],
            false,
        )
        .await
        .unwrap();
        assert_eq!(result.written, "0-10,10-20".parse().unwrap());
    }

    #[tokio::test]
    async fn classifies_failures() {
        let err = run(vec![Ok(SubrequestMessage::Progress { processed_block: 5 })], false)
            .await
            .unwrap_err();
        assert_matches!(err, WorkerError::MissingTrailer);
        assert!(err.is_retryable());

        let err = run(vec![Ok(SubrequestMessage::Progress { processed_block: 5 })], true)
            .await
            .unwrap_err();
        assert_matches!(err, WorkerError::Timeout(_));
        assert!(err.is_retryable());

        let err = run(
            vec![Ok(SubrequestMessage::Failure { reason: "panic in wasm".into(), logs: vec![] })],
            false,
        )
        .await
        .unwrap_err();
        assert_matches!(err, WorkerError::ModuleFailure { .. });
        assert!(!err.is_retryable());

        let err = run(vec![Err(WorkerError::Transport("reset".into()))], false).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn rejects_bad_trailers() {
        for trailer in ["0-10,x", "10-30"] {
            let err = run(
                vec![Ok(SubrequestMessage::Trailer { partials_written: trailer.into() })],
                false,
            )
            .await
            .unwrap_err();
            assert_matches!(err, WorkerError::InvalidTrailer { .. });
            assert!(!err.is_retryable());
        }
    }
}
