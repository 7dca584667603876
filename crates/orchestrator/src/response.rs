//! Messages streamed back to the caller.

use crate::BackfillError;
use backfill_primitives::{BlockNumber, BlockRanges};
use tokio::sync::mpsc;

/// Message of the response stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// First message of a session.
    SessionInit(SessionInit),
    /// Backfill progress of every module.
    Progress(Vec<ModuleProgress>),
    /// Output of the output module at one block.
    BlockScopedData(BlockScopedData),
    /// A batch of entries of a store at the handoff block.
    DebugSnapshotData(DebugSnapshotData),
    /// All debug snapshot batches were sent.
    DebugSnapshotComplete,
}

/// Parameters of a session, sent before any other message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInit {
    /// Request identifier.
    pub trace_id: String,
    /// First block streamed.
    pub resolved_start_block: BlockNumber,
    /// Exclusive end of the parallel region.
    pub linear_handoff_block: BlockNumber,
    /// Maximum number of concurrent sub-requests.
    pub max_parallel_workers: usize,
}

/// Progress of one module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleProgress {
    /// Module name.
    pub name: String,
    /// Ranges already available, merged.
    pub completed_ranges: BlockRanges,
    /// Ranges of sub-requests in flight.
    pub running_ranges: BlockRanges,
}

/// Block of a [`BlockScopedData`] message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Clock {
    /// Block identifier.
    pub id: String,
    /// Block number.
    pub number: BlockNumber,
    /// Block timestamp, in seconds since the unix epoch.
    pub timestamp: u64,
}

/// Output of a map module at one block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockScopedData {
    /// Block the output belongs to.
    pub clock: Clock,
    /// Cursor to resume after this block.
    pub cursor: String,
    /// Output module.
    pub module: String,
    /// Encoded output.
    pub payload: Vec<u8>,
}

/// Entries of a store at the handoff block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugSnapshotData {
    /// Store module.
    pub module: String,
    /// Key/value pairs, in key order.
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
}

/// Sending half of the response stream.
///
/// Every component writing to the caller goes through a clone of the same sender, so a slow
/// consumer back-pressures all of them.
#[derive(Debug, Clone)]
pub struct ResponseSender {
    tx: mpsc::Sender<Response>,
}

impl ResponseSender {
    /// Sends a response, waiting for capacity. Fails if the caller went away.
    pub async fn send(&self, response: Response) -> Result<(), BackfillError> {
        self.tx.send(response).await.map_err(|_| BackfillError::Cancelled)
    }

    /// Sends a response if the stream has capacity. Returns `false` otherwise.
    pub fn try_send(&self, response: Response) -> bool {
        self.tx.try_send(response).is_ok()
    }
}

/// Creates a response stream holding at most `capacity` unread messages.
pub fn response_channel(capacity: usize) -> (ResponseSender, mpsc::Receiver<Response>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ResponseSender { tx }, rx)
}
