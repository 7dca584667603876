//! Parallel backfill of module stores and cached map outputs.
//!
//! A request for an output module is split in two regions at its linear handoff block. Below
//! it, this crate produces what the live pipeline needs to start:
//!
//! - the complete state of every store the output module depends on, valid at the handoff block
//! - in production mode, the outputs of the output map module, streamed to the caller in block
//!   order from the execution output cache
//!
//! Missing work is cut into jobs run as sub-requests by a [`WorkerPool`]. Store jobs write
//! partial snapshots that a [`Squasher`] per store folds, in block order, into its complete
//! state. A job only runs once the stores it reads have been squashed up to its start block.
//!
//! The entry point is [`BackfillEngine::run`].

#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

mod engine;
mod error;
mod metrics;
mod output;
mod progress;
mod scheduler;

pub mod request;
pub mod response;
pub mod squasher;
pub mod work;
pub mod worker;

/// Common test helpers.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use engine::{BackfillEngine, DEBUG_SNAPSHOT_BATCH_SIZE};
pub use error::{BackfillError, MissingRanges};
pub use output::LinearOutputReader;
pub use progress::ProgressEmitter;
pub use request::{Request, RequestDetails, RequestPlan};
pub use response::{response_channel, Response, ResponseSender};
pub use scheduler::Scheduler;
pub use squasher::{MultiSquasher, Squasher, SquasherError, SquasherEvent, StoreMap};
pub use work::{Job, JobKind, JobQueue, WorkPlan, WorkUnit};
pub use worker::{
    Subrequest, SubrequestClient, SubrequestMessage, Worker, WorkerError, WorkerPool,
};
