//! Persistence layer of the backfill engine.
//!
//! ## Layout
//!
//! Every module owns a namespace keyed by its [`ModuleHash`](backfill_primitives::ModuleHash):
//!
//! - `{hash}/states/{end:010}-{initial:010}.kv`: complete store snapshots.
//! - `{hash}/states/{end:010}-{start:010}.partial`: partial store snapshots.
//! - `{hash}/outputs/{end:010}.output`: cached per-block map outputs of one segment.
//!
//! All access goes through the [`BlobStore`] trait; [`FsBlobStore`] and [`MemoryBlobStore`] are
//! provided.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

mod blob;
mod error;
mod execout;
mod filename;
mod snapshots;
pub mod store;

pub use blob::{BlobStore, BlobStoreRef, FsBlobStore, MemoryBlobStore};
pub use error::{BlobError, ProbeError, StoreError};
pub use execout::{ExecOutputCache, OutputFile, OutputItem};
pub use filename::{SnapshotFile, SnapshotKind};
pub use snapshots::{Snapshots, SnapshotsProber};
pub use store::{KvStore, StoreConfig, StoreDelta, StoreKind, StoreLimits};
