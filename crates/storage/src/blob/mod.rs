//! Object storage abstraction.

use crate::BlobError;
use async_trait::async_trait;
use bytes::Bytes;
use std::{fmt, sync::Arc};

mod fs;
mod memory;

pub use fs::FsBlobStore;
pub use memory::MemoryBlobStore;

/// Shared handle to a [`BlobStore`].
pub type BlobStoreRef = Arc<dyn BlobStore>;

/// Flat key-value object storage.
///
/// Object names are relative to the store. Writes are atomic: readers observe either the previous
/// content or the new one, never a partially written object. Cancellation happens by dropping the
/// returned futures.
#[async_trait]
pub trait BlobStore: Send + Sync + fmt::Debug {
    /// Lists the names of the objects starting with `prefix`, in lexicographic order.
    async fn walk(&self, prefix: &str) -> Result<Vec<String>, BlobError>;

    /// Reads an object. Fails with [`BlobError::NotFound`] if it does not exist.
    async fn open(&self, name: &str) -> Result<Bytes, BlobError>;

    /// Writes an object, replacing any previous content.
    async fn write(&self, name: &str, content: Bytes) -> Result<(), BlobError>;

    /// Deletes an object. Deleting a missing object succeeds.
    async fn delete(&self, name: &str) -> Result<(), BlobError>;

    /// Returns a store rooted at `prefix` inside this one.
    fn sub_store(&self, prefix: &str) -> BlobStoreRef;
}

/// Joins two object name segments with a single `/`.
pub(crate) fn join(base: &str, name: &str) -> String {
    match (base.trim_end_matches('/'), name.trim_start_matches('/')) {
        ("", name) => name.to_string(),
        (base, "") => base.to_string(),
        (base, name) => format!("{base}/{name}"),
    }
}
