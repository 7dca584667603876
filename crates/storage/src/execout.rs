//! Cached per-block outputs of map modules, one file per segment.

use crate::{BlobError, BlobStoreRef, StoreError};
use backfill_primitives::{BlockNumber, BlockRange, ModuleHash};
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

const MAGIC: &[u8; 4] = b"BFEO";
const VERSION: u8 = 1;

/// Output of a map module at one block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputItem {
    /// Block hash or identifier.
    pub block_id: String,
    /// Block number.
    pub block_num: BlockNumber,
    /// Block timestamp, in seconds since the unix epoch.
    pub timestamp: u64,
    /// Opaque cursor of the block.
    pub cursor: String,
    /// Encoded module output.
    pub payload: Vec<u8>,
}

/// The outputs of one segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    /// Segment covered by the file.
    pub range: BlockRange,
    /// Items, in no particular order.
    pub items: Vec<OutputItem>,
}

impl OutputFile {
    /// Creates an empty file for `range`.
    pub const fn new(range: BlockRange) -> Self {
        Self { range, items: Vec::new() }
    }

    /// Returns the items sorted by block number.
    pub fn into_sorted_items(mut self) -> Vec<OutputItem> {
        self.items.sort_by_key(|item| item.block_num);
        self.items
    }
}

/// Execution output cache of one map module, rooted at `{hash}/outputs`.
#[derive(Debug, Clone)]
pub struct ExecOutputCache {
    module: String,
    objects: BlobStoreRef,
}

impl ExecOutputCache {
    /// Creates the cache of `module` inside `base`.
    pub fn new(module: impl Into<String>, module_hash: ModuleHash, base: &BlobStoreRef) -> Self {
        let objects = base.sub_store(&format!("{}/outputs", module_hash.to_hex()));
        Self { module: module.into(), objects }
    }

    /// Module name.
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Object name of the segment ending at `end`.
    pub fn filename(end: BlockNumber) -> String {
        format!("{end:010}.output")
    }

    /// Loads the segment `range`. Fails with [`BlobError::NotFound`] if it was not written yet.
    pub async fn load(&self, range: BlockRange) -> Result<OutputFile, StoreError> {
        let name = Self::filename(range.end());
        let bytes = self.objects.open(&name).await?;
        let codec_err = |cause: String| StoreError::Codec { name: name.clone(), cause };

        let body = bytes
            .strip_prefix(MAGIC.as_slice())
            .and_then(|body| body.split_first())
            .filter(|(version, _)| **version == VERSION)
            .map(|(_, body)| body)
            .ok_or_else(|| codec_err("missing or unsupported output header".to_string()))?;
        let file: OutputFile = postcard::from_bytes(body).map_err(|err| codec_err(err.to_string()))?;
        if file.range != range {
            return Err(codec_err(format!("file covers {}, expected {range}", file.range)))
        }
        Ok(file)
    }

    /// Writes a segment file.
    pub async fn save(&self, file: &OutputFile) -> Result<(), StoreError> {
        let name = Self::filename(file.range.end());
        let mut buf = BytesMut::new();
        buf.put_slice(MAGIC);
        buf.put_u8(VERSION);
        let buf = postcard::to_extend(file, buf)
            .map_err(|err| StoreError::Codec { name: name.clone(), cause: err.to_string() })?;
        self.objects.write(&name, buf.freeze()).await?;
        Ok(())
    }

    /// Returns `true` if the segment ending at `end` is present.
    pub async fn exists(&self, end: BlockNumber) -> Result<bool, BlobError> {
        Ok(self.present_ends().await?.contains(&end))
    }

    /// End blocks of all segments present, ascending.
    pub async fn present_ends(&self) -> Result<Vec<BlockNumber>, BlobError> {
        let mut ends: Vec<BlockNumber> = self
            .objects
            .walk("")
            .await?
            .iter()
            .filter_map(|name| name.strip_suffix(".output")?.parse().ok())
            .collect();
        ends.sort_unstable();
        Ok(ends)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryBlobStore;
    use assert_matches::assert_matches;
    use backfill_primitives::{Module, ModuleGraph, ModuleHashes};
    use std::sync::Arc;

    fn cache() -> ExecOutputCache {
        let graph = ModuleGraph::new(vec![Module::map("out", 0)]).unwrap();
        let base: BlobStoreRef = Arc::new(MemoryBlobStore::new());
        ExecOutputCache::new("out", ModuleHashes::new(&graph).get("out").unwrap(), &base)
    }

    fn item(block_num: u64) -> OutputItem {
        OutputItem {
            block_id: format!("#{block_num}"),
            block_num,
            payload: vec![block_num as u8],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn save_load_sorted() {
        let cache = cache();
        let range = BlockRange::new(10, 20).unwrap();
        let mut file = OutputFile::new(range);
        file.items = vec![item(12), item(10), item(11)];
        cache.save(&file).await.unwrap();

        assert_eq!(cache.present_ends().await.unwrap(), vec![20]);
        assert!(cache.exists(20).await.unwrap());
        let loaded = cache.load(range).await.unwrap();
        let blocks: Vec<_> = loaded.into_sorted_items().iter().map(|i| i.block_num).collect();
        assert_eq!(blocks, vec![10, 11, 12]);
    }

    #[tokio::test]
    async fn missing_segment_is_not_found() {
        let cache = cache();
        let err = cache.load(BlockRange::new(0, 10).unwrap()).await.unwrap_err();
        assert!(err.is_not_found());
        assert_matches!(err, StoreError::Blob(BlobError::NotFound(_)));
    }
}
