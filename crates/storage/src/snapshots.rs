use crate::{BlobError, BlobStore, ProbeError, SnapshotFile};
use backfill_primitives::{BlockNumber, BlockRange};
use backon::{ExponentialBuilder, Retryable};
use std::time::Duration;
use tracing::{debug, warn};

/// Snapshot files present in a module's `states` directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshots {
    /// Complete snapshots, ascending by end block.
    completes: Vec<BlockRange>,
    /// Partial snapshots, ascending by start block.
    partials: Vec<BlockRange>,
}

impl Snapshots {
    /// Classifies snapshot files. Duplicates are dropped.
    pub fn new(files: impl IntoIterator<Item = SnapshotFile>) -> Self {
        let mut completes = Vec::new();
        let mut partials = Vec::new();
        for file in files {
            if file.is_partial() {
                partials.push(file.range);
            } else {
                completes.push(file.range);
            }
        }
        completes.sort_unstable_by_key(|r| (r.end(), r.start()));
        completes.dedup();
        partials.sort_unstable_by_key(|r| (r.start(), r.end()));
        partials.dedup();
        Self { completes, partials }
    }

    /// Complete snapshots, ascending by end block.
    pub fn completes(&self) -> &[BlockRange] {
        &self.completes
    }

    /// Partial snapshots, ascending by start block.
    pub fn partials(&self) -> &[BlockRange] {
        &self.partials
    }

    /// The complete snapshot with the largest end block not above `up_to`.
    pub fn last_complete_at_or_before(&self, up_to: BlockNumber) -> Option<BlockRange> {
        self.completes.iter().rev().find(|r| r.end() <= up_to).copied()
    }

    /// Returns `true` if a partial covering exactly `range` exists.
    pub fn contains_partial(&self, range: &BlockRange) -> bool {
        self.partials.binary_search_by_key(&(range.start(), range.end()), |r| (r.start(), r.end())).is_ok()
    }
}

/// Lists snapshot files of a module, retrying transient backend failures.
#[derive(Debug, Clone)]
pub struct SnapshotsProber {
    retries: usize,
    min_delay: Duration,
}

impl Default for SnapshotsProber {
    fn default() -> Self {
        Self { retries: 3, min_delay: Duration::from_millis(250) }
    }
}

impl SnapshotsProber {
    /// Creates a prober retrying transient failures `retries` times.
    pub const fn new(retries: usize, min_delay: Duration) -> Self {
        Self { retries, min_delay }
    }

    /// Lists and classifies the snapshots in `states`, the `{hash}/states` store of `module`.
    pub async fn probe(&self, module: &str, states: &dyn BlobStore) -> Result<Snapshots, ProbeError> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_times(self.retries);

        let names = (|| async { states.walk("").await })
            .retry(backoff)
            .when(BlobError::is_transient)
            .notify(|err: &BlobError, after: Duration| {
                warn!(target: "backfill::storage", %module, %err, ?after, "Listing snapshots failed, retrying");
            })
            .await
            .map_err(|source| ProbeError::Storage { module: module.to_string(), source })?;

        let snapshots = Snapshots::new(names.iter().filter_map(|name| SnapshotFile::parse(name)));
        debug!(
            target: "backfill::storage",
            %module,
            completes = snapshots.completes.len(),
            partials = snapshots.partials.len(),
            "Probed snapshots"
        );
        Ok(snapshots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BlobStore, MemoryBlobStore};
    use assert_matches::assert_matches;
    use bytes::Bytes;

    fn r(start: u64, end: u64) -> BlockRange {
        BlockRange::new(start, end).unwrap()
    }

    async fn seed(store: &MemoryBlobStore, names: &[&str]) {
        for name in names {
            store.write(name, Bytes::new()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn classifies_and_sorts() {
        let store = MemoryBlobStore::new();
        seed(
            &store,
            &[
                "0000000030-0000000000.kv",
                "0000000010-0000000000.kv",
                "0000000040-0000000030.partial",
                "0000000020-0000000010.partial",
                "__lock",
                "notes.txt",
            ],
        )
        .await;

        let snapshots = SnapshotsProber::default().probe("m", &store).await.unwrap();
        assert_eq!(snapshots.completes(), &[r(0, 10), r(0, 30)]);
        assert_eq!(snapshots.partials(), &[r(10, 20), r(30, 40)]);

        assert_eq!(snapshots.last_complete_at_or_before(35), Some(r(0, 30)));
        assert_eq!(snapshots.last_complete_at_or_before(30), Some(r(0, 30)));
        assert_eq!(snapshots.last_complete_at_or_before(29), Some(r(0, 10)));
        assert_eq!(snapshots.last_complete_at_or_before(9), None);

        assert!(snapshots.contains_partial(&r(10, 20)));
        assert!(!snapshots.contains_partial(&r(10, 15)));
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let store = MemoryBlobStore::new();
        seed(&store, &["0000000020-0000000010.partial"]).await;
        store.inject_transient_failures(3);

        let prober = SnapshotsProber::new(3, Duration::from_millis(1));
        let snapshots = prober.probe("m", &store).await.unwrap();
        assert_eq!(snapshots.partials(), &[r(10, 20)]);
    }

    #[tokio::test]
    async fn gives_up_after_retries() {
        let store = MemoryBlobStore::new();
        store.inject_transient_failures(4);

        let prober = SnapshotsProber::new(3, Duration::from_millis(1));
        assert_matches!(
            prober.probe("m", &store).await,
            Err(ProbeError::Storage { module, source }) if module == "m" && source.is_transient()
        );
    }
}
