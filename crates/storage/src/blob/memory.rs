use super::{BlobStore, BlobStoreRef};
use crate::BlobError;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

#[derive(Debug, Default)]
struct Inner {
    objects: RwLock<BTreeMap<String, Bytes>>,
    /// Number of upcoming operations that fail with a transient backend error.
    failures: AtomicUsize,
}

/// In-memory [`BlobStore`]. Sub-stores share the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    inner: Arc<Inner>,
    prefix: String,
}

impl MemoryBlobStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` operations fail with a transient error.
    pub fn inject_transient_failures(&self, count: usize) {
        self.inner.failures.store(count, Ordering::SeqCst);
    }

    /// Returns `true` if the object exists.
    pub fn exists(&self, name: &str) -> bool {
        self.inner.objects.read().contains_key(&self.full_name(name))
    }

    /// Names of all objects below this store, relative to it.
    pub fn names(&self) -> Vec<String> {
        let base = self.full_name("");
        self.inner
            .objects
            .read()
            .keys()
            .filter_map(|key| key.strip_prefix(&base).map(str::to_string))
            .collect()
    }

    fn full_name(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{name}", self.prefix)
        }
    }

    fn maybe_fail(&self) -> Result<(), BlobError> {
        let failed = self
            .inner
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(BlobError::Backend {
                message: "injected transient failure".to_string(),
                transient: true,
            })
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn walk(&self, prefix: &str) -> Result<Vec<String>, BlobError> {
        self.maybe_fail()?;
        let base = self.full_name("");
        let full = self.full_name(prefix);
        Ok(self
            .inner
            .objects
            .read()
            .range(full.clone()..)
            .take_while(|(key, _)| key.starts_with(&full))
            .filter_map(|(key, _)| key.strip_prefix(&base).map(str::to_string))
            .collect())
    }

    async fn open(&self, name: &str) -> Result<Bytes, BlobError> {
        self.maybe_fail()?;
        self.inner
            .objects
            .read()
            .get(&self.full_name(name))
            .cloned()
            .ok_or_else(|| BlobError::NotFound(name.to_string()))
    }

    async fn write(&self, name: &str, content: Bytes) -> Result<(), BlobError> {
        self.maybe_fail()?;
        self.inner.objects.write().insert(self.full_name(name), content);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), BlobError> {
        self.maybe_fail()?;
        self.inner.objects.write().remove(&self.full_name(name));
        Ok(())
    }

    fn sub_store(&self, prefix: &str) -> BlobStoreRef {
        Arc::new(Self { inner: Arc::clone(&self.inner), prefix: super::join(&self.prefix, prefix) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn sub_stores_share_objects() {
        let root = MemoryBlobStore::new();
        let states = root.sub_store("abc/states");
        states.write("0000000010-0000000000.kv", Bytes::from_static(b"kv")).await.unwrap();
        root.write("abcd/other", Bytes::from_static(b"x")).await.unwrap();

        assert!(root.exists("abc/states/0000000010-0000000000.kv"));
        assert_eq!(states.walk("").await.unwrap(), vec!["0000000010-0000000000.kv".to_string()]);
        assert_eq!(root.sub_store("abc").walk("states/").await.unwrap().len(), 1);
        assert_eq!(
            states.open("0000000010-0000000000.kv").await.unwrap(),
            Bytes::from_static(b"kv")
        );

        states.delete("0000000010-0000000000.kv").await.unwrap();
        states.delete("0000000010-0000000000.kv").await.unwrap();
        assert_matches!(
            states.open("0000000010-0000000000.kv").await,
            Err(BlobError::NotFound(_))
        );
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let store = MemoryBlobStore::new();
        store.inject_transient_failures(1);
        let err = store.walk("").await.unwrap_err();
        assert!(err.is_transient());
        assert!(store.walk("").await.unwrap().is_empty());
    }
}
