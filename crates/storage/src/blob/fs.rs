use super::{BlobStore, BlobStoreRef};
use crate::BlobError;
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::trace;

/// [`BlobStore`] backed by a local directory.
///
/// Object names map to paths below the root; `/` separated names create sub-directories.
/// Writes go to a hidden temporary file that is renamed over the target on success.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Creates a store rooted at `root`. The directory is created lazily on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, name: &str) -> PathBuf {
        name.split('/').filter(|s| !s.is_empty()).fold(self.root.clone(), |p, s| p.join(s))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn walk(&self, prefix: &str) -> Result<Vec<String>, BlobError> {
        let mut out = Vec::new();
        let mut dirs = vec![(self.root.clone(), String::new())];

        while let Some((dir, relative)) = dirs.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(BlobError::io(relative, err)),
            };
            while let Some(entry) =
                entries.next_entry().await.map_err(|err| BlobError::io(relative.clone(), err))?
            {
                let Some(file_name) = entry.file_name().to_str().map(str::to_string) else {
                    continue
                };
                // in-flight writes
                if file_name.starts_with('.') {
                    continue
                }
                let name = super::join(&relative, &file_name);
                let file_type =
                    entry.file_type().await.map_err(|err| BlobError::io(name.clone(), err))?;
                if file_type.is_dir() {
                    dirs.push((entry.path(), name));
                } else if name.starts_with(prefix) {
                    out.push(name);
                }
            }
        }

        out.sort_unstable();
        Ok(out)
    }

    async fn open(&self, name: &str) -> Result<Bytes, BlobError> {
        tokio::fs::read(self.path(name)).await.map(Bytes::from).map_err(|err| BlobError::io(name, err))
    }

    async fn write(&self, name: &str, content: Bytes) -> Result<(), BlobError> {
        let path = self.path(name);
        let (Some(parent), Some(file_name)) = (path.parent(), path.file_name()) else {
            return Err(BlobError::io(name, io::Error::from(io::ErrorKind::InvalidInput)))
        };
        tokio::fs::create_dir_all(parent).await.map_err(|err| BlobError::io(name, err))?;

        let tmp = parent.join(format!(
            ".{}.{}.tmp",
            file_name.to_string_lossy(),
            uuid::Uuid::new_v4().simple()
        ));
        if let Err(err) = tokio::fs::write(&tmp, &content).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(BlobError::io(name, err))
        }
        if let Err(err) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(BlobError::io(name, err))
        }
        trace!(target: "backfill::storage", ?path, size = content.len(), "Wrote object");
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), BlobError> {
        match tokio::fs::remove_file(self.path(name)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(BlobError::io(name, err)),
        }
    }

    fn sub_store(&self, prefix: &str) -> BlobStoreRef {
        Arc::new(Self { root: self.path(prefix) })
    }
}
