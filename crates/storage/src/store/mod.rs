//! Store state: complete and partial key-value stores, their merge operators and persistence.

use crate::{BlobStoreRef, ProbeError, SnapshotFile, Snapshots, SnapshotsProber, StoreError};
use backfill_primitives::{BlockNumber, BlockRange, ModuleHash, UpdatePolicy, ValueType};
use tracing::trace;

mod codec;
mod kv;
mod operator;

pub use kv::{DeltaOperation, KvStore, StoreDelta, StoreKind};
pub use operator::{operator_for, Operator, OperatorError};

/// Default maximum size of an appended value, in bytes.
pub const DEFAULT_APPEND_LIMIT: usize = 8 * 1024;

/// Default maximum size of any value, in bytes.
pub const DEFAULT_VALUE_SIZE_LIMIT: usize = 10 * 1024 * 1024;

/// Per-key size limits of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLimits {
    /// Maximum size of a value produced by [`UpdatePolicy::Append`].
    pub append_limit: usize,
    /// Maximum size of any value.
    pub value_size_limit: usize,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self { append_limit: DEFAULT_APPEND_LIMIT, value_size_limit: DEFAULT_VALUE_SIZE_LIMIT }
    }
}

/// Identity and persistence location of one store module.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    name: String,
    module_hash: ModuleHash,
    module_initial_block: BlockNumber,
    update_policy: UpdatePolicy,
    value_type: ValueType,
    limits: StoreLimits,
    /// The `{hash}/states` sub-store.
    objects: BlobStoreRef,
}

impl StoreConfig {
    /// Creates the configuration of a store, rooting its snapshots at `{hash}/states` in `base`.
    pub fn new(
        name: impl Into<String>,
        module_hash: ModuleHash,
        module_initial_block: BlockNumber,
        update_policy: UpdatePolicy,
        value_type: ValueType,
        limits: StoreLimits,
        base: &BlobStoreRef,
    ) -> Self {
        let objects = base.sub_store(&format!("{}/states", module_hash.to_hex()));
        Self {
            name: name.into(),
            module_hash,
            module_initial_block,
            update_policy,
            value_type,
            limits,
            objects,
        }
    }

    /// Module name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Module hash.
    pub const fn module_hash(&self) -> ModuleHash {
        self.module_hash
    }

    /// First block of the module.
    pub const fn module_initial_block(&self) -> BlockNumber {
        self.module_initial_block
    }

    /// Declared update policy.
    pub const fn update_policy(&self) -> UpdatePolicy {
        self.update_policy
    }

    /// Declared value type.
    pub const fn value_type(&self) -> ValueType {
        self.value_type
    }

    /// Size limits.
    pub const fn limits(&self) -> StoreLimits {
        self.limits
    }

    /// The `{hash}/states` store holding snapshot files.
    pub fn objects(&self) -> &BlobStoreRef {
        &self.objects
    }

    /// Empty complete store starting at the module initial block.
    pub fn new_full_kv(&self) -> KvStore {
        KvStore::new(self.clone(), StoreKind::Full)
    }

    /// Empty partial store starting at `initial_block`.
    pub fn new_partial_kv(&self, initial_block: BlockNumber) -> KvStore {
        KvStore::new(self.clone(), StoreKind::Partial { initial_block, deleted_prefixes: Vec::new() })
    }

    /// Lists the snapshots of this store.
    pub async fn list_snapshots(&self, prober: &SnapshotsProber) -> Result<Snapshots, ProbeError> {
        prober.probe(&self.name, self.objects.as_ref()).await
    }

    /// Loads the complete snapshot ending at `end`.
    pub async fn load_full(&self, end: BlockNumber) -> Result<KvStore, StoreError> {
        let file = SnapshotFile::full(self.module_initial_block, end).ok_or_else(|| {
            StoreError::Codec {
                name: self.name.clone(),
                cause: format!("complete snapshot cannot end at {end}, before the module starts"),
            }
        })?;
        self.load(file).await
    }

    /// Loads the partial snapshot covering `range`.
    pub async fn load_partial(&self, range: BlockRange) -> Result<KvStore, StoreError> {
        self.load(SnapshotFile::partial(range)).await
    }

    async fn load(&self, file: SnapshotFile) -> Result<KvStore, StoreError> {
        let name = file.filename();
        let bytes = self.objects.open(&name).await?;
        let store = codec::decode(self.clone(), &name, &bytes, file)?;
        trace!(target: "backfill::storage", module = %self.name, file = %name, keys = store.len(), "Loaded snapshot");
        Ok(store)
    }

    /// Deletes a snapshot file.
    pub async fn delete(&self, file: SnapshotFile) -> Result<(), StoreError> {
        Ok(self.objects.delete(&file.filename()).await?)
    }
}
