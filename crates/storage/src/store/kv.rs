use super::{codec, operator_for, OperatorError, StoreConfig};
use crate::{SnapshotFile, StoreError};
use backfill_primitives::{BlockNumber, BlockRange, UpdatePolicy, ValueType};
use bytes::Bytes;
use std::collections::BTreeMap;

/// Whether a [`KvStore`] holds the complete state of a module or the mutations of a block range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreKind {
    /// Complete state over `[module initial block, ..)`.
    Full,
    /// Mutations starting at `initial_block`.
    Partial {
        /// First block covered by the partial.
        initial_block: BlockNumber,
        /// Prefixes deleted since `initial_block`, replayed on merge before key updates.
        deleted_prefixes: Vec<Vec<u8>>,
    },
}

/// Kind of change recorded in a [`StoreDelta`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOperation {
    /// The key did not exist.
    Create,
    /// The key existed and its value changed.
    Update,
    /// The key was removed.
    Delete,
}

/// A single recorded store mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreDelta {
    /// Change kind.
    pub operation: DeltaOperation,
    /// Ordinal of the write within its block.
    pub ordinal: u64,
    /// Affected key.
    pub key: Vec<u8>,
    /// Value before the change.
    pub old_value: Option<Vec<u8>>,
    /// Value after the change.
    pub new_value: Option<Vec<u8>>,
}

/// Ordered key-value state of a store module.
///
/// The same type backs complete and partial stores; [`StoreKind`] tells them apart. Writes go
/// through the operator of the store's `(policy, value type)` pair.
#[derive(Debug, Clone)]
pub struct KvStore {
    config: StoreConfig,
    kind: StoreKind,
    update_policy: UpdatePolicy,
    value_type: ValueType,
    kv: BTreeMap<Vec<u8>, Vec<u8>>,
    deltas: Vec<StoreDelta>,
    track_deltas: bool,
    last_ordinal: u64,
}

impl KvStore {
    pub(crate) fn new(config: StoreConfig, kind: StoreKind) -> Self {
        let update_policy = config.update_policy();
        let value_type = config.value_type();
        Self {
            config,
            kind,
            update_policy,
            value_type,
            kv: BTreeMap::new(),
            deltas: Vec::new(),
            track_deltas: false,
            last_ordinal: 0,
        }
    }

    pub(crate) fn from_parts(
        config: StoreConfig,
        kind: StoreKind,
        update_policy: UpdatePolicy,
        value_type: ValueType,
        kv: BTreeMap<Vec<u8>, Vec<u8>>,
    ) -> Self {
        Self { update_policy, value_type, kv, ..Self::new(config, kind) }
    }

    /// Enables delta recording.
    pub fn with_deltas(mut self) -> Self {
        self.track_deltas = true;
        self
    }

    /// Store configuration.
    pub const fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Module name.
    pub fn name(&self) -> &str {
        self.config.name()
    }

    /// Full or partial.
    pub const fn kind(&self) -> &StoreKind {
        &self.kind
    }

    /// Update policy recorded in the store.
    pub const fn update_policy(&self) -> UpdatePolicy {
        self.update_policy
    }

    /// Value type recorded in the store.
    pub const fn value_type(&self) -> ValueType {
        self.value_type
    }

    /// First block covered by this store.
    pub fn initial_block(&self) -> BlockNumber {
        match &self.kind {
            StoreKind::Full => self.config.module_initial_block(),
            StoreKind::Partial { initial_block, .. } => *initial_block,
        }
    }

    /// Prefixes deleted by a partial store. Empty for complete stores.
    pub fn deleted_prefixes(&self) -> &[Vec<u8>] {
        match &self.kind {
            StoreKind::Full => &[],
            StoreKind::Partial { deleted_prefixes, .. } => deleted_prefixes,
        }
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.kv.len()
    }

    /// Returns `true` if the store holds no key.
    pub fn is_empty(&self) -> bool {
        self.kv.is_empty()
    }

    /// Iterates over all entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> + '_ {
        self.kv.iter().map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    pub(crate) const fn entries(&self) -> &BTreeMap<Vec<u8>, Vec<u8>> {
        &self.kv
    }

    /// Value of `key`.
    pub fn get_last(&self, key: &[u8]) -> Option<&[u8]> {
        self.kv.get(key).map(Vec::as_slice)
    }

    /// First entry whose key starts with `prefix`.
    pub fn get_first(&self, prefix: &[u8]) -> Option<(&[u8], &[u8])> {
        self.kv
            .range(prefix.to_vec()..)
            .next()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    /// Returns `true` if any key starts with `prefix`.
    pub fn has_prefix(&self, prefix: &[u8]) -> bool {
        self.get_first(prefix).is_some()
    }

    /// Recorded deltas.
    pub fn deltas(&self) -> &[StoreDelta] {
        &self.deltas
    }

    /// Highest ordinal applied so far.
    pub const fn last_ordinal(&self) -> u64 {
        self.last_ordinal
    }

    /// Clears recorded deltas, keeping the state. Called at block boundaries.
    pub fn reset_deltas(&mut self) {
        self.deltas.clear();
        self.last_ordinal = 0;
    }

    /// Sets `key` to `value`, regardless of the store policy.
    pub fn set(&mut self, ordinal: u64, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.check_ordinal(ordinal)?;
        self.write(ordinal, key, value.to_vec())
    }

    /// Sets `key` to `value` if it is not present.
    pub fn set_if_not_exists(
        &mut self,
        ordinal: u64,
        key: &[u8],
        value: &[u8],
    ) -> Result<(), StoreError> {
        self.check_ordinal(ordinal)?;
        if self.kv.contains_key(key) {
            return Ok(())
        }
        self.write(ordinal, key, value.to_vec())
    }

    /// Applies the store's update policy to `key` with the incoming `value`.
    pub fn apply(&mut self, ordinal: u64, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.check_ordinal(ordinal)?;
        let op = operator_for(self.update_policy, self.value_type)
            .map_err(|err| self.operator_error(key, err))?;
        let next = op(self.get_last(key), value, &self.config.limits())
            .map_err(|err| self.operator_error(key, err))?;
        match next {
            Some(next) => self.write(ordinal, key, next),
            None => Ok(()),
        }
    }

    /// Deletes every key starting with `prefix`. Partial stores remember the prefix.
    pub fn delete_prefix(&mut self, ordinal: u64, prefix: &[u8]) -> Result<(), StoreError> {
        self.check_ordinal(ordinal)?;
        self.remove_prefix(ordinal, prefix);
        if let StoreKind::Partial { deleted_prefixes, .. } = &mut self.kind {
            deleted_prefixes.push(prefix.to_vec());
        }
        Ok(())
    }

    /// Folds a partial store into this one.
    ///
    /// Deleted prefixes of the partial are applied first, then each of its keys goes through the
    /// operator of the store's `(policy, value type)` pair.
    pub fn merge(&mut self, partial: &Self) -> Result<(), StoreError> {
        if self.update_policy != partial.update_policy || self.value_type != partial.value_type {
            return Err(StoreError::policy_mismatch(
                self.name(),
                (self.update_policy, self.value_type),
                (partial.update_policy, partial.value_type),
            ))
        }
        let op = operator_for(self.update_policy, self.value_type)
            .map_err(|err| self.operator_error(&[], err))?;

        let ordinal = self.last_ordinal;
        for prefix in partial.deleted_prefixes() {
            self.remove_prefix(ordinal, prefix);
        }

        let limits = self.config.limits();
        for (key, value) in &partial.kv {
            let next = op(self.kv.get(key).map(Vec::as_slice), value, &limits)
                .map_err(|err| self.operator_error(key, err))?;
            if let Some(next) = next {
                self.write(ordinal, key, next)?;
            }
        }
        Ok(())
    }

    /// Creates an empty partial store with the same configuration.
    pub fn derive_partial(&self, initial_block: BlockNumber) -> Self {
        let mut partial = self.config.new_partial_kv(initial_block);
        partial.track_deltas = self.track_deltas;
        partial
    }

    /// Snapshot file this store is persisted under when it ends at `end`.
    pub fn snapshot_file(&self, end: BlockNumber) -> Option<SnapshotFile> {
        match self.kind {
            StoreKind::Full => SnapshotFile::full(self.initial_block(), end),
            StoreKind::Partial { initial_block, .. } => {
                BlockRange::new(initial_block, end).map(SnapshotFile::partial)
            }
        }
    }

    /// Serializes the store.
    pub fn encode(&self) -> Result<Bytes, StoreError> {
        codec::encode(self)
    }

    /// Persists the store as the snapshot ending at `end`.
    pub async fn save(&self, end: BlockNumber) -> Result<SnapshotFile, StoreError> {
        let file = self.snapshot_file(end).ok_or_else(|| StoreError::Codec {
            name: self.name().to_string(),
            cause: format!("store starting at {} cannot end at {end}", self.initial_block()),
        })?;
        let bytes = self.encode()?;
        self.config.objects().write(&file.filename(), bytes).await?;
        Ok(file)
    }

    fn check_ordinal(&mut self, ordinal: u64) -> Result<(), StoreError> {
        if ordinal < self.last_ordinal {
            return Err(StoreError::OrdinalRegression {
                module: self.name().to_string(),
                ordinal,
                last: self.last_ordinal,
            })
        }
        self.last_ordinal = ordinal;
        Ok(())
    }

    fn write(&mut self, ordinal: u64, key: &[u8], value: Vec<u8>) -> Result<(), StoreError> {
        if key.is_empty() || key[0] == 0xFF {
            return Err(StoreError::InvalidKey {
                module: self.name().to_string(),
                key: String::from_utf8_lossy(key).into_owned(),
            })
        }
        let limit = self.config.limits().value_size_limit;
        if value.len() > limit {
            return Err(StoreError::ValueTooLarge {
                module: self.name().to_string(),
                key: String::from_utf8_lossy(key).into_owned(),
                size: value.len(),
                limit,
            })
        }

        let new_value = self.track_deltas.then(|| value.clone());
        let old_value = self.kv.insert(key.to_vec(), value);
        if self.track_deltas {
            let operation =
                if old_value.is_some() { DeltaOperation::Update } else { DeltaOperation::Create };
            self.deltas.push(StoreDelta { operation, ordinal, key: key.to_vec(), old_value, new_value });
        }
        Ok(())
    }

    fn remove_prefix(&mut self, ordinal: u64, prefix: &[u8]) {
        let keys: Vec<Vec<u8>> = self
            .kv
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            let old_value = self.kv.remove(&key);
            if self.track_deltas {
                self.deltas.push(StoreDelta {
                    operation: DeltaOperation::Delete,
                    ordinal,
                    key,
                    old_value,
                    new_value: None,
                });
            }
        }
    }

    fn operator_error(&self, key: &[u8], err: OperatorError) -> StoreError {
        let module = self.name().to_string();
        let key = String::from_utf8_lossy(key).into_owned();
        match err {
            OperatorError::Unsupported { policy, value_type } => StoreError::PolicyMismatch {
                module,
                cause: format!("policy {policy} does not support value type {value_type}"),
            },
            OperatorError::AppendLimit { size, limit } => {
                StoreError::AppendLimit { module, key, size, limit }
            }
            OperatorError::InvalidNumber { value, cause } => StoreError::InvalidNumber {
                module,
                key,
                value_type: self.value_type,
                cause: format!("{value:?}: {cause}"),
            },
        }
    }
}
