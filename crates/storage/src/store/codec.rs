//! Snapshot encoding: a magic header followed by a postcard-encoded [`SnapshotData`].

use super::{KvStore, StoreConfig, StoreKind};
use crate::{SnapshotFile, SnapshotKind, StoreError};
use backfill_primitives::{BlockNumber, UpdatePolicy, ValueType};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::{borrow::Cow, collections::BTreeMap};

const MAGIC: &[u8; 4] = b"BFKV";
const VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum DataKind {
    Full,
    Partial,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotData<'a> {
    kind: DataKind,
    update_policy: UpdatePolicy,
    value_type: ValueType,
    initial_block: BlockNumber,
    kv: Cow<'a, BTreeMap<Vec<u8>, Vec<u8>>>,
    deleted_prefixes: Cow<'a, [Vec<u8>]>,
}

pub(super) fn encode(store: &KvStore) -> Result<Bytes, StoreError> {
    let data = SnapshotData {
        kind: match store.kind() {
            StoreKind::Full => DataKind::Full,
            StoreKind::Partial { .. } => DataKind::Partial,
        },
        update_policy: store.update_policy(),
        value_type: store.value_type(),
        initial_block: store.initial_block(),
        kv: Cow::Borrowed(store.entries()),
        deleted_prefixes: Cow::Borrowed(store.deleted_prefixes()),
    };

    let mut buf = BytesMut::new();
    buf.put_slice(MAGIC);
    buf.put_u8(VERSION);
    let buf = postcard::to_extend(&data, buf).map_err(|err| StoreError::Codec {
        name: store.name().to_string(),
        cause: err.to_string(),
    })?;
    Ok(buf.freeze())
}

pub(super) fn decode(
    config: StoreConfig,
    name: &str,
    bytes: &[u8],
    file: SnapshotFile,
) -> Result<KvStore, StoreError> {
    let codec_err = |cause: String| StoreError::Codec { name: name.to_string(), cause };

    let body = bytes
        .strip_prefix(MAGIC.as_slice())
        .ok_or_else(|| codec_err("missing snapshot header".to_string()))?;
    let (&version, body) =
        body.split_first().ok_or_else(|| codec_err("truncated snapshot header".to_string()))?;
    if version != VERSION {
        return Err(codec_err(format!("unsupported snapshot version {version}")))
    }

    let data: SnapshotData<'static> =
        postcard::from_bytes(body).map_err(|err| codec_err(err.to_string()))?;

    let kind = match (data.kind, file.kind) {
        (DataKind::Full, SnapshotKind::Full) => {
            if (data.update_policy, data.value_type) != (config.update_policy(), config.value_type())
            {
                return Err(StoreError::policy_mismatch(
                    config.name(),
                    (config.update_policy(), config.value_type()),
                    (data.update_policy, data.value_type),
                ))
            }
            StoreKind::Full
        }
        (DataKind::Partial, SnapshotKind::Partial) => StoreKind::Partial {
            initial_block: file.range.start(),
            deleted_prefixes: data.deleted_prefixes.into_owned(),
        },
        (found, _) => {
            return Err(codec_err(format!("{found:?} snapshot stored as {:?}", file.kind)))
        }
    };

    Ok(KvStore::from_parts(config, kind, data.update_policy, data.value_type, data.kv.into_owned()))
}
