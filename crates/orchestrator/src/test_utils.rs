//! In-process sub-request runner for tests.

use crate::{
    work::JobKind,
    worker::{Subrequest, SubrequestClient, SubrequestMessage, SubrequestStream, WorkerError},
};
use async_trait::async_trait;
use backfill_primitives::{
    BlockNumber, BlockRange, ModuleHashes, ModuleKind, UpdatePolicy, ValueType,
};
use backfill_storage::{
    BlobStoreRef, ExecOutputCache, OutputFile, OutputItem, StoreConfig, StoreLimits,
};
use futures::{stream, StreamExt};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc, time::Duration};

/// Key incremented by numeric stores.
pub const COUNTER_KEY: &[u8] = b"count";

/// What the fake module of a store writes at every block.
#[derive(Debug, Clone)]
pub enum StoreBehavior {
    /// Applies `value` to `key` with the store policy.
    Apply {
        /// Key updated.
        key: Vec<u8>,
        /// Value applied.
        value: Vec<u8>,
    },
    /// Sets `block:{number}` to the block number.
    PerBlockKey,
    /// Applies the `(key, value)` pairs returned for each block with the store policy.
    Custom(fn(BlockNumber) -> Vec<(Vec<u8>, Vec<u8>)>),
}

impl StoreBehavior {
    fn default_for(value_type: ValueType) -> Self {
        match value_type {
            ValueType::Int64 | ValueType::Float64 | ValueType::BigInt | ValueType::BigDecimal => {
                Self::Apply { key: COUNTER_KEY.to_vec(), value: b"1".to_vec() }
            }
            _ => Self::PerBlockKey,
        }
    }
}

/// Key written by [`StoreBehavior::PerBlockKey`] at `block`.
pub fn block_key(block: BlockNumber) -> Vec<u8> {
    format!("block:{block:010}").into_bytes()
}

/// What happened to a sub-request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The sub-request was received.
    Opened(String, BlockRange),
    /// Its files were written.
    Finished(String, BlockRange),
}

#[derive(Debug, Default)]
struct State {
    history: Vec<ClientEvent>,
    failures: HashMap<(String, BlockNumber), WorkerError>,
    delays: HashMap<(String, BlockNumber), Duration>,
    behaviors: HashMap<String, StoreBehavior>,
    trailer_override: HashMap<(String, BlockNumber), String>,
}

/// Runs sub-requests in-process: writes one partial per store segment, or one output file per
/// cache segment, and replies with the trailer a runner would send.
#[derive(Debug, Clone)]
pub struct TestSubrequestClient {
    storage: BlobStoreRef,
    store_interval: u64,
    exec_out_interval: u64,
    state: Arc<Mutex<State>>,
}

impl TestSubrequestClient {
    /// Creates a client writing into `storage` with the given segment sizes.
    pub fn new(storage: BlobStoreRef, store_interval: u64, exec_out_interval: u64) -> Self {
        Self { storage, store_interval, exec_out_interval, state: Default::default() }
    }

    /// Fails the first sub-request of `module` starting at `start_block` with `error`.
    pub fn fail_once(&self, module: &str, start_block: BlockNumber, error: WorkerError) {
        self.state.lock().failures.insert((module.to_string(), start_block), error);
    }

    /// Delays sub-requests of `module` starting at `start_block`.
    pub fn delay(&self, module: &str, start_block: BlockNumber, delay: Duration) {
        self.state.lock().delays.insert((module.to_string(), start_block), delay);
    }

    /// Sets what `module` writes at every block.
    pub fn behavior(&self, module: &str, behavior: StoreBehavior) {
        self.state.lock().behaviors.insert(module.to_string(), behavior);
    }

    /// Replies with `trailer` to sub-requests of `module` starting at `start_block`, without
    /// writing anything.
    pub fn override_trailer(&self, module: &str, start_block: BlockNumber, trailer: &str) {
        self.state
            .lock()
            .trailer_override
            .insert((module.to_string(), start_block), trailer.to_string());
    }

    /// Sub-requests received, in order.
    pub fn dispatched(&self) -> Vec<(String, BlockRange)> {
        self.state
            .lock()
            .history
            .iter()
            .filter_map(|event| match event {
                ClientEvent::Opened(module, range) => Some((module.clone(), *range)),
                ClientEvent::Finished(..) => None,
            })
            .collect()
    }

    /// Every sub-request event, in order.
    pub fn history(&self) -> Vec<ClientEvent> {
        self.state.lock().history.clone()
    }

    async fn write_partials(
        &self,
        request: &Subrequest,
        range: BlockRange,
    ) -> Result<Vec<BlockRange>, WorkerError> {
        let graph = &request.modules;
        let module = graph
            .module(&request.output_module)
            .map_err(|err| WorkerError::Validation(err.to_string()))?;
        let ModuleKind::Store { update_policy, value_type } = module.kind else {
            return Err(WorkerError::Validation(format!("{} is not a store", module.name)))
        };
        let hash = ModuleHashes::new(graph)
            .get(&module.name)
            .map_err(|err| WorkerError::Validation(err.to_string()))?;
        let config = StoreConfig::new(
            module.name.clone(),
            hash,
            module.initial_block,
            update_policy,
            value_type,
            StoreLimits::default(),
            &self.storage,
        );
        let behavior = self
            .state
            .lock()
            .behaviors
            .get(&module.name)
            .cloned()
            .unwrap_or_else(|| StoreBehavior::default_for(value_type));

        let segments = segments(range, self.store_interval);
        for segment in &segments {
            let mut partial = config.new_partial_kv(segment.start());
            for block in segment.start()..segment.end() {
                let result = match &behavior {
                    StoreBehavior::Apply { key, value } => partial.apply(block, key, value),
                    StoreBehavior::Custom(writes) => writes(block)
                        .into_iter()
                        .try_for_each(|(key, value)| partial.apply(block, &key, &value)),
                    StoreBehavior::PerBlockKey if update_policy == UpdatePolicy::Append => {
                        partial.apply(block, &block_key(block), block.to_string().as_bytes())
                    }
                    StoreBehavior::PerBlockKey => {
                        partial.set(block, &block_key(block), block.to_string().as_bytes())
                    }
                };
                result.map_err(|err| WorkerError::ModuleFailure {
                    reason: err.to_string(),
                    logs: Vec::new(),
                })?;
            }
            partial
                .save(segment.end())
                .await
                .map_err(|err| WorkerError::Transport(err.to_string()))?;
        }
        Ok(segments)
    }

    async fn write_outputs(
        &self,
        request: &Subrequest,
        range: BlockRange,
    ) -> Result<Vec<BlockRange>, WorkerError> {
        let hash = ModuleHashes::new(&request.modules)
            .get(&request.output_module)
            .map_err(|err| WorkerError::Validation(err.to_string()))?;
        let cache = ExecOutputCache::new(request.output_module.clone(), hash, &self.storage);

        let segments = segments(range, self.exec_out_interval);
        for segment in &segments {
            let mut file = OutputFile::new(*segment);
            file.items = (segment.start()..segment.end()).map(output_item).collect();
            cache.save(&file).await.map_err(|err| WorkerError::Transport(err.to_string()))?;
        }
        Ok(segments)
    }
}

#[async_trait]
impl SubrequestClient for TestSubrequestClient {
    async fn open(&self, request: Subrequest) -> Result<SubrequestStream, WorkerError> {
        let range = request
            .range()
            .ok_or_else(|| WorkerError::Validation("empty sub-request".to_string()))?;
        let key = (request.output_module.clone(), request.start_block);
        let (failure, delay, trailer) = {
            let mut state = self.state.lock();
            state.history.push(ClientEvent::Opened(request.output_module.clone(), range));
            (
                state.failures.remove(&key),
                state.delays.get(&key).copied(),
                state.trailer_override.get(&key).cloned(),
            )
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(WorkerError::ModuleFailure { reason, logs }) => {
                let failure = SubrequestMessage::Failure { reason, logs };
                return Ok(stream::iter([Ok(failure)]).boxed())
            }
            Some(err) => return Err(err),
            None => {}
        }

        let partials_written = match trailer {
            Some(trailer) => trailer,
            None => {
                let written = match request.kind {
                    JobKind::Store => self.write_partials(&request, range).await?,
                    JobKind::ExecOut => self.write_outputs(&request, range).await?,
                };
                self.state
                    .lock()
                    .history
                    .push(ClientEvent::Finished(request.output_module.clone(), range));
                written
                    .iter()
                    .map(|range| format!("{}-{}", range.start(), range.end()))
                    .collect::<Vec<_>>()
                    .join(",")
            }
        };
        let messages = [
            Ok(SubrequestMessage::Progress { processed_block: range.end() - 1 }),
            Ok(SubrequestMessage::Trailer { partials_written }),
        ];
        Ok(stream::iter(messages).boxed())
    }
}

/// Cached output of the fake map module at `block`.
pub fn output_item(block: BlockNumber) -> OutputItem {
    OutputItem {
        block_id: format!("0x{block:08x}"),
        block_num: block,
        timestamp: 1_600_000_000 + block,
        cursor: format!("cursor:{block}"),
        payload: block.to_be_bytes().to_vec(),
    }
}

/// Cuts `range` at every multiple of `interval`.
fn segments(range: BlockRange, interval: u64) -> Vec<BlockRange> {
    let mut segments = Vec::new();
    let mut start = range.start();
    while start < range.end() {
        let end = ((start / interval + 1) * interval).min(range.end());
        segments.extend(BlockRange::new(start, end));
        start = end;
    }
    segments
}
