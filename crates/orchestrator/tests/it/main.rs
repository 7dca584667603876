//! Backfill scenarios run end to end against an in-process sub-request runner.

use backfill_config::BackfillConfig;
use backfill_orchestrator::{
    response_channel, test_utils::TestSubrequestClient, BackfillEngine, BackfillError, Request,
    Response, StoreMap, WorkerPool,
};
use backfill_primitives::{BlockNumber, BlockRange, Module, ModuleGraph, ModuleHashes, ModuleKind};
use backfill_storage::{
    BlobStoreRef, MemoryBlobStore, Snapshots, SnapshotsProber, StoreConfig, StoreLimits,
};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

mod production;
mod stores;

const fn main() {}

/// Segment size of store snapshots and of the output cache.
const INTERVAL: u64 = 10;

/// Latest final block used by scenarios, well above their ranges.
const FINAL_BLOCK: BlockNumber = 1_000;

fn r(start: BlockNumber, end: BlockNumber) -> BlockRange {
    BlockRange::new(start, end).unwrap()
}

fn config() -> BackfillConfig {
    let mut config = BackfillConfig::default().with_intervals(INTERVAL, INTERVAL);
    config.output_poll_interval = Duration::from_millis(10);
    config.progress_interval = Duration::from_millis(20);
    config.worker_receive_timeout = Duration::from_secs(10);
    config
}

/// An engine wired to a [`TestSubrequestClient`] sharing its storage.
struct Harness {
    graph: Arc<ModuleGraph>,
    storage: BlobStoreRef,
    client: TestSubrequestClient,
    engine: BackfillEngine,
}

impl Harness {
    fn new(modules: Vec<Module>, config: BackfillConfig) -> Self {
        Self::with_storage(modules, config, Arc::new(MemoryBlobStore::new()))
    }

    fn with_storage(modules: Vec<Module>, config: BackfillConfig, storage: BlobStoreRef) -> Self {
        backfill_tracing::init_test_tracing();
        let graph = Arc::new(ModuleGraph::new(modules).unwrap());
        let client = TestSubrequestClient::new(
            storage.clone(),
            config.store_snapshots_save_interval,
            config.exec_output_save_interval,
        );
        let pool = Arc::new(WorkerPool::new(Arc::new(client.clone()), config.parallel_subrequests));
        let engine = BackfillEngine::new(config, storage.clone(), pool);
        Self { graph, storage, client, engine }
    }

    fn request(&self, output_module: &str) -> Request {
        Request::new(self.graph.clone(), output_module)
    }

    /// Storage view of a store module, as the engine builds it.
    fn store(&self, name: &str) -> StoreConfig {
        let module = self.graph.module(name).unwrap();
        let ModuleKind::Store { update_policy, value_type } = module.kind else {
            panic!("{name} is not a store")
        };
        StoreConfig::new(
            name,
            ModuleHashes::new(&self.graph).get(name).unwrap(),
            module.initial_block,
            update_policy,
            value_type,
            StoreLimits::default(),
            &self.storage,
        )
    }

    async fn snapshots(&self, name: &str) -> Snapshots {
        self.store(name).list_snapshots(&SnapshotsProber::default()).await.unwrap()
    }

    async fn run(&self, request: Request) -> (Result<StoreMap, BackfillError>, Vec<Response>) {
        self.run_with_cancel(request, CancellationToken::new()).await
    }

    async fn run_with_cancel(
        &self,
        request: Request,
        cancel: CancellationToken,
    ) -> (Result<StoreMap, BackfillError>, Vec<Response>) {
        let (tx, mut rx) = response_channel(1024);
        let collect = async move {
            let mut responses = Vec::new();
            while let Some(response) = rx.recv().await {
                responses.push(response);
            }
            responses
        };
        tokio::join!(self.engine.run(&request, FINAL_BLOCK, tx, cancel), collect)
    }
}

/// Value of `key` in the store `name` of `stores`, as text.
fn value(stores: &StoreMap, name: &str, key: &[u8]) -> Option<String> {
    stores
        .get(name)
        .and_then(|store| store.get_last(key))
        .map(|value| String::from_utf8(value.to_vec()).unwrap())
}
