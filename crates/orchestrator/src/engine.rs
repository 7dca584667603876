//! Runs the parallel backfill of a request.

use crate::{
    output::LinearOutputReader,
    progress::ProgressEmitter,
    request::{Request, RequestDetails, RequestPlan},
    response::{DebugSnapshotData, Response, ResponseSender, SessionInit},
    scheduler::Scheduler,
    squasher::{MultiSquasher, SquasherEvent, StoreMap},
    work::{JobQueue, WorkPlan},
    worker::WorkerPool,
    BackfillError,
};
use backfill_config::BackfillConfig;
use backfill_primitives::{BlockNumber, Module, ModuleHashes, ModuleKind};
use backfill_storage::{
    BlobStoreRef, ExecOutputCache, KvStore, SnapshotsProber, StoreConfig, StoreLimits,
};
use std::{mem, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::AbortOnDropHandle};
use tracing::{debug, error, info, Instrument};

/// Number of store entries per [`DebugSnapshotData`] message.
pub const DEBUG_SNAPSHOT_BATCH_SIZE: usize = 100;

/// Initial delay between two storage listing attempts.
const STORAGE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Builds the stores of a request up to its linear handoff block and streams cached outputs
/// below it.
///
/// One engine serves many requests. Each [`BackfillEngine::run`] call owns its squashers and
/// reader, the [`WorkerPool`] is shared.
#[derive(Debug, Clone)]
pub struct BackfillEngine {
    config: BackfillConfig,
    storage: BlobStoreRef,
    pool: Arc<WorkerPool>,
}

impl BackfillEngine {
    /// Creates an engine persisting state in `storage` and running sub-requests on `pool`.
    pub const fn new(config: BackfillConfig, storage: BlobStoreRef, pool: Arc<WorkerPool>) -> Self {
        Self { config, storage, pool }
    }

    /// Engine configuration.
    pub const fn config(&self) -> &BackfillConfig {
        &self.config
    }

    /// Serves the parallel part of `request`.
    ///
    /// Messages are sent on `responses`, starting with [`Response::SessionInit`]. Returns the
    /// state of every store required by the output module, valid at the linear handoff block.
    /// Cancelling `cancel` stops workers, squashers and the reader.
    pub async fn run(
        &self,
        request: &Request,
        recent_final_block: BlockNumber,
        responses: ResponseSender,
        cancel: CancellationToken,
    ) -> Result<StoreMap, BackfillError> {
        self.config.validate().map_err(|err| BackfillError::InvalidRequest(err.to_string()))?;
        let details = RequestDetails::resolve(
            request,
            recent_final_block,
            self.config.store_snapshots_save_interval,
        )?;

        let span = tracing::info_span!(
            target: "backfill::engine",
            "backfill_request",
            trace_id = %details.trace_id,
            output_module = %details.output_module,
            start_block = details.resolved_start_block,
            handoff = details.linear_handoff_block,
        );
        let result = self.run_resolved(request, &details, responses, cancel).instrument(span).await;
        match &result {
            Ok(stores) => {
                info!(target: "backfill::engine", trace_id = %details.trace_id, stores = stores.len(), "Backfill complete")
            }
            Err(err) if err.is_cancelled() => {
                debug!(target: "backfill::engine", trace_id = %details.trace_id, "Backfill cancelled")
            }
            Err(err) => {
                error!(target: "backfill::engine", trace_id = %details.trace_id, %err, "Backfill failed")
            }
        }
        result
    }

    async fn run_resolved(
        &self,
        request: &Request,
        details: &RequestDetails,
        responses: ResponseSender,
        cancel: CancellationToken,
    ) -> Result<StoreMap, BackfillError> {
        let config = &self.config;
        // stops every task of this request when it returns, whatever the outcome
        let cancel = cancel.child_token();
        let _guard = cancel.clone().drop_guard();

        responses
            .send(Response::SessionInit(SessionInit {
                trace_id: details.trace_id.clone(),
                resolved_start_block: details.resolved_start_block,
                linear_handoff_block: details.linear_handoff_block,
                max_parallel_workers: config.parallel_subrequests.min(self.pool.size()),
            }))
            .await?;

        let graph = request.modules.clone();
        let hashes = ModuleHashes::new(&graph);
        let plan = RequestPlan::new(details, config.exec_output_save_interval);
        debug!(target: "backfill::engine", ?plan, "Request plan");

        let limits = StoreLimits {
            append_limit: config.append_limit,
            value_size_limit: config.value_size_limit,
        };
        let stores = graph
            .stores_down_to(&details.output_module)?
            .into_iter()
            .filter_map(|module| self.store_config(module, &hashes, limits).transpose())
            .collect::<Result<Vec<_>, _>>()?;
        let exec_out = match plan.exec_out_segmenter() {
            Some(segmenter) => {
                let hash = hashes.get(&details.output_module)?;
                Some((ExecOutputCache::new(&details.output_module, hash, &self.storage), segmenter))
            }
            None => None,
        };

        let prober = SnapshotsProber::new(config.storage_retry_attempts, STORAGE_RETRY_DELAY);
        let work_up_to = plan.build_stores.map_or(details.graph_initial_block, |range| range.end());
        let work = WorkPlan::build(
            &stores,
            work_up_to,
            config.store_snapshots_save_interval,
            exec_out.as_ref().map(|(cache, segmenter)| (cache, *segmenter)),
            &prober,
        )
        .await?;
        let jobs = work.jobs(&graph, config.subrequests_split_size)?;

        let mut progress = ProgressEmitter::new(&work, responses.clone(), config.progress_interval);
        progress.send_initial().await?;

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let squashers =
            MultiSquasher::spawn(stores.into_iter().zip(work.stores.iter().cloned()), config, events_tx, &cancel);

        let reader = match (exec_out, plan.read_exec_out) {
            (Some((cache, segmenter)), Some(range)) => {
                let reader = LinearOutputReader::new(
                    cache,
                    segmenter,
                    range,
                    config.output_poll_interval,
                    responses.clone(),
                );
                let span = tracing::debug_span!(target: "backfill::reader", "linear_reader");
                Some(AbortOnDropHandle::new(tokio::spawn(reader.run(cancel.clone()).instrument(span))))
            }
            _ => None,
        };

        let scheduled = Scheduler::new(
            JobQueue::new(jobs, work.initial_progress()),
            self.pool.clone(),
            graph.clone(),
            details.trace_id.clone(),
            config,
        )
        .run(&squashers, &mut events, &mut progress, &cancel)
        .await;
        if scheduled.as_ref().is_err_and(|err| !err.is_cancelled()) {
            cancel.cancel();
        }

        let squashed = squashers.wait_until_done(&cancel).await;
        let stores = match (scheduled, squashed) {
            (Err(err), _) if !err.is_cancelled() => return Err(err),
            (_, Err(err)) | (Err(err), Ok(_)) => return Err(err),
            (Ok(()), Ok(stores)) => stores,
        };

        while let Ok(event) = events.try_recv() {
            if let SquasherEvent::Merged { module, range } = event {
                progress.merged(&module, range);
            }
        }
        progress.finish().await?;

        if let Some(reader) = reader {
            let last_sent = reader.await.map_err(|err| BackfillError::Panicked {
                module: details.output_module.clone(),
                message: err.to_string(),
            })??;
            debug!(target: "backfill::engine", ?last_sent, "Cached outputs streamed");
        }

        self.send_debug_snapshots(details, &stores, &responses).await?;
        Ok(stores)
    }

    fn store_config(
        &self,
        module: &Module,
        hashes: &ModuleHashes,
        limits: StoreLimits,
    ) -> Result<Option<StoreConfig>, BackfillError> {
        let ModuleKind::Store { update_policy, value_type } = module.kind else { return Ok(None) };
        Ok(Some(StoreConfig::new(
            module.name.clone(),
            hashes.get(&module.name)?,
            module.initial_block,
            update_policy,
            value_type,
            limits,
            &self.storage,
        )))
    }

    async fn send_debug_snapshots(
        &self,
        details: &RequestDetails,
        stores: &StoreMap,
        responses: &ResponseSender,
    ) -> Result<(), BackfillError> {
        if details.debug_initial_snapshot_modules.is_empty() {
            return Ok(())
        }
        for module in &details.debug_initial_snapshot_modules {
            let Some(store) = stores.get(module) else {
                debug!(target: "backfill::engine", %module, "Store not required by the output module, no debug snapshot");
                continue
            };
            send_store_entries(module, store, responses).await?;
        }
        responses.send(Response::DebugSnapshotComplete).await
    }
}

async fn send_store_entries(
    module: &str,
    store: &KvStore,
    responses: &ResponseSender,
) -> Result<(), BackfillError> {
    let mut batch = Vec::with_capacity(DEBUG_SNAPSHOT_BATCH_SIZE);
    for (key, value) in store.iter() {
        batch.push((key.to_vec(), value.to_vec()));
        if batch.len() == DEBUG_SNAPSHOT_BATCH_SIZE {
            let entries = mem::replace(&mut batch, Vec::with_capacity(DEBUG_SNAPSHOT_BATCH_SIZE));
            responses
                .send(Response::DebugSnapshotData(DebugSnapshotData {
                    module: module.to_string(),
                    entries,
                }))
                .await?;
        }
    }
    if !batch.is_empty() {
        responses
            .send(Response::DebugSnapshotData(DebugSnapshotData {
                module: module.to_string(),
                entries: batch,
            }))
            .await?;
    }
    Ok(())
}
