use super::{Squasher, SquasherError, SquasherEventsSender, SquasherOutput, StoreMap};
use crate::{error::panic_message, work::WorkUnit, BackfillError, MissingRanges};
use backfill_config::BackfillConfig;
use backfill_primitives::BlockRanges;
use backfill_storage::StoreConfig;
use futures::future::join_all;
use std::collections::HashMap;
use tokio::{sync::mpsc, task::JoinError};
use tokio_util::{sync::CancellationToken, task::AbortOnDropHandle};
use tracing::{debug, Instrument};

type SquasherHandle = AbortOnDropHandle<Result<SquasherOutput, SquasherError>>;

/// Runs one [`Squasher`] task per store and routes completed partials to them.
///
/// Dropping it aborts the squasher tasks.
#[derive(Debug)]
pub struct MultiSquasher {
    inputs: HashMap<String, mpsc::Sender<BlockRanges>>,
    /// Squasher tasks, with what their store misses before any merge.
    tasks: Vec<(MissingRanges, SquasherHandle)>,
}

impl MultiSquasher {
    /// Spawns a squasher for every `(store, unit)` pair.
    ///
    /// A squasher failing cancels `cancel`, which stops every other component of the request.
    pub fn spawn(
        stores: impl IntoIterator<Item = (StoreConfig, WorkUnit)>,
        config: &BackfillConfig,
        events: SquasherEventsSender,
        cancel: &CancellationToken,
    ) -> Self {
        let mut inputs = HashMap::new();
        let mut tasks = Vec::new();
        for (store, unit) in stores {
            let module = unit.module.clone();
            let initial = MissingRanges {
                module: module.clone(),
                next_expected_start: unit.next_expected_start(),
                target_end: unit.work_up_to,
                pending: BlockRanges::new(),
            };
            let (tx, rx) = mpsc::channel(config.squasher_input_buffer.max(1));
            let interval = config.store_snapshots_save_interval;
            let io_concurrency = config.squasher_io_concurrency;
            let events = events.clone();
            let cancel = cancel.clone();
            let missing = initial.clone();

            let span = tracing::debug_span!(target: "backfill::squasher", "squasher", module = %module);
            let task = async move {
                let result = match Squasher::load(store, &unit, interval, io_concurrency, events).await
                {
                    Ok(squasher) => squasher.run(rx, cancel.clone()).await,
                    Err(source) => Err(SquasherError { missing, source }),
                };
                if let Err(err) = &result {
                    if !err.is_cancelled() {
                        debug!(target: "backfill::squasher", %err, "Squasher failed, cancelling request");
                        cancel.cancel();
                    }
                }
                result
            };
            tasks.push((initial, AbortOnDropHandle::new(tokio::spawn(task.instrument(span)))));
            inputs.insert(module, tx);
        }
        Self { inputs, tasks }
    }

    /// Returns `true` if a squasher runs for `module`.
    pub fn contains(&self, module: &str) -> bool {
        self.inputs.contains_key(module)
    }

    /// Number of squashers.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns `true` if the request has no store.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Hands partials written for `module` to its squasher, waiting if its input is full.
    ///
    /// Ranges sent to a squasher that already exited are dropped: its own outcome is reported
    /// by [`MultiSquasher::wait_until_done`].
    pub async fn squash(&self, module: &str, ranges: BlockRanges) -> Result<(), BackfillError> {
        let input =
            self.inputs.get(module).ok_or_else(|| BackfillError::UnknownModule(module.to_string()))?;
        if input.send(ranges).await.is_err() {
            debug!(target: "backfill::squasher", %module, "Squasher exited, dropping ranges");
        }
        Ok(())
    }

    /// Closes every squasher input and waits for all of them.
    ///
    /// Failures come first: they are reported together, along with every other store that did
    /// not reach its target. Then cancellation, then the incomplete stores. On success the map
    /// holds the final state of every store.
    pub async fn wait_until_done(self, cancel: &CancellationToken) -> Result<StoreMap, BackfillError> {
        let Self { inputs, tasks } = self;
        drop(inputs);

        let results = join_all(
            tasks.into_iter().map(|(initial, handle)| async move { (initial, handle.await) }),
        )
        .await;

        let mut failures = Vec::new();
        let mut incomplete = Vec::new();
        let mut cancelled = cancel.is_cancelled();
        let mut stores = Vec::with_capacity(results.len());
        for (initial, joined) in results {
            match joined {
                Ok(Ok(output)) => {
                    if !output.is_done() {
                        incomplete.push(output.missing_ranges());
                    }
                    stores.push((initial.module, output.store));
                }
                Ok(Err(err)) if err.is_cancelled() => {
                    cancelled = true;
                    incomplete.push(err.missing);
                }
                Ok(Err(err)) => failures.push(err),
                Err(err) => {
                    let source = BackfillError::Panicked {
                        module: initial.module.clone(),
                        message: join_error_message(err),
                    };
                    failures.push(SquasherError { missing: initial, source });
                }
            }
        }

        if !failures.is_empty() {
            return Err(BackfillError::SquashersFailed { failures, incomplete })
        }
        if cancelled {
            return Err(BackfillError::Cancelled)
        }
        if !incomplete.is_empty() {
            return Err(BackfillError::SquashersIncomplete(incomplete))
        }
        Ok(stores.into_iter().collect())
    }
}

fn join_error_message(err: JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => panic_message(&*payload),
        Err(err) => err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use backfill_primitives::{Module, ModuleGraph, ModuleHashes, UpdatePolicy, ValueType};
    use backfill_storage::{BlobStoreRef, MemoryBlobStore, Snapshots, StoreLimits};
    use std::sync::Arc;

    fn stores(up_to: u64) -> Vec<(StoreConfig, WorkUnit)> {
        let graph = ModuleGraph::new(vec![
            Module::store("a", 0, UpdatePolicy::Set, ValueType::String),
            Module::store("b", 0, UpdatePolicy::Set, ValueType::String).with_store_input("a"),
        ])
        .unwrap();
        let hashes = ModuleHashes::new(&graph);
        let base: BlobStoreRef = Arc::new(MemoryBlobStore::new());
        ["a", "b"]
            .into_iter()
            .map(|name| {
                let config = StoreConfig::new(
                    name,
                    hashes.get(name).unwrap(),
                    0,
                    UpdatePolicy::Set,
                    ValueType::String,
                    StoreLimits::default(),
                    &base,
                );
                let unit = WorkUnit::build(name, 0, &Snapshots::default(), 10, up_to).unwrap();
                (config, unit)
            })
            .collect()
    }

    fn spawn(
        stores: Vec<(StoreConfig, WorkUnit)>,
        cancel: &CancellationToken,
    ) -> (MultiSquasher, crate::squasher::SquasherEventsReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = BackfillConfig::default().with_intervals(10, 10);
        (MultiSquasher::spawn(stores, &config, tx, cancel), rx)
    }

    #[tokio::test]
    async fn routes_ranges_and_collects_stores() {
        let stores = stores(10);
        for (config, _) in &stores {
            let mut partial = config.new_partial_kv(0);
            partial.set(0, b"key", config.name().as_bytes()).unwrap();
            partial.save(10).await.unwrap();
        }
        let cancel = CancellationToken::new();
        let (multi, _events) = spawn(stores, &cancel);
        assert_eq!(multi.len(), 2);
        assert!(multi.contains("a"));

        let ranges: BlockRanges = "0-10".parse().unwrap();
        multi.squash("a", ranges.clone()).await.unwrap();
        multi.squash("b", ranges.clone()).await.unwrap();
        assert_matches!(
            multi.squash("c", ranges).await,
            Err(BackfillError::UnknownModule(module)) if module == "c"
        );

        let stores = multi.wait_until_done(&cancel).await.unwrap();
        assert_eq!(stores.len(), 2);
        assert_eq!(stores.get("a").unwrap().get_last(b"key"), Some(b"a".as_slice()));
        assert_eq!(stores.get("b").unwrap().get_last(b"key"), Some(b"b".as_slice()));
    }

    #[tokio::test]
    async fn reports_incomplete_stores() {
        let cancel = CancellationToken::new();
        let (multi, _events) = spawn(stores(20), &cancel);
        assert_matches!(
            multi.wait_until_done(&cancel).await,
            Err(BackfillError::SquashersIncomplete(missing)) if missing.len() == 2
        );
    }

    #[tokio::test]
    async fn failure_cancels_the_request() {
        let cancel = CancellationToken::new();
        let (multi, _events) = spawn(stores(20), &cancel);

        // no partial was written for this range
        multi.squash("a", "0-10".parse().unwrap()).await.unwrap();
        cancel.cancelled().await;

        let err = multi.wait_until_done(&cancel).await.unwrap_err();
        let BackfillError::SquashersFailed { failures, incomplete } = &err else {
            panic!("unexpected error {err}")
        };
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].missing.module, "a");
        assert_matches!(failures[0].source, BackfillError::CorruptStorage { .. });
        assert_eq!(incomplete.len(), 1);
        assert_eq!(incomplete[0].module, "b");
        assert_eq!(incomplete[0].next_expected_start, 0);
    }

    #[tokio::test]
    async fn reports_every_failed_store() {
        let cancel = CancellationToken::new();
        // both stores list a partial that is gone from storage
        let stores = stores(20)
            .into_iter()
            .map(|(config, mut unit)| {
                unit.partials_present = "0-10".parse().unwrap();
                unit.partials_missing = "10-20".parse().unwrap();
                (config, unit)
            })
            .collect();
        let (multi, _events) = spawn(stores, &cancel);
        cancel.cancelled().await;

        let err = multi.wait_until_done(&cancel).await.unwrap_err();
        let BackfillError::SquashersFailed { failures, incomplete } = &err else {
            panic!("unexpected error {err}")
        };
        assert!(incomplete.is_empty());
        let modules: Vec<_> = failures.iter().map(|failure| failure.missing.module.as_str()).collect();
        assert_eq!(modules, ["a", "b"]);
        for failure in failures {
            assert_matches!(failure.source, BackfillError::CorruptStorage { .. });
            assert_eq!(failure.missing.next_expected_start, 0);
            assert_eq!(failure.missing.target_end, 20);
        }
        let message = err.to_string();
        assert!(message.contains("a: missing [0, 20)"), "{message}");
        assert!(message.contains("b: missing [0, 20)"), "{message}");
    }
}
