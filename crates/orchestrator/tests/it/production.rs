use crate::{config, r, value, Harness};
use assert_matches::assert_matches;
use backfill_orchestrator::{test_utils::COUNTER_KEY, BackfillError, Response};
use backfill_primitives::{BlockNumber, Module, UpdatePolicy, ValueType};
use backfill_storage::{BlobStoreRef, FsBlobStore};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

fn modules() -> Vec<Module> {
    vec![
        Module::store("counter", 0, UpdatePolicy::Add, ValueType::Int64),
        Module::map("map_out", 0).with_store_input("counter"),
    ]
}

fn streamed_blocks(responses: &[Response]) -> Vec<BlockNumber> {
    responses
        .iter()
        .filter_map(|response| match response {
            Response::BlockScopedData(data) => Some(data.clock.number),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn streams_cached_outputs_below_the_handoff() {
    let harness = Harness::new(modules(), config());
    let request = harness.request("map_out").with_range(15, 40).with_production_mode();

    let (result, responses) = harness.run(request).await;
    let stores = result.unwrap();

    assert_matches!(
        responses.first(),
        Some(Response::SessionInit(init)) if init.linear_handoff_block == 40 &&
            init.resolved_start_block == 15
    );
    assert_eq!(streamed_blocks(&responses), (15..40).collect::<Vec<_>>());
    let first = responses
        .iter()
        .find_map(|response| match response {
            Response::BlockScopedData(data) => Some(data),
            _ => None,
        })
        .unwrap();
    assert_eq!(first.module, "map_out");
    assert_eq!(first.cursor, "cursor:15");

    assert_eq!(value(&stores, "counter", COUNTER_KEY).as_deref(), Some("40"));
    assert_eq!(
        harness.client.dispatched(),
        vec![("counter".to_string(), r(0, 40)), ("map_out".to_string(), r(10, 40))]
    );

    // everything is cached now
    let request = harness.request("map_out").with_range(15, 40).with_production_mode();
    let (result, responses) = harness.run(request).await;
    result.unwrap();
    assert_eq!(harness.client.dispatched().len(), 2);
    assert_eq!(streamed_blocks(&responses), (15..40).collect::<Vec<_>>());
}

#[tokio::test]
async fn sends_debug_snapshots_last() {
    let harness = Harness::new(modules(), config());
    let request = harness
        .request("map_out")
        .with_range(15, 40)
        .with_production_mode()
        .with_debug_snapshot("counter");

    let (result, responses) = harness.run(request).await;
    result.unwrap();

    assert_matches!(responses.last(), Some(Response::DebugSnapshotComplete));
    let snapshots: Vec<_> = responses
        .iter()
        .filter_map(|response| match response {
            Response::DebugSnapshotData(data) => Some(data),
            _ => None,
        })
        .collect();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].module, "counter");
    assert_eq!(snapshots[0].entries, vec![(COUNTER_KEY.to_vec(), b"40".to_vec())]);
}

#[tokio::test]
async fn persists_on_the_filesystem() {
    let dir = tempfile::tempdir().unwrap();
    let storage: BlobStoreRef = Arc::new(FsBlobStore::new(dir.path()));
    let harness = Harness::with_storage(modules(), config(), storage);

    let (result, _) = harness.run(harness.request("counter").with_range(20, 0)).await;
    assert_eq!(value(&result.unwrap(), "counter", COUNTER_KEY).as_deref(), Some("20"));

    let snapshots = harness.snapshots("counter").await;
    assert_eq!(snapshots.completes(), &[r(0, 20)]);
    assert!(snapshots.partials().is_empty());
}

#[tokio::test]
async fn cancellation_stops_the_backfill() {
    let harness = Harness::new(modules(), config());
    harness.client.delay("counter", 0, Duration::from_secs(3));
    let cancel = CancellationToken::new();

    let request = harness.request("counter").with_range(30, 0);
    let ((result, _), ()) = tokio::join!(harness.run_with_cancel(request, cancel.clone()), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });
    assert_matches!(result, Err(BackfillError::Cancelled));
}
