use crate::{config, r, value, Harness, INTERVAL};
use assert_matches::assert_matches;
use backfill_orchestrator::{
    test_utils::{block_key, ClientEvent, StoreBehavior, COUNTER_KEY},
    BackfillError, Response, WorkerError,
};
use backfill_primitives::{Module, UpdatePolicy, ValueType};
use std::time::Duration;

fn counter() -> Vec<Module> {
    vec![Module::store("counter", 0, UpdatePolicy::Add, ValueType::Int64)]
}

fn position(history: &[ClientEvent], event: &ClientEvent) -> usize {
    history.iter().position(|e| e == event).unwrap_or_else(|| panic!("{event:?} not found"))
}

#[tokio::test]
async fn builds_store_from_scratch() {
    let harness = Harness::new(counter(), config().with_split_size(INTERVAL));
    let (result, responses) = harness.run(harness.request("counter").with_range(30, 0)).await;
    let stores = result.unwrap();

    assert_eq!(value(&stores, "counter", COUNTER_KEY).as_deref(), Some("30"));
    let mut dispatched = harness.client.dispatched();
    dispatched.sort_by_key(|(_, range)| range.start());
    assert_eq!(
        dispatched,
        vec![
            ("counter".to_string(), r(0, 10)),
            ("counter".to_string(), r(10, 20)),
            ("counter".to_string(), r(20, 30)),
        ]
    );

    // one complete snapshot at the handoff, merged partials gone
    let snapshots = harness.snapshots("counter").await;
    assert_eq!(snapshots.completes(), &[r(0, 30)]);
    assert!(snapshots.partials().is_empty());

    assert_matches!(
        responses.first(),
        Some(Response::SessionInit(init)) if init.linear_handoff_block == 30 &&
            init.resolved_start_block == 30
    );
    assert!(responses.iter().any(|response| matches!(response, Response::Progress(_))));
}

#[tokio::test]
async fn resumes_from_complete_snapshot() {
    let harness = Harness::new(counter(), config());
    let mut existing = harness.store("counter").new_full_kv();
    existing.set(0, COUNTER_KEY, b"20").unwrap();
    existing.save(20).await.unwrap();

    let (result, _) = harness.run(harness.request("counter").with_range(30, 0)).await;
    let stores = result.unwrap();

    assert_eq!(harness.client.dispatched(), vec![("counter".to_string(), r(20, 30))]);
    assert_eq!(value(&stores, "counter", COUNTER_KEY).as_deref(), Some("30"));
    let snapshots = harness.snapshots("counter").await;
    assert_eq!(snapshots.completes(), &[r(0, 20), r(0, 30)]);
}

#[tokio::test]
async fn already_built_store_needs_no_job() {
    let harness = Harness::new(counter(), config());
    let mut existing = harness.store("counter").new_full_kv();
    existing.set(0, COUNTER_KEY, b"30").unwrap();
    existing.save(30).await.unwrap();

    let (result, _) = harness.run(harness.request("counter").with_range(30, 0)).await;
    assert_eq!(value(&result.unwrap(), "counter", COUNTER_KEY).as_deref(), Some("30"));
    assert!(harness.client.dispatched().is_empty());
}

#[tokio::test]
async fn missing_segments_are_bucketed_around_present_partials() {
    let harness = Harness::new(counter(), config().with_split_size(2 * INTERVAL));
    let mut partial = harness.store("counter").new_partial_kv(10);
    for block in 10..20 {
        partial.apply(block, COUNTER_KEY, b"1").unwrap();
    }
    partial.save(20).await.unwrap();

    let (result, _) = harness.run(harness.request("counter").with_range(40, 0)).await;
    let stores = result.unwrap();

    let mut dispatched = harness.client.dispatched();
    dispatched.sort_by_key(|(_, range)| range.start());
    assert_eq!(
        dispatched,
        vec![("counter".to_string(), r(0, 10)), ("counter".to_string(), r(20, 40))]
    );
    assert_eq!(value(&stores, "counter", COUNTER_KEY).as_deref(), Some("40"));

    let snapshots = harness.snapshots("counter").await;
    assert_eq!(snapshots.completes(), &[r(0, 40)]);
    assert!(snapshots.partials().is_empty());
}

#[tokio::test]
async fn out_of_order_partials_are_merged_in_block_order() {
    let harness =
        Harness::new(counter(), config().with_split_size(INTERVAL).with_parallel_subrequests(2));
    harness.client.delay("counter", 0, Duration::from_millis(100));

    let (result, _) = harness.run(harness.request("counter").with_range(20, 0)).await;
    let stores = result.unwrap();

    let history = harness.client.history();
    assert!(
        position(&history, &ClientEvent::Finished("counter".into(), r(10, 20))) <
            position(&history, &ClientEvent::Finished("counter".into(), r(0, 10)))
    );
    assert_eq!(value(&stores, "counter", COUNTER_KEY).as_deref(), Some("20"));

    // no intermediate complete snapshot
    let snapshots = harness.snapshots("counter").await;
    assert_eq!(snapshots.completes(), &[r(0, 20)]);
    assert!(snapshots.partials().is_empty());
}

#[tokio::test]
async fn dependent_jobs_wait_for_parent_stores() {
    let modules = vec![
        Module::store("a", 0, UpdatePolicy::Set, ValueType::String),
        Module::store("b", 0, UpdatePolicy::Set, ValueType::String).with_store_input("a"),
    ];
    let harness =
        Harness::new(modules, config().with_split_size(INTERVAL).with_parallel_subrequests(2));
    harness.client.delay("a", 0, Duration::from_millis(100));

    let (result, _) = harness.run(harness.request("b").with_range(20, 0)).await;
    let stores = result.unwrap();

    let history = harness.client.history();
    let parent_done = position(&history, &ClientEvent::Finished("a".into(), r(0, 10)));
    // the first job of b only needs a at block 0
    assert!(position(&history, &ClientEvent::Opened("b".into(), r(0, 10))) < parent_done);
    assert!(position(&history, &ClientEvent::Opened("b".into(), r(10, 20))) > parent_done);

    for name in ["a", "b"] {
        let store = stores.get(name).unwrap();
        assert_eq!(store.len(), 20);
        assert_eq!(store.get_last(&block_key(19)), Some(b"19".as_slice()));
    }
}

#[tokio::test]
async fn bigdecimal_sums_are_exact() {
    let modules = vec![Module::store("sum", 0, UpdatePolicy::Add, ValueType::BigDecimal)];
    let harness = Harness::new(modules, config());
    let mut existing = harness.store("sum").new_full_kv();
    existing.set(0, b"sum", b"1.5").unwrap();
    existing.save(10).await.unwrap();
    harness.client.behavior(
        "sum",
        StoreBehavior::Custom(|block| {
            if block == 15 {
                vec![(b"sum".to_vec(), b"2.25".to_vec())]
            } else {
                Vec::new()
            }
        }),
    );

    let (result, _) = harness.run(harness.request("sum").with_range(20, 0)).await;
    assert_eq!(value(&result.unwrap(), "sum", b"sum").as_deref(), Some("3.75"));
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let harness = Harness::new(counter(), config());
    harness.client.fail_once("counter", 0, WorkerError::Transport("connection reset".into()));

    let (result, _) = harness.run(harness.request("counter").with_range(30, 0)).await;
    assert_eq!(value(&result.unwrap(), "counter", COUNTER_KEY).as_deref(), Some("30"));
    assert_eq!(
        harness.client.dispatched(),
        vec![("counter".to_string(), r(0, 30)), ("counter".to_string(), r(0, 30))]
    );
}

#[tokio::test]
async fn module_failures_fail_the_request() {
    let harness = Harness::new(counter(), config());
    harness.client.fail_once(
        "counter",
        0,
        WorkerError::ModuleFailure { reason: "division by zero".into(), logs: Vec::new() },
    );

    let (result, _) = harness.run(harness.request("counter").with_range(30, 0)).await;
    assert_matches!(
        result,
        Err(BackfillError::Worker { module, attempts: 1, source: WorkerError::ModuleFailure { .. }, .. })
            if module == "counter"
    );
    assert_eq!(harness.client.dispatched().len(), 1);
}

#[tokio::test]
async fn incomplete_trailer_fails_the_request() {
    let harness = Harness::new(counter(), config());
    harness.client.override_trailer("counter", 0, "0-10");

    let (result, _) = harness.run(harness.request("counter").with_range(30, 0)).await;
    assert_matches!(
        result,
        Err(BackfillError::Worker { source: WorkerError::InvalidTrailer { .. }, .. })
    );
}

#[tokio::test]
async fn invalid_requests_send_nothing() {
    let harness = Harness::new(counter(), config());
    let (result, responses) = harness.run(harness.request("counter").with_range(-5, 0)).await;
    assert_matches!(result, Err(BackfillError::InvalidRequest(_)));
    assert!(responses.is_empty());
}
