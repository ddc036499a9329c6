//! Handoff protocol properties across independent store handles.
//!
//! The unit tests in `src/handoff/store.rs` cover one handle; these
//! suites model the real shape of the protocol: two handles constructed
//! separately (as two processes would), agreeing only on directory,
//! prefix, and run id.

mod common;

use std::time::Duration;
use std::time::Instant;

use bulkhead::handoff::FixtureRecord;
use bulkhead::handoff::HandoffError;
use bulkhead::handoff::ResourceRef;
use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

fn sample_record(run_id: &str) -> FixtureRecord {
    let mut record = FixtureRecord::new(run_id, ResourceRef::new("s1", "server-1"));
    record.keypairname = Some("kp-1".to_string());
    record
        .metadata
        .insert("purpose".to_string(), "isolation-fixture".to_string());
    record
}

#[tokio::test]
async fn independent_handles_complete_the_protocol() {
    let dir = tempfile::tempdir().unwrap();
    // Two handles, built separately, as two processes would.
    let writer = common::fast_store(dir.path(), "run-1");
    let reader = common::fast_store(dir.path(), "run-1");
    let cancel = CancellationToken::new();

    let record = sample_record("run-1");
    writer.publish(&record).await.unwrap();

    let read = reader.await_and_read(Duration::from_secs(1), &cancel).await.unwrap();
    assert_eq!(read, record);

    reader.release().await.unwrap();
    writer.await_release(Duration::from_secs(1), &cancel).await.unwrap();
    assert!(!writer.path().exists());
}

#[tokio::test]
async fn reader_before_writer_times_out_with_the_right_kind() {
    let dir = tempfile::tempdir().unwrap();
    let reader = common::fast_store(dir.path(), "run-1");

    let started = Instant::now();
    let err = reader
        .await_and_read(Duration::from_millis(60), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "expected timeout, got: {err}");
    assert!(!err.is_cancelled());
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn run_scoped_paths_do_not_collide() {
    let dir = tempfile::tempdir().unwrap();
    let store_one = common::fast_store(dir.path(), "run-1");
    let store_two = common::fast_store(dir.path(), "run-2");
    assert_ne!(store_one.path(), store_two.path());

    // Both runs coexist in the same directory.
    store_one.publish(&sample_record("run-1")).await.unwrap();
    store_two.publish(&sample_record("run-2")).await.unwrap();

    let cancel = CancellationToken::new();
    let one = store_one.await_and_read(Duration::from_secs(1), &cancel).await.unwrap();
    let two = store_two.await_and_read(Duration::from_secs(1), &cancel).await.unwrap();
    assert_eq!(one.run_id, "run-1");
    assert_eq!(two.run_id, "run-2");
}

#[tokio::test]
async fn double_release_from_different_handles_is_fine() {
    let dir = tempfile::tempdir().unwrap();
    let writer = common::fast_store(dir.path(), "run-1");
    let reader = common::fast_store(dir.path(), "run-1");

    writer.publish(&sample_record("run-1")).await.unwrap();
    reader.release().await.unwrap();
    // The writer's own cleanup path may release again.
    writer.release().await.unwrap();
}

#[tokio::test]
async fn publish_collision_names_the_owning_run() {
    let dir = tempfile::tempdir().unwrap();
    let first = common::fast_store(dir.path(), "run-1");
    first.publish(&sample_record("run-1")).await.unwrap();

    // A second handle for the same run id cannot publish over it.
    let second = common::fast_store(dir.path(), "run-1");
    let err = second.publish(&sample_record("run-1")).await.unwrap_err();
    match err {
        HandoffError::StoreWrite { reason, .. } => assert!(reason.contains("run-1"), "reason: {reason}"),
        other => panic!("expected StoreWrite, got: {other}"),
    }
}

#[tokio::test]
async fn cancelling_an_await_release_is_not_a_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let writer = common::fast_store(dir.path(), "run-1");
    writer.publish(&sample_record("run-1")).await.unwrap();

    let cancel = CancellationToken::new();
    let waiter = {
        let writer = writer.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { writer.await_release(Duration::from_secs(30), &cancel).await })
    };

    tokio::time::sleep(Duration::from_millis(30)).await;
    cancel.cancel();
    let err = waiter.await.unwrap().unwrap_err();
    assert!(err.is_cancelled(), "expected cancellation, got: {err}");
    assert!(!err.is_timeout());
}

proptest! {
    /// Any record round-trips through the wire encoding unchanged.
    #[test]
    fn record_json_round_trips(
        run_id in "[a-z0-9-]{1,24}",
        server_id in "[a-z0-9-]{1,16}",
        server_name in "[a-zA-Z0-9 _.-]{0,32}",
        keypair in proptest::option::of("[a-z0-9_-]{1,20}"),
        volume_id in proptest::option::of("[a-z0-9-]{1,16}"),
        metadata in proptest::collection::btree_map("[a-z_]{1,12}", "[a-zA-Z0-9 ]{0,24}", 0..5),
    ) {
        let mut record = FixtureRecord::new(run_id, ResourceRef::new(server_id, server_name));
        record.keypairname = keypair;
        record.volume1 = volume_id.map(|id| ResourceRef::new(id, "volume-one"));
        record.metadata = metadata;

        let json = serde_json::to_string(&record).unwrap();
        let decoded: FixtureRecord = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(decoded, record);
    }
}
