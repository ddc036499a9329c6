//! Teardown behavior of the setup role: reverse dependency order,
//! best-effort continuation, and orphan handling.

mod common;

use std::time::Duration;

use bulkhead::cloud::ApiError;
use bulkhead::cloud::ApiErrorKind;
use bulkhead::cloud::ComputeApi;
use bulkhead::cloud::DeterministicCloud;
use bulkhead::handoff::FixtureStore;
use bulkhead::roles::RoleError;
use tokio_util::sync::CancellationToken;

const TIMEOUT: Duration = Duration::from_secs(10);

/// Release the store as soon as the record appears, without touching the
/// cloud. Stands in for a run role that only speaks the protocol.
fn spawn_releaser(store: FixtureStore, cancel: &CancellationToken) -> tokio::task::JoinHandle<()> {
    let cancel = cancel.clone();
    tokio::spawn(async move {
        store.await_and_read(TIMEOUT, &cancel).await.expect("record appears");
        store.release().await.expect("release");
    })
}

#[tokio::test]
async fn teardown_orders_dependents_before_dependencies() {
    let cloud = DeterministicCloud::new();
    let dir = tempfile::tempdir().unwrap();
    let producer = common::producer(cloud.clone(), dir.path(), "run-1", TIMEOUT);

    let cancel = CancellationToken::new();
    let releaser = spawn_releaser(common::fast_store(dir.path(), "run-1"), &cancel);
    let outcome = producer.run(&cancel).await.unwrap();
    releaser.await.unwrap();

    let record = &outcome.record;
    let ops = cloud.operations().await;

    // The attachment goes before its volume, the snapshot before its
    // parent volume, the server last.
    let detach = common::op_index(&ops, &format!("detach_volume:{}", record.attachment.as_ref().unwrap().id))
        .expect("attachment detached");
    let volume2 = common::op_index(&ops, &format!("delete_volume:{}", record.volume2.as_ref().unwrap().id))
        .expect("volume2 deleted");
    assert!(detach < volume2, "detach at {detach}, volume2 delete at {volume2}");

    let snapshot = common::op_index(
        &ops,
        &format!("delete_volume_snapshot:{}", record.vol_snapshot.as_ref().unwrap().id),
    )
    .expect("volume snapshot deleted");
    let volume1 = common::op_index(&ops, &format!("delete_volume:{}", record.volume1.as_ref().unwrap().id))
        .expect("volume1 deleted");
    assert!(snapshot < volume1, "snapshot at {snapshot}, volume1 delete at {volume1}");

    let server = common::op_index(&ops, &format!("delete_server:{}", record.server.id)).expect("server deleted");
    assert!(volume1 < server);
    assert!(volume2 < server);
}

#[tokio::test]
async fn teardown_continues_past_a_failed_deletion() {
    let cloud = DeterministicCloud::new();
    let dir = tempfile::tempdir().unwrap();
    let producer = common::producer(cloud.clone(), dir.path(), "run-1", TIMEOUT);

    // First delete_volume in teardown (volume2) fails; everything after
    // it must still be attempted.
    cloud
        .fail_next("delete_volume", ApiError::conflict("storage backend busy"))
        .await;

    let cancel = CancellationToken::new();
    let releaser = spawn_releaser(common::fast_store(dir.path(), "run-1"), &cancel);
    let outcome = producer.run(&cancel).await.unwrap();
    releaser.await.unwrap();

    let ops = cloud.operations().await;
    let deletes: Vec<&String> = ops.iter().filter(|op| op.starts_with("delete_volume:")).collect();
    assert_eq!(deletes.len(), 2, "both volume deletions attempted: {deletes:?}");

    // The server deletion past the failure went through.
    let err = cloud
        .show_server(&common::account_a(), &outcome.record.server.id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ApiErrorKind::NotFound);

    // Volume2's delete failed, so it survives; volume1's succeeded.
    assert!(ops.iter().any(|op| *op == format!("delete_keypair:{}", outcome.record.keypairname.as_ref().unwrap())));
}

#[tokio::test]
async fn provisioning_failure_tears_down_the_partial_set() {
    let cloud = DeterministicCloud::new();
    let dir = tempfile::tempdir().unwrap();
    let producer = common::producer(cloud.clone(), dir.path(), "run-1", TIMEOUT);

    cloud
        .fail_next("create_security_group_rule", ApiError::server_fault("injected"))
        .await;

    let err = producer.run(&CancellationToken::new()).await.unwrap_err();
    match err {
        RoleError::Provisioning { resource, .. } => assert_eq!(resource, "security group rule"),
        other => panic!("expected provisioning error, got: {other}"),
    }

    // Nothing was published.
    assert!(!common::fast_store(dir.path(), "run-1").path().exists());

    // What did get created was torn down again: server, keypair, group.
    let ops = cloud.operations().await;
    assert!(common::op_index(&ops, "delete_server:").is_some());
    assert!(common::op_index(&ops, "delete_keypair:").is_some());
    assert!(common::op_index(&ops, "delete_security_group:").is_some());
    // The volumes were never reached.
    assert!(common::op_index(&ops, "create_volume:").is_none());
}

#[tokio::test]
async fn unreleased_store_is_removed_after_the_release_timeout() {
    let cloud = DeterministicCloud::new();
    let dir = tempfile::tempdir().unwrap();
    // No run role ever shows up; the release wait expires quickly.
    let producer = common::producer(cloud.clone(), dir.path(), "run-1", Duration::from_millis(150));

    let outcome = producer.run(&CancellationToken::new()).await.unwrap();
    assert!(!outcome.released_by_consumer);

    // No orphan file outlives the run, and the fixture set is gone.
    assert!(!common::fast_store(dir.path(), "run-1").path().exists());
    let err = cloud
        .show_server(&common::account_a(), &outcome.record.server.id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ApiErrorKind::NotFound);
}

#[tokio::test]
async fn cancelled_release_wait_still_tears_down() {
    let cloud = DeterministicCloud::new();
    let dir = tempfile::tempdir().unwrap();
    let producer = common::producer(cloud.clone(), dir.path(), "run-1", TIMEOUT);

    let cancel = CancellationToken::new();
    let task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { producer.run(&cancel).await })
    };

    // Wait until the record is published, then interrupt the run.
    let watcher = common::fast_store(dir.path(), "run-1");
    watcher
        .await_and_read(TIMEOUT, &CancellationToken::new())
        .await
        .expect("record appears");
    cancel.cancel();

    let err = task.await.unwrap().unwrap_err();
    match &err {
        RoleError::Handoff { source } => assert!(source.is_cancelled()),
        other => panic!("expected handoff cancellation, got: {other}"),
    }

    // The interrupted role still released its signal and deleted its
    // resources.
    assert!(!watcher.path().exists());
    let ops = cloud.operations().await;
    assert!(common::op_index(&ops, "delete_server:").is_some());
}
