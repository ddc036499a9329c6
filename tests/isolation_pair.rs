//! End-to-end producer/consumer pairing over the in-memory cloud, with
//! the roles coordinating only through a real on-disk store.

mod common;

use std::time::Duration;

use bulkhead::checks::catalog::default_expectations;
use bulkhead::checks::CheckOutcome;
use bulkhead::cloud::ApiErrorKind;
use bulkhead::cloud::ComputeApi;
use bulkhead::cloud::DeterministicCloud;
use bulkhead::cloud::VolumeApi;
use bulkhead::roles::run_pair;
use bulkhead::roles::RoleError;
use bulkhead::Expectation;
use tokio_util::sync::CancellationToken;

const TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn pair_passes_the_default_catalog() {
    let cloud = DeterministicCloud::new();
    let dir = tempfile::tempdir().unwrap();
    let producer = common::producer(cloud.clone(), dir.path(), "run-1", TIMEOUT);
    let consumer = common::consumer(cloud.clone(), dir.path(), "run-1", TIMEOUT);

    let outcome = run_pair(producer, consumer, &CancellationToken::new()).await.unwrap();

    assert!(outcome.report.ok(), "unexpected failures:\n{}", outcome.report);
    assert_eq!(outcome.report.skipped(), 0);
    assert!(outcome.producer.released_by_consumer);

    // The store is gone and the producer deleted its own server.
    assert!(!common::fast_store(dir.path(), "run-1").path().exists());
    let err = cloud
        .show_server(&common::account_a(), &outcome.record().server.id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ApiErrorKind::NotFound);

    // The consumer's probe resources are gone too.
    let ops = cloud.operations().await;
    assert!(ops.iter().any(|op| op.starts_with("create_server:probe-server-")));
    let deletes: Vec<&String> = ops.iter().filter(|op| op.starts_with("delete_server:")).collect();
    assert!(deletes.len() >= 2, "fixture and probe server deletions attempted: {deletes:?}");
}

#[tokio::test]
async fn show_succeeds_and_delete_is_refused_across_accounts() {
    // The canonical handoff scenario: the reader shows the foreign server
    // successfully, fails to delete it, releases; the writer then deletes
    // it itself.
    let cloud = DeterministicCloud::new();
    let dir = tempfile::tempdir().unwrap();
    let producer = common::producer(cloud.clone(), dir.path(), "run-1", TIMEOUT);
    let consumer = common::consumer(cloud.clone(), dir.path(), "run-1", TIMEOUT);

    let outcome = run_pair(producer, consumer, &CancellationToken::new()).await.unwrap();

    assert!(matches!(
        outcome.report.outcome_of("server_show"),
        Some(CheckOutcome::Passed)
    ));
    assert!(matches!(
        outcome.report.outcome_of("server_delete"),
        Some(CheckOutcome::Passed) // the deletion was refused, as expected
    ));

    // The fixture server's deletion was attempted twice: once refused
    // under account B during the check, once for real by the producer.
    let ops = cloud.operations().await;
    let fixture_delete = format!("delete_server:{}", outcome.record().server.id);
    assert_eq!(ops.iter().filter(|op| **op == fixture_delete).count(), 2);
}

#[tokio::test]
async fn mismatched_expectation_fails_exactly_that_check() {
    let cloud = DeterministicCloud::new();
    let dir = tempfile::tempdir().unwrap();

    let mut expectations = default_expectations();
    expectations.insert("server_delete".to_string(), Expectation::Error(ApiErrorKind::NotFound));

    let producer = common::producer(cloud.clone(), dir.path(), "run-1", TIMEOUT);
    let consumer = common::consumer_with_expectations(cloud.clone(), dir.path(), "run-1", TIMEOUT, expectations);

    let outcome = run_pair(producer, consumer, &CancellationToken::new()).await.unwrap();

    assert!(!outcome.report.ok());
    assert_eq!(outcome.report.failed(), 1);
    assert!(matches!(
        outcome.report.outcome_of("server_delete"),
        Some(CheckOutcome::Failed { got }) if got == "forbidden"
    ));
    // A failed check still released the producer.
    assert!(outcome.producer.released_by_consumer);
}

#[tokio::test]
async fn disabled_features_skip_their_checks() {
    let cloud = DeterministicCloud::new();
    let dir = tempfile::tempdir().unwrap();

    let features = bulkhead::config::CloudFeatures {
        image_service_enabled: false,
        volume_service_enabled: false,
        server_snapshot_enabled: false,
        volume_snapshot_enabled: false,
    };
    let producer = common::producer_with_features(cloud.clone(), dir.path(), "run-1", TIMEOUT, features);
    let consumer = common::consumer(cloud.clone(), dir.path(), "run-1", TIMEOUT);

    let outcome = run_pair(producer, consumer, &CancellationToken::new()).await.unwrap();

    assert!(outcome.report.ok(), "skips must not fail:\n{}", outcome.report);
    assert!(outcome.report.skipped() > 0);
    assert!(outcome.record().image.is_none());
    assert!(outcome.record().volume1.is_none());
    assert!(outcome.record().vol_snapshot.is_none());
    // No volume was ever created on either account.
    let ops = cloud.operations().await;
    assert!(!ops.iter().any(|op| op.starts_with("create_volume:")));
}

#[tokio::test]
async fn consumer_without_a_producer_times_out() {
    let cloud = DeterministicCloud::new();
    let dir = tempfile::tempdir().unwrap();
    let consumer = common::consumer(cloud, dir.path(), "run-1", Duration::from_millis(80));

    let err = consumer.run(&CancellationToken::new()).await.unwrap_err();
    assert!(err.is_handoff_timeout(), "expected handoff timeout, got: {err}");
}

#[tokio::test]
async fn cancelled_consumer_surfaces_cancellation_not_timeout() {
    let cloud = DeterministicCloud::new();
    let dir = tempfile::tempdir().unwrap();
    let consumer = common::consumer(cloud, dir.path(), "run-1", Duration::from_secs(30));

    let cancel = CancellationToken::new();
    let task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { consumer.run(&cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    cancel.cancel();

    let err = task.await.unwrap().unwrap_err();
    match err {
        RoleError::Handoff { source } => {
            assert!(source.is_cancelled());
            assert!(!source.is_timeout());
        }
        other => panic!("expected handoff cancellation, got: {other}"),
    }
}

#[tokio::test]
async fn consumer_probe_failure_still_releases_the_store() {
    let cloud = DeterministicCloud::new();
    let dir = tempfile::tempdir().unwrap();

    // The probe server boot fails after the producer's fixture server
    // has long been created; fail the next create_server issued once the
    // record is visible.
    let producer = common::producer(cloud.clone(), dir.path(), "run-1", TIMEOUT);
    let consumer = common::consumer(cloud.clone(), dir.path(), "run-1", TIMEOUT);

    let cancel = CancellationToken::new();
    let producer_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { producer.run(&cancel).await })
    };

    // Wait for the record to appear, then arm the fault and run the
    // consumer.
    let watcher = common::fast_store(dir.path(), "run-1");
    watcher
        .await_and_read(TIMEOUT, &cancel)
        .await
        .expect("producer publishes");
    cloud
        .fail_next("create_server", bulkhead::cloud::ApiError::server_fault("injected"))
        .await;

    let err = consumer.run(&cancel).await.unwrap_err();
    assert!(matches!(err, RoleError::Provisioning { .. }), "got: {err}");

    // The guard released the store, so the producer finishes as released
    // by its counterpart and tears down normally.
    let outcome = producer_task.await.unwrap().unwrap();
    assert!(outcome.released_by_consumer);
}

#[tokio::test]
async fn record_read_by_consumer_matches_what_producer_published() {
    let cloud = DeterministicCloud::new();
    let dir = tempfile::tempdir().unwrap();
    let producer = common::producer(cloud.clone(), dir.path(), "run-1", TIMEOUT);

    let cancel = CancellationToken::new();
    let producer_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { producer.run(&cancel).await })
    };

    let reader = common::fast_store(dir.path(), "run-1");
    let record = reader.await_and_read(TIMEOUT, &cancel).await.unwrap();

    // Stable field names and the full fixture set under default features.
    assert_eq!(record.run_id, "run-1");
    assert!(record.image.is_some());
    assert!(record.server_snapshot.is_some());
    assert!(record.keypairname.is_some());
    assert!(record.security_group.is_some());
    assert!(record.rule.is_some());
    assert!(record.volume1.is_some());
    assert!(record.volume2.is_some());
    assert!(record.vol_snapshot.is_some());
    assert!(record.attachment.is_some());
    assert_eq!(record.metadata.get("purpose").map(String::as_str), Some("isolation-fixture"));

    // The attachment links volume2 to the fixture server.
    let attachment = record.attachment.as_ref().unwrap();
    assert_eq!(attachment.server_id, record.server.id);
    assert_eq!(attachment.volume_id, record.volume2.as_ref().unwrap().id);
    let volume2 = cloud
        .show_volume(&common::account_a(), &attachment.volume_id)
        .await
        .unwrap();
    assert_eq!(volume2.attached_to.as_deref(), Some(record.server.id.as_str()));

    reader.release().await.unwrap();
    producer_task.await.unwrap().unwrap();
}
