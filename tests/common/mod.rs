//! Shared fixtures for the integration suites.
//!
//! Stores poll fast and time out quickly so the suites stay snappy; the
//! timeouts are still generous relative to the in-memory cloud, which
//! settles statuses on the first poll.

#![allow(dead_code)] // Each suite uses a subset of these helpers.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bulkhead::cloud::waiters::WaitConfig;
use bulkhead::cloud::AccountId;
use bulkhead::cloud::CloudApi;
use bulkhead::cloud::DeterministicCloud;
use bulkhead::config::CloudFeatures;
use bulkhead::handoff::FixtureStore;
use bulkhead::handoff::StoreConfig;
use bulkhead::roles::Consumer;
use bulkhead::roles::Producer;

pub const PREFIX: &str = "fixture";

pub fn account_a() -> AccountId {
    AccountId::new("account-a")
}

pub fn account_b() -> AccountId {
    AccountId::new("account-b")
}

pub fn fast_wait() -> WaitConfig {
    WaitConfig {
        timeout_ms: 5_000,
        poll_interval_ms: 10,
    }
}

pub fn fast_store(dir: &Path, run_id: &str) -> FixtureStore {
    FixtureStore::new(dir, PREFIX, run_id, StoreConfig { poll_interval_ms: 10 })
}

pub fn producer(
    cloud: Arc<DeterministicCloud>,
    dir: &Path,
    run_id: &str,
    release_timeout: Duration,
) -> Producer {
    producer_with_features(cloud, dir, run_id, release_timeout, CloudFeatures::default())
}

pub fn producer_with_features(
    cloud: Arc<DeterministicCloud>,
    dir: &Path,
    run_id: &str,
    release_timeout: Duration,
    features: CloudFeatures,
) -> Producer {
    let cloud: Arc<dyn CloudApi> = cloud;
    Producer::new(
        cloud,
        account_a(),
        fast_store(dir, run_id),
        features,
        fast_wait(),
        release_timeout,
    )
}

pub fn consumer(cloud: Arc<DeterministicCloud>, dir: &Path, run_id: &str, fixture_timeout: Duration) -> Consumer {
    consumer_with_expectations(
        cloud,
        dir,
        run_id,
        fixture_timeout,
        bulkhead::checks::catalog::default_expectations(),
    )
}

pub fn consumer_with_expectations(
    cloud: Arc<DeterministicCloud>,
    dir: &Path,
    run_id: &str,
    fixture_timeout: Duration,
    expectations: std::collections::BTreeMap<String, bulkhead::Expectation>,
) -> Consumer {
    let cloud: Arc<dyn CloudApi> = cloud;
    Consumer::new(
        cloud,
        account_b(),
        fast_store(dir, run_id),
        fixture_timeout,
        fast_wait(),
        expectations,
    )
}

/// Index of the first operation-log entry starting with `prefix`.
pub fn op_index(ops: &[String], prefix: &str) -> Option<usize> {
    ops.iter().position(|op| op.starts_with(prefix))
}
