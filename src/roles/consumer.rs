//! The run role.
//!
//! Awaits the fixture record, provisions its own throwaway probe resources
//! under the opposing account, runs the isolation catalog, and releases
//! the store. Release is held by a guard from the moment the record is
//! read, so the setup role is unblocked on every exit path, including
//! failed checks and early unwinds.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use snafu::ResultExt;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use super::HandoffSnafu;
use super::ProvisionWaitSnafu;
use super::ProvisioningSnafu;
use super::RoleError;
use crate::checks::catalog::run_catalog;
use crate::checks::catalog::LocalResources;
use crate::checks::CheckReport;
use crate::checks::Expectation;
use crate::cloud::waiters::wait_for_server_status;
use crate::cloud::waiters::wait_for_volume_status;
use crate::cloud::waiters::WaitConfig;
use crate::cloud::AccountId;
use crate::cloud::CloudApi;
use crate::cloud::ComputeApi;
use crate::cloud::ServerCreateOpts;
use crate::cloud::ServerStatus;
use crate::cloud::VolumeApi;
use crate::cloud::VolumeStatus;
use crate::handoff::FixtureRecord;
use crate::handoff::FixtureStore;
use crate::handoff::ReleaseGuard;

/// The run role: awaits the record, asserts isolation under the opposing
/// account, releases.
pub struct Consumer {
    cloud: Arc<dyn CloudApi>,
    account: AccountId,
    store: FixtureStore,
    fixture_timeout: Duration,
    wait: WaitConfig,
    expectations: BTreeMap<String, Expectation>,
}

impl Consumer {
    pub fn new(
        cloud: Arc<dyn CloudApi>,
        account: AccountId,
        store: FixtureStore,
        fixture_timeout: Duration,
        wait: WaitConfig,
        expectations: BTreeMap<String, Expectation>,
    ) -> Self {
        Self {
            cloud,
            account,
            store,
            fixture_timeout,
            wait,
            expectations,
        }
    }

    /// Drive the role to completion.
    ///
    /// The returned report carries individual check outcomes; failed
    /// checks do not error this method, since the store must be released
    /// and the probe resources torn down first. Callers decide the exit
    /// status from [`CheckReport::ok`].
    pub async fn run(&self, cancel: &CancellationToken) -> Result<CheckReport, RoleError> {
        info!(run_id = %self.store.run_id(), account = %self.account, "run role: awaiting fixture");
        let record = self
            .store
            .await_and_read(self.fixture_timeout, cancel)
            .await
            .context(HandoffSnafu)?;

        // From here on the store must be released no matter what.
        let guard = ReleaseGuard::new(self.store.clone());

        let local = match self.provision_probe(&record, cancel).await {
            Ok(local) => local,
            Err(e) => {
                if let Err(re) = guard.release().await {
                    warn!(error = %re, "store release failed after probe provisioning error");
                }
                return Err(e);
            }
        };

        let report = run_catalog(
            self.cloud.as_ref(),
            &self.account,
            &record,
            &local,
            &self.expectations,
        )
        .await;

        self.teardown_probe(&local).await;
        if let Err(e) = guard.release().await {
            warn!(error = %e, "store release failed; setup role may hit its release timeout");
        }

        Ok(report)
    }

    /// Boot the probe resources that prove the opposing account works and
    /// stand on the near side of cross-account checks. Their identifiers
    /// never enter the record.
    async fn provision_probe(
        &self,
        record: &FixtureRecord,
        cancel: &CancellationToken,
    ) -> Result<LocalResources, RoleError> {
        let run_id = self.store.run_id();
        let cloud = self.cloud.as_ref();

        let server = cloud
            .create_server(
                &self.account,
                ServerCreateOpts {
                    name: format!("probe-server-{run_id}"),
                    ..Default::default()
                },
            )
            .await
            .context(ProvisioningSnafu {
                resource: "probe server",
            })?;
        wait_for_server_status(cloud, &self.account, &server.id, ServerStatus::Active, &self.wait, cancel)
            .await
            .context(ProvisionWaitSnafu)?;

        // A probe volume is only needed when the record has volumes to
        // cross-attach against.
        let volume_id = if record.volume1.is_some() || record.volume2.is_some() {
            let volume = cloud
                .create_volume(&self.account, &format!("probe-vol-{run_id}"), 1)
                .await
                .context(ProvisioningSnafu {
                    resource: "probe volume",
                })?;
            wait_for_volume_status(cloud, &self.account, &volume.id, VolumeStatus::Available, &self.wait, cancel)
                .await
                .context(ProvisionWaitSnafu)?;
            Some(volume.id)
        } else {
            None
        };

        Ok(LocalResources {
            server_id: Some(server.id),
            volume_id,
        })
    }

    /// Ordinary per-test cleanup of the probe resources, best-effort.
    async fn teardown_probe(&self, local: &LocalResources) {
        let cloud = self.cloud.as_ref();
        if let Some(volume_id) = &local.volume_id {
            if let Err(e) = cloud.delete_volume(&self.account, volume_id).await {
                warn!(volume = %volume_id, error = %e, "probe volume cleanup failed; continuing");
            }
        }
        if let Some(server_id) = &local.server_id {
            if let Err(e) = cloud.delete_server(&self.account, server_id).await {
                warn!(server = %server_id, error = %e, "probe server cleanup failed; continuing");
            }
        }
    }
}
