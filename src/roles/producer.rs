//! The setup role.
//!
//! State machine: provision in a fixed order, publish the accumulated
//! record, await release, then tear down in reverse dependency order.
//! Teardown is best-effort throughout: one failed deletion never prevents
//! the remaining deletions from being attempted, and it runs on every exit
//! path, including provisioning failures.

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
use crate::cloud::waiters::wait_for_image_status;
use crate::cloud::waiters::wait_for_server_status;
use crate::cloud::waiters::wait_for_volume_status;
use crate::cloud::waiters::WaitConfig;
use crate::cloud::AccountId;
use crate::cloud::ApiError;
use crate::cloud::CloudApi;
use crate::cloud::ComputeApi;
use crate::cloud::ImageApi;
use crate::cloud::ImageStatus;
use crate::cloud::NetworkApi;
use crate::cloud::VolumeApi;
use crate::cloud::ServerCreateOpts;
use crate::cloud::ServerStatus;
use crate::cloud::VolumeStatus;
use crate::config::CloudFeatures;
use crate::handoff::AttachmentRef;
use crate::handoff::FixtureRecord;
use crate::handoff::FixtureStore;
use crate::handoff::ResourceRef;
use crate::handoff::RuleRef;

/// How the setup role finished.
#[derive(Debug)]
pub struct ProducerOutcome {
    /// The record that was published.
    pub record: FixtureRecord,
    /// True when the run role released the store; false when the setup
    /// role removed its own orphaned signal after the release wait
    /// expired.
    pub released_by_consumer: bool,
}

/// Everything created so far, recorded as each provisioning step succeeds
/// so teardown covers partial sets.
#[derive(Default)]
struct Provisioned {
    server: Option<ResourceRef>,
    image: Option<ResourceRef>,
    server_snapshot: Option<ResourceRef>,
    keypair: Option<String>,
    security_group: Option<ResourceRef>,
    rule: Option<RuleRef>,
    volume1: Option<ResourceRef>,
    volume2: Option<ResourceRef>,
    vol_snapshot: Option<ResourceRef>,
    attachment: Option<AttachmentRef>,
    metadata: BTreeMap<String, String>,
}

impl Provisioned {
    fn record(&self, run_id: &str) -> Option<FixtureRecord> {
        let server = self.server.clone()?;
        let mut record = FixtureRecord::new(run_id, server);
        record.image = self.image.clone();
        record.server_snapshot = self.server_snapshot.clone();
        record.keypairname = self.keypair.clone();
        record.security_group = self.security_group.clone();
        record.rule = self.rule.clone();
        record.volume1 = self.volume1.clone();
        record.volume2 = self.volume2.clone();
        record.vol_snapshot = self.vol_snapshot.clone();
        record.attachment = self.attachment.clone();
        record.metadata = self.metadata.clone();
        Some(record)
    }
}

/// The setup role: provisions under one account, publishes, awaits
/// release, tears down.
pub struct Producer {
    cloud: Arc<dyn CloudApi>,
    account: AccountId,
    store: FixtureStore,
    features: CloudFeatures,
    wait: WaitConfig,
    release_timeout: Duration,
}

impl Producer {
    pub fn new(
        cloud: Arc<dyn CloudApi>,
        account: AccountId,
        store: FixtureStore,
        features: CloudFeatures,
        wait: WaitConfig,
        release_timeout: Duration,
    ) -> Self {
        Self {
            cloud,
            account,
            store,
            features,
            wait,
            release_timeout,
        }
    }

    /// Drive the role to completion.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<ProducerOutcome, RoleError> {
        info!(run_id = %self.store.run_id(), account = %self.account, "setup role: provisioning");

        let mut created = Provisioned::default();
        if let Err(e) = self.provision(&mut created, cancel).await {
            warn!(error = %e, "provisioning failed; tearing down partial fixture set");
            self.teardown(&created).await;
            return Err(e);
        }

        // provision() always fills the server on success.
        let record = match created.record(self.store.run_id()) {
            Some(record) => record,
            None => {
                self.teardown(&created).await;
                return Err(RoleError::Provisioning {
                    resource: "server".to_string(),
                    source: ApiError::server_fault("provisioning completed without a server"),
                });
            }
        };

        if let Err(e) = self.store.publish(&record).await {
            self.teardown(&created).await;
            return Err(RoleError::Handoff { source: e });
        }

        info!(run_id = %self.store.run_id(), "setup role: awaiting release");
        let released_by_consumer = match self.store.await_release(self.release_timeout, cancel).await {
            Ok(()) => true,
            Err(e) if e.is_timeout() => {
                // The run role never appeared. Remove our own signal so no
                // orphan file outlives the run, then proceed to teardown.
                warn!(
                    run_id = %self.store.run_id(),
                    timeout_ms = self.release_timeout.as_millis() as u64,
                    "run role never released the store; removing orphaned signal"
                );
                self.release_quietly().await;
                false
            }
            Err(e) => {
                self.release_quietly().await;
                self.teardown(&created).await;
                return Err(RoleError::Handoff { source: e });
            }
        };

        self.teardown(&created).await;
        info!(run_id = %self.store.run_id(), released_by_consumer, "setup role: done");
        Ok(ProducerOutcome {
            record,
            released_by_consumer,
        })
    }

    /// Create the fixture set in its fixed, documented order, recording
    /// each identifier as it succeeds.
    async fn provision(&self, created: &mut Provisioned, cancel: &CancellationToken) -> Result<(), RoleError> {
        let run_id = self.store.run_id().to_string();
        let cloud = self.cloud.as_ref();

        // 1. Server, stamped with the metadata the record carries.
        let metadata = BTreeMap::from([
            ("purpose".to_string(), "isolation-fixture".to_string()),
            ("run_id".to_string(), run_id.clone()),
        ]);
        let server = cloud
            .create_server(
                &self.account,
                ServerCreateOpts {
                    name: format!("fixture-server-{run_id}"),
                    metadata: metadata.clone(),
                    ..Default::default()
                },
            )
            .await
            .context(ProvisioningSnafu { resource: "server" })?;
        created.server = Some(ResourceRef::new(&server.id, &server.name));
        created.metadata = metadata;
        wait_for_server_status(cloud, &self.account, &server.id, ServerStatus::Active, &self.wait, cancel)
            .await
            .context(ProvisionWaitSnafu)?;

        // 2. Image, when the image service is up.
        if self.features.image_service_enabled {
            let image = cloud
                .create_image(&self.account, &format!("fixture-image-{run_id}"))
                .await
                .context(ProvisioningSnafu { resource: "image" })?;
            created.image = Some(ResourceRef::new(&image.id, &image.name));
            wait_for_image_status(cloud, &self.account, &image.id, ImageStatus::Active, &self.wait, cancel)
                .await
                .context(ProvisionWaitSnafu)?;
        }

        // 3. Snapshot image of the server, when snapshotting is enabled.
        if self.features.server_snapshot_enabled {
            let snapshot = cloud
                .snapshot_server(&self.account, &server.id, &format!("fixture-snap-{run_id}"))
                .await
                .context(ProvisioningSnafu {
                    resource: "server snapshot",
                })?;
            created.server_snapshot = Some(ResourceRef::new(&snapshot.id, &snapshot.name));
            wait_for_image_status(cloud, &self.account, &snapshot.id, ImageStatus::Active, &self.wait, cancel)
                .await
                .context(ProvisionWaitSnafu)?;
        }

        // 4. Keypair.
        let keypair = cloud
            .create_keypair(&self.account, &format!("fixture-key-{run_id}"))
            .await
            .context(ProvisioningSnafu { resource: "keypair" })?;
        created.keypair = Some(keypair.name);

        // 5. Security group and 6. a rule inside it.
        let group = cloud
            .create_security_group(&self.account, &format!("fixture-group-{run_id}"), "isolation fixture")
            .await
            .context(ProvisioningSnafu {
                resource: "security group",
            })?;
        created.security_group = Some(ResourceRef::new(&group.id, &group.name));
        let rule = cloud
            .create_security_group_rule(&self.account, &group.id, "tcp", 22, 22)
            .await
            .context(ProvisioningSnafu {
                resource: "security group rule",
            })?;
        created.rule = Some(RuleRef {
            id: rule.id,
            security_group_id: group.id,
        });

        // 7-9. Volumes, snapshot, attachment, when the volume service is up.
        if self.features.volume_service_enabled {
            let volume1 = cloud
                .create_volume(&self.account, &format!("fixture-vol1-{run_id}"), 1)
                .await
                .context(ProvisioningSnafu { resource: "volume1" })?;
            created.volume1 = Some(ResourceRef::new(&volume1.id, &volume1.name));
            wait_for_volume_status(cloud, &self.account, &volume1.id, VolumeStatus::Available, &self.wait, cancel)
                .await
                .context(ProvisionWaitSnafu)?;

            let volume2 = cloud
                .create_volume(&self.account, &format!("fixture-vol2-{run_id}"), 1)
                .await
                .context(ProvisioningSnafu { resource: "volume2" })?;
            created.volume2 = Some(ResourceRef::new(&volume2.id, &volume2.name));
            wait_for_volume_status(cloud, &self.account, &volume2.id, VolumeStatus::Available, &self.wait, cancel)
                .await
                .context(ProvisionWaitSnafu)?;

            if self.features.volume_snapshot_enabled {
                let snapshot = cloud
                    .create_volume_snapshot(&self.account, &volume1.id, &format!("fixture-volsnap-{run_id}"))
                    .await
                    .context(ProvisioningSnafu {
                        resource: "volume snapshot",
                    })?;
                created.vol_snapshot = Some(ResourceRef::new(&snapshot.id, &snapshot.name));
            }

            let attachment = cloud
                .attach_volume(&self.account, &server.id, &volume2.id, "/dev/vdb")
                .await
                .context(ProvisioningSnafu { resource: "attachment" })?;
            created.attachment = Some(AttachmentRef {
                id: attachment.id,
                server_id: server.id.clone(),
                volume_id: volume2.id.clone(),
            });
            wait_for_volume_status(cloud, &self.account, &volume2.id, VolumeStatus::InUse, &self.wait, cancel)
                .await
                .context(ProvisionWaitSnafu)?;
        }

        Ok(())
    }

    /// Tear down in reverse dependency order: detach before deleting the
    /// volume, snapshot before its parent volume, server last.
    async fn teardown(&self, created: &Provisioned) {
        info!(run_id = %self.store.run_id(), "setup role: tearing down fixture set");
        let cloud = self.cloud.as_ref();
        let account = &self.account;

        if let Some(attachment) = &created.attachment {
            log_cleanup("attachment", &attachment.id, cloud.detach_volume(account, &attachment.id).await);
        }
        if let Some(snapshot) = &created.vol_snapshot {
            log_cleanup(
                "volume snapshot",
                &snapshot.id,
                cloud.delete_volume_snapshot(account, &snapshot.id).await,
            );
        }
        if let Some(volume) = &created.volume2 {
            log_cleanup("volume2", &volume.id, cloud.delete_volume(account, &volume.id).await);
        }
        if let Some(volume) = &created.volume1 {
            log_cleanup("volume1", &volume.id, cloud.delete_volume(account, &volume.id).await);
        }
        if let Some(rule) = &created.rule {
            log_cleanup(
                "security group rule",
                &rule.id,
                cloud.delete_security_group_rule(account, &rule.id).await,
            );
        }
        if let Some(group) = &created.security_group {
            log_cleanup(
                "security group",
                &group.id,
                cloud.delete_security_group(account, &group.id).await,
            );
        }
        if let Some(keypair) = &created.keypair {
            log_cleanup("keypair", keypair, cloud.delete_keypair(account, keypair).await);
        }
        if let Some(snapshot) = &created.server_snapshot {
            log_cleanup(
                "server snapshot",
                &snapshot.id,
                cloud.delete_image(account, &snapshot.id).await,
            );
        }
        if let Some(image) = &created.image {
            log_cleanup("image", &image.id, cloud.delete_image(account, &image.id).await);
        }
        if let Some(server) = &created.server {
            log_cleanup("server", &server.id, cloud.delete_server(account, &server.id).await);
        }
    }

    async fn release_quietly(&self) {
        if let Err(e) = self.store.release().await {
            warn!(run_id = %self.store.run_id(), error = %e, "store release failed");
        }
    }
}

/// Best-effort cleanup bookkeeping: failures are logged, never propagated.
fn log_cleanup(what: &str, id: &str, result: Result<(), ApiError>) {
    match result {
        Ok(()) => tracing::debug!(resource = %what, id = %id, "cleaned up"),
        Err(e) => warn!(resource = %what, id = %id, error = %e, "cleanup failed; continuing"),
    }
}
