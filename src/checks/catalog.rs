//! The isolation check catalog.
//!
//! Each check issues one API call under the run role's account against an
//! identifier owned by the setup role's account, and judges the outcome
//! against a per-operation [`Expectation`]. Defaults live in
//! [`default_expectations`]; configuration may override any of them.
//!
//! Checks whose fixture field or prerequisite resource is absent are
//! recorded as skipped so a partially provisioned record (disabled image
//! or volume service) never reads as a failure.

use std::collections::BTreeMap;

use tracing::info;

use super::CheckReport;
use super::Expectation;
use crate::cloud::AccountId;
use crate::cloud::ApiError;
use crate::cloud::ApiErrorKind;
use crate::cloud::CloudApi;
use crate::cloud::ComputeApi;
use crate::cloud::ImageApi;
use crate::cloud::NetworkApi;
use crate::cloud::ServerCreateOpts;
use crate::cloud::VolumeApi;
use crate::handoff::FixtureRecord;

/// Resources the run role provisioned under its own account.
///
/// A handful of checks need a resource on the near side of the boundary:
/// attaching a foreign volume needs a server of our own, and attaching our
/// volume to a foreign server needs a volume of our own. Their identifiers
/// never enter the fixture record.
#[derive(Debug, Clone, Default)]
pub struct LocalResources {
    /// Throwaway server owned by the run role's account.
    pub server_id: Option<String>,
    /// Throwaway volume owned by the run role's account.
    pub volume_id: Option<String>,
}

/// The catalog's default per-operation contracts.
///
/// Shows of servers, images, security groups, and volumes are
/// cross-account readable. Compute, image, and network mutations are
/// refused outright. Keypairs are per-account namespaces, so foreign ones
/// do not exist as far as the API admits. The volume subsystem accepts
/// either refusal or hiding, because deployed versions of the original API
/// did both.
pub fn default_expectations() -> BTreeMap<String, Expectation> {
    use ApiErrorKind::*;

    let forbidden = || Expectation::Error(Forbidden);
    let not_found = || Expectation::Error(NotFound);
    let hidden_or_refused = || Expectation::ErrorAnyOf(vec![Forbidden, NotFound]);

    let mut map = BTreeMap::new();

    // Keypairs: addressed by name, namespaced per account.
    map.insert("keypair_show".to_string(), not_found());
    map.insert("keypair_delete".to_string(), not_found());

    // Security groups.
    map.insert("security_group_show".to_string(), Expectation::Succeeds);
    map.insert("security_group_delete".to_string(), forbidden());
    map.insert("security_group_rule_delete".to_string(), forbidden());

    // Servers: show is readable, every mutation is refused.
    map.insert("server_show".to_string(), Expectation::Succeeds);
    map.insert("server_update_name".to_string(), forbidden());
    map.insert("server_delete".to_string(), forbidden());
    map.insert("server_metadata_list".to_string(), forbidden());
    map.insert("server_metadata_set".to_string(), forbidden());
    map.insert("server_metadata_delete".to_string(), forbidden());
    map.insert("server_change_password".to_string(), forbidden());
    map.insert("server_console_output".to_string(), forbidden());
    map.insert("server_reboot".to_string(), forbidden());
    map.insert("server_rebuild".to_string(), forbidden());
    map.insert("server_resize".to_string(), forbidden());
    map.insert("server_stop".to_string(), forbidden());
    map.insert("server_start".to_string(), forbidden());
    map.insert("server_lock".to_string(), forbidden());
    map.insert("server_unlock".to_string(), forbidden());
    map.insert("server_pause".to_string(), forbidden());
    map.insert("server_unpause".to_string(), forbidden());
    map.insert("server_suspend".to_string(), forbidden());
    map.insert("server_resume".to_string(), forbidden());
    map.insert("server_shelve".to_string(), forbidden());
    map.insert("server_unshelve".to_string(), forbidden());
    map.insert("server_shelve_offload".to_string(), forbidden());
    map.insert("server_snapshot_create".to_string(), forbidden());
    map.insert("server_attach_foreign_volume".to_string(), forbidden());

    // Images.
    map.insert("image_show".to_string(), Expectation::Succeeds);
    map.insert("image_metadata_list".to_string(), Expectation::Succeeds);
    map.insert("image_update".to_string(), forbidden());
    map.insert("image_delete".to_string(), forbidden());
    map.insert(
        "boot_server_with_foreign_image".to_string(),
        Expectation::Error(BadRequest),
    );

    // Server snapshot images.
    map.insert("server_snapshot_show".to_string(), Expectation::Succeeds);
    map.insert("server_snapshot_update".to_string(), forbidden());
    map.insert("server_snapshot_delete".to_string(), forbidden());
    // The original API faulted here instead of rejecting cleanly.
    map.insert(
        "boot_server_from_foreign_snapshot".to_string(),
        Expectation::Error(ServerFault),
    );

    // Volumes: the inconsistent subsystem.
    map.insert("volume_show".to_string(), Expectation::Succeeds);
    map.insert("volume_metadata_show".to_string(), Expectation::Succeeds);
    map.insert("volume_update".to_string(), hidden_or_refused());
    map.insert("volume_delete".to_string(), hidden_or_refused());
    map.insert("volume_metadata_update".to_string(), hidden_or_refused());
    map.insert("volume_metadata_delete".to_string(), hidden_or_refused());
    map.insert("volume_extend".to_string(), hidden_or_refused());
    map.insert("volume_attach".to_string(), hidden_or_refused());
    map.insert("volume_detach".to_string(), hidden_or_refused());
    map.insert("attachment_update".to_string(), hidden_or_refused());
    map.insert("volume_snapshot_create_from_foreign".to_string(), hidden_or_refused());

    // Volume snapshots.
    map.insert("vol_snapshot_show".to_string(), hidden_or_refused());
    map.insert("vol_snapshot_update".to_string(), hidden_or_refused());
    map.insert("vol_snapshot_delete".to_string(), forbidden());

    map
}

/// Reduce an API result to the outcome shape expectations judge.
fn observed<T>(result: Result<T, ApiError>) -> Result<(), ApiErrorKind> {
    result.map(|_| ()).map_err(|e| e.kind())
}

struct Runner<'a> {
    expectations: &'a BTreeMap<String, Expectation>,
    report: CheckReport,
}

impl<'a> Runner<'a> {
    fn judge(&mut self, name: &str, outcome: Result<(), ApiErrorKind>) {
        match self.expectations.get(name) {
            Some(expectation) => self.report.record(name, expectation.judge(outcome)),
            None => self.report.skip(name, "no expectation configured"),
        }
    }

    fn skip(&mut self, name: &str, reason: &str) {
        self.report.skip(name, reason);
    }

    fn skip_all(&mut self, names: &[&str], reason: &str) {
        for name in names {
            self.skip(name, reason);
        }
    }
}

/// Run every isolation check in the catalog against the record.
///
/// `account` must differ from the account that provisioned the record's
/// resources. Every check runs regardless of earlier failures; the
/// mutations are all expected to be refused, so a passing run leaves the
/// fixture untouched for the setup role's own teardown.
pub async fn run_catalog<C: CloudApi + ?Sized>(
    cloud: &C,
    account: &AccountId,
    record: &FixtureRecord,
    local: &LocalResources,
    expectations: &BTreeMap<String, Expectation>,
) -> CheckReport {
    info!(
        run_id = %record.run_id,
        account = %account,
        server = %record.server.id,
        "running isolation catalog"
    );

    let mut r = Runner {
        expectations,
        report: CheckReport::new(),
    };

    run_server_checks(cloud, account, record, local, &mut r).await;
    run_keypair_checks(cloud, account, record, &mut r).await;
    run_security_group_checks(cloud, account, record, &mut r).await;
    run_image_checks(cloud, account, record, &mut r).await;
    run_server_snapshot_checks(cloud, account, record, &mut r).await;
    run_volume_checks(cloud, account, record, local, &mut r).await;

    r.report.log_summary("isolation");
    r.report
}

async fn run_server_checks<C: CloudApi + ?Sized>(
    cloud: &C,
    account: &AccountId,
    record: &FixtureRecord,
    local: &LocalResources,
    r: &mut Runner<'_>,
) {
    let id = record.server.id.as_str();

    r.judge("server_show", observed(cloud.show_server(account, id).await));
    r.judge(
        "server_update_name",
        observed(cloud.update_server_name(account, id, "intruder-renamed").await),
    );
    r.judge("server_delete", observed(cloud.delete_server(account, id).await));
    r.judge(
        "server_metadata_list",
        observed(cloud.list_server_metadata(account, id).await),
    );
    r.judge(
        "server_metadata_set",
        observed(cloud.set_server_metadata_item(account, id, "sabotage", "true").await),
    );
    r.judge(
        "server_metadata_delete",
        observed(cloud.delete_server_metadata_item(account, id, "purpose").await),
    );
    r.judge(
        "server_change_password",
        observed(cloud.change_password(account, id, "hunter2").await),
    );
    r.judge(
        "server_console_output",
        observed(cloud.console_output(account, id, 10).await),
    );
    r.judge("server_reboot", observed(cloud.reboot_server(account, id).await));
    r.judge("server_rebuild", observed(cloud.rebuild_server(account, id).await));
    r.judge(
        "server_resize",
        observed(cloud.resize_server(account, id, "m1.large").await),
    );
    r.judge("server_stop", observed(cloud.stop_server(account, id).await));
    r.judge("server_start", observed(cloud.start_server(account, id).await));
    r.judge("server_lock", observed(cloud.lock_server(account, id).await));
    r.judge("server_unlock", observed(cloud.unlock_server(account, id).await));
    r.judge("server_pause", observed(cloud.pause_server(account, id).await));
    r.judge("server_unpause", observed(cloud.unpause_server(account, id).await));
    r.judge("server_suspend", observed(cloud.suspend_server(account, id).await));
    r.judge("server_resume", observed(cloud.resume_server(account, id).await));
    r.judge("server_shelve", observed(cloud.shelve_server(account, id).await));
    r.judge("server_unshelve", observed(cloud.unshelve_server(account, id).await));
    r.judge(
        "server_shelve_offload",
        observed(cloud.shelve_offload_server(account, id).await),
    );
    r.judge(
        "server_snapshot_create",
        observed(cloud.snapshot_server(account, id, "intruder-snap").await),
    );

    match &local.volume_id {
        Some(volume_id) => r.judge(
            "server_attach_foreign_volume",
            observed(cloud.attach_volume(account, id, volume_id, "/dev/vdz").await),
        ),
        None => r.skip("server_attach_foreign_volume", "no local volume available"),
    }
}

async fn run_keypair_checks<C: CloudApi + ?Sized>(
    cloud: &C,
    account: &AccountId,
    record: &FixtureRecord,
    r: &mut Runner<'_>,
) {
    match &record.keypairname {
        Some(name) => {
            r.judge("keypair_show", observed(cloud.show_keypair(account, name).await));
            r.judge("keypair_delete", observed(cloud.delete_keypair(account, name).await));
        }
        None => r.skip_all(&["keypair_show", "keypair_delete"], "no keypair in record"),
    }
}

async fn run_security_group_checks<C: CloudApi + ?Sized>(
    cloud: &C,
    account: &AccountId,
    record: &FixtureRecord,
    r: &mut Runner<'_>,
) {
    match &record.security_group {
        Some(group) => {
            r.judge(
                "security_group_show",
                observed(cloud.show_security_group(account, &group.id).await),
            );
            r.judge(
                "security_group_delete",
                observed(cloud.delete_security_group(account, &group.id).await),
            );
        }
        None => r.skip_all(
            &["security_group_show", "security_group_delete"],
            "no security group in record",
        ),
    }

    match &record.rule {
        Some(rule) => r.judge(
            "security_group_rule_delete",
            observed(cloud.delete_security_group_rule(account, &rule.id).await),
        ),
        None => r.skip("security_group_rule_delete", "no rule in record"),
    }
}

async fn run_image_checks<C: CloudApi + ?Sized>(
    cloud: &C,
    account: &AccountId,
    record: &FixtureRecord,
    r: &mut Runner<'_>,
) {
    let Some(image) = &record.image else {
        r.skip_all(
            &[
                "image_show",
                "image_metadata_list",
                "image_update",
                "image_delete",
                "boot_server_with_foreign_image",
            ],
            "image service disabled",
        );
        return;
    };

    r.judge("image_show", observed(cloud.show_image(account, &image.id).await));
    r.judge(
        "image_metadata_list",
        observed(cloud.list_image_metadata(account, &image.id).await),
    );
    r.judge(
        "image_update",
        observed(cloud.update_image(account, &image.id, "intruder-renamed").await),
    );
    r.judge("image_delete", observed(cloud.delete_image(account, &image.id).await));
    r.judge(
        "boot_server_with_foreign_image",
        observed(
            cloud
                .create_server(
                    account,
                    ServerCreateOpts {
                        name: "intruder-boot".to_string(),
                        image_id: Some(image.id.clone()),
                        ..Default::default()
                    },
                )
                .await,
        ),
    );
}

async fn run_server_snapshot_checks<C: CloudApi + ?Sized>(
    cloud: &C,
    account: &AccountId,
    record: &FixtureRecord,
    r: &mut Runner<'_>,
) {
    let Some(snapshot) = &record.server_snapshot else {
        r.skip_all(
            &[
                "server_snapshot_show",
                "server_snapshot_update",
                "server_snapshot_delete",
                "boot_server_from_foreign_snapshot",
            ],
            "server snapshotting disabled",
        );
        return;
    };

    r.judge(
        "server_snapshot_show",
        observed(cloud.show_image(account, &snapshot.id).await),
    );
    r.judge(
        "server_snapshot_update",
        observed(cloud.update_image(account, &snapshot.id, "intruder-renamed").await),
    );
    r.judge(
        "server_snapshot_delete",
        observed(cloud.delete_image(account, &snapshot.id).await),
    );
    r.judge(
        "boot_server_from_foreign_snapshot",
        observed(
            cloud
                .create_server(
                    account,
                    ServerCreateOpts {
                        name: "intruder-boot-snap".to_string(),
                        image_id: Some(snapshot.id.clone()),
                        ..Default::default()
                    },
                )
                .await,
        ),
    );
}

async fn run_volume_checks<C: CloudApi + ?Sized>(
    cloud: &C,
    account: &AccountId,
    record: &FixtureRecord,
    local: &LocalResources,
    r: &mut Runner<'_>,
) {
    match &record.volume1 {
        Some(volume) => {
            let id = volume.id.as_str();
            r.judge("volume_show", observed(cloud.show_volume(account, id).await));
            r.judge(
                "volume_metadata_show",
                observed(cloud.show_volume_metadata(account, id).await),
            );
            r.judge(
                "volume_update",
                observed(cloud.update_volume(account, id, "intruder-renamed").await),
            );
            r.judge("volume_delete", observed(cloud.delete_volume(account, id).await));
            r.judge(
                "volume_metadata_update",
                observed(
                    cloud
                        .update_volume_metadata(account, id, BTreeMap::from([("tamper".to_string(), "yes".to_string())]))
                        .await,
                ),
            );
            r.judge(
                "volume_metadata_delete",
                observed(cloud.delete_volume_metadata_item(account, id, "purpose").await),
            );
            r.judge("volume_extend", observed(cloud.extend_volume(account, id, 100).await));
            r.judge(
                "volume_snapshot_create_from_foreign",
                observed(cloud.create_volume_snapshot(account, id, "intruder-snap").await),
            );
            match &local.server_id {
                Some(server_id) => r.judge(
                    "volume_attach",
                    observed(cloud.attach_volume(account, server_id, id, "/dev/vdz").await),
                ),
                None => r.skip("volume_attach", "no local server available"),
            }
        }
        None => r.skip_all(
            &[
                "volume_show",
                "volume_metadata_show",
                "volume_update",
                "volume_delete",
                "volume_metadata_update",
                "volume_metadata_delete",
                "volume_extend",
                "volume_snapshot_create_from_foreign",
                "volume_attach",
            ],
            "volume service disabled",
        ),
    }

    match &record.attachment {
        Some(attachment) => {
            r.judge(
                "volume_detach",
                observed(cloud.detach_volume(account, &attachment.id).await),
            );
            r.judge(
                "attachment_update",
                observed(cloud.update_attachment(account, &attachment.id, "/dev/vdz").await),
            );
        }
        None => r.skip_all(&["volume_detach", "attachment_update"], "no attachment in record"),
    }

    match &record.vol_snapshot {
        Some(snapshot) => {
            r.judge(
                "vol_snapshot_show",
                observed(cloud.show_volume_snapshot(account, &snapshot.id).await),
            );
            r.judge(
                "vol_snapshot_update",
                observed(cloud.update_volume_snapshot(account, &snapshot.id, "intruder-renamed").await),
            );
            r.judge(
                "vol_snapshot_delete",
                observed(cloud.delete_volume_snapshot(account, &snapshot.id).await),
            );
        }
        None => r.skip_all(
            &["vol_snapshot_show", "vol_snapshot_update", "vol_snapshot_delete"],
            "volume snapshotting disabled",
        ),
    }
}
