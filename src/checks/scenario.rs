//! Single-account provisioning walk.
//!
//! The happy-path counterpart of the isolation catalog: one account boots
//! a server with a keypair, attaches a volume, stamps a timestamp into the
//! server metadata, reboots, and verifies the stamp survived. Grounds the
//! status waiters against the same API surface the catalog abuses, and
//! tears everything down best-effort at the end.

use snafu::ResultExt;
use snafu::Snafu;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use crate::cloud::waiters::wait_for_server_status;
use crate::cloud::waiters::wait_for_volume_status;
use crate::cloud::waiters::WaitConfig;
use crate::cloud::waiters::WaitError;
use crate::cloud::AccountId;
use crate::cloud::ApiError;
use crate::cloud::CloudApi;
use crate::cloud::ComputeApi;
use crate::cloud::ServerCreateOpts;
use crate::cloud::ServerStatus;
use crate::cloud::VolumeApi;
use crate::cloud::VolumeStatus;

const STAMP_KEY: &str = "scenario_boot_stamp";

/// Errors from the scenario walk.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ScenarioError {
    /// An API call in the walk failed.
    #[snafu(display("scenario step '{step}' failed: {source}"))]
    Step {
        /// The step that failed.
        step: String,
        /// The underlying error.
        source: ApiError,
    },

    /// A status wait in the walk failed.
    #[snafu(display("scenario wait failed: {source}"))]
    ScenarioWait {
        /// The underlying error.
        source: WaitError,
    },

    /// The metadata stamp did not survive the reboot.
    #[snafu(display("metadata key '{key}' lost across reboot"))]
    MetadataLost {
        /// The key that went missing or changed.
        key: String,
    },
}

#[derive(Default)]
struct Walked {
    keypair: Option<String>,
    server_id: Option<String>,
    volume_id: Option<String>,
    attachment_id: Option<String>,
}

/// Run the walk under `account`, tearing down whatever was created even
/// when a step fails.
pub async fn run_scenario<C: CloudApi + ?Sized>(
    cloud: &C,
    account: &AccountId,
    wait: &WaitConfig,
    cancel: &CancellationToken,
) -> Result<(), ScenarioError> {
    let mut walked = Walked::default();
    let result = walk(cloud, account, wait, cancel, &mut walked).await;
    teardown(cloud, account, &walked).await;
    result
}

async fn walk<C: CloudApi + ?Sized>(
    cloud: &C,
    account: &AccountId,
    wait: &WaitConfig,
    cancel: &CancellationToken,
    walked: &mut Walked,
) -> Result<(), ScenarioError> {
    info!(account = %account, "scenario: creating keypair");
    let keypair = cloud
        .create_keypair(account, "scenario-key")
        .await
        .context(StepSnafu { step: "create keypair" })?;
    walked.keypair = Some(keypair.name.clone());

    info!("scenario: booting server");
    let stamp = chrono::Utc::now().to_rfc3339();
    let server = cloud
        .create_server(
            account,
            ServerCreateOpts {
                name: "scenario-server".to_string(),
                key_name: Some(keypair.name),
                metadata: [(STAMP_KEY.to_string(), stamp.clone())].into(),
                ..Default::default()
            },
        )
        .await
        .context(StepSnafu { step: "create server" })?;
    walked.server_id = Some(server.id.clone());
    wait_for_server_status(cloud, account, &server.id, ServerStatus::Active, wait, cancel)
        .await
        .context(ScenarioWaitSnafu)?;

    info!(server = %server.id, "scenario: creating and attaching volume");
    let volume = cloud
        .create_volume(account, "scenario-volume", 1)
        .await
        .context(StepSnafu { step: "create volume" })?;
    walked.volume_id = Some(volume.id.clone());
    wait_for_volume_status(cloud, account, &volume.id, VolumeStatus::Available, wait, cancel)
        .await
        .context(ScenarioWaitSnafu)?;

    let attachment = cloud
        .attach_volume(account, &server.id, &volume.id, "/dev/vdb")
        .await
        .context(StepSnafu { step: "attach volume" })?;
    walked.attachment_id = Some(attachment.id.clone());
    wait_for_volume_status(cloud, account, &volume.id, VolumeStatus::InUse, wait, cancel)
        .await
        .context(ScenarioWaitSnafu)?;

    info!(server = %server.id, stamp = %stamp, "scenario: rebooting");
    cloud
        .reboot_server(account, &server.id)
        .await
        .context(StepSnafu { step: "reboot server" })?;
    wait_for_server_status(cloud, account, &server.id, ServerStatus::Active, wait, cancel)
        .await
        .context(ScenarioWaitSnafu)?;

    let metadata = cloud
        .list_server_metadata(account, &server.id)
        .await
        .context(StepSnafu { step: "list metadata" })?;
    if metadata.get(STAMP_KEY) != Some(&stamp) {
        return MetadataLostSnafu { key: STAMP_KEY }.fail();
    }

    info!("scenario: metadata survived reboot");
    Ok(())
}

/// Best-effort teardown in reverse order of creation.
async fn teardown<C: CloudApi + ?Sized>(cloud: &C, account: &AccountId, walked: &Walked) {
    if let Some(attachment_id) = &walked.attachment_id {
        if let Err(e) = cloud.detach_volume(account, attachment_id).await {
            warn!(attachment = %attachment_id, error = %e, "scenario cleanup: detach failed; continuing");
        }
    }
    if let Some(volume_id) = &walked.volume_id {
        if let Err(e) = cloud.delete_volume(account, volume_id).await {
            warn!(volume = %volume_id, error = %e, "scenario cleanup: volume deletion failed; continuing");
        }
    }
    if let Some(server_id) = &walked.server_id {
        if let Err(e) = cloud.delete_server(account, server_id).await {
            warn!(server = %server_id, error = %e, "scenario cleanup: server deletion failed; continuing");
        }
    }
    if let Some(keypair) = &walked.keypair {
        if let Err(e) = cloud.delete_keypair(account, keypair).await {
            warn!(keypair = %keypair, error = %e, "scenario cleanup: keypair deletion failed; continuing");
        }
    }
}
