//! Bounded waiters for resource status transitions.
//!
//! Provisioning calls return while the resource is still transitional; the
//! waiters poll its status until the target is reached, with:
//! - a hard ceiling on total wait
//! - jittered sleep between polls
//! - cancellation that surfaces distinctly from timeout

use std::time::Duration;
use std::time::Instant;

use rand::Rng;
use snafu::ResultExt;
use snafu::Snafu;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::AccountId;
use super::ApiError;
use super::ComputeApi;
use super::Image;
use super::ImageApi;
use super::ImageStatus;
use super::Server;
use super::ServerStatus;
use super::Volume;
use super::VolumeApi;
use super::VolumeStatus;

/// Polling configuration for status waits.
#[derive(Debug, Clone)]
pub struct WaitConfig {
    /// Hard ceiling on the total wait in milliseconds.
    pub timeout_ms: u64,
    /// Base sleep between polls in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,   // 30 seconds
            poll_interval_ms: 200,
        }
    }
}

/// Errors from status waits.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum WaitError {
    /// The target status was not reached before the ceiling.
    #[snafu(display("{resource} did not reach {target} within {timeout_ms}ms (last: {last})"))]
    StatusTimeout {
        /// The resource being waited on.
        resource: String,
        /// The status that was expected.
        target: String,
        /// The last status observed.
        last: String,
        /// The ceiling that elapsed.
        timeout_ms: u64,
    },

    /// The surrounding run was cancelled while waiting.
    #[snafu(display("wait for {resource} cancelled"))]
    WaitCancelled {
        /// The resource being waited on.
        resource: String,
    },

    /// The resource settled into an error state, so the target is unreachable.
    #[snafu(display("{resource} entered an error state while waiting"))]
    ResourceErrored {
        /// The resource being waited on.
        resource: String,
    },

    /// The status poll itself failed.
    #[snafu(display("api error while waiting for {resource}: {source}"))]
    Api {
        /// The resource being waited on.
        resource: String,
        /// The underlying error.
        source: ApiError,
    },
}

/// Sleep one jittered interval, bailing on deadline or cancellation.
async fn pause_or_bail(
    resource: &str,
    target: &str,
    last: &str,
    deadline: Instant,
    config: &WaitConfig,
    cancel: &CancellationToken,
) -> Result<(), WaitError> {
    let now = Instant::now();
    if now >= deadline {
        return StatusTimeoutSnafu {
            resource: resource.to_string(),
            target: target.to_string(),
            last: last.to_string(),
            timeout_ms: config.timeout_ms,
        }
        .fail();
    }

    // Jitter keeps concurrent waiters from polling in lockstep.
    // Create rng here to avoid holding a non-Send type across await.
    let jitter = rand::rng().random_range(0..config.poll_interval_ms / 4 + 1);
    let pause = Duration::from_millis(config.poll_interval_ms + jitter).min(deadline - now);

    tokio::select! {
        _ = cancel.cancelled() => WaitCancelledSnafu {
            resource: resource.to_string(),
        }
        .fail(),
        _ = tokio::time::sleep(pause) => Ok(()),
    }
}

/// Wait until the server reaches `target`.
pub async fn wait_for_server_status<C: ComputeApi + ?Sized>(
    cloud: &C,
    account: &AccountId,
    id: &str,
    target: ServerStatus,
    config: &WaitConfig,
    cancel: &CancellationToken,
) -> Result<Server, WaitError> {
    let resource = format!("server {id}");
    let deadline = Instant::now() + Duration::from_millis(config.timeout_ms);

    loop {
        let server = cloud.show_server(account, id).await.context(ApiSnafu {
            resource: resource.clone(),
        })?;
        if server.status == target {
            debug!(server = %id, status = %server.status, "server reached target status");
            return Ok(server);
        }
        if server.status == ServerStatus::Error {
            return ResourceErroredSnafu { resource }.fail();
        }

        pause_or_bail(
            &resource,
            &target.to_string(),
            &server.status.to_string(),
            deadline,
            config,
            cancel,
        )
        .await?;
    }
}

/// Wait until the image reaches `target`.
pub async fn wait_for_image_status<C: ImageApi + ?Sized>(
    cloud: &C,
    account: &AccountId,
    id: &str,
    target: ImageStatus,
    config: &WaitConfig,
    cancel: &CancellationToken,
) -> Result<Image, WaitError> {
    let resource = format!("image {id}");
    let deadline = Instant::now() + Duration::from_millis(config.timeout_ms);

    loop {
        let image = cloud.show_image(account, id).await.context(ApiSnafu {
            resource: resource.clone(),
        })?;
        if image.status == target {
            debug!(image = %id, "image reached target status");
            return Ok(image);
        }

        pause_or_bail(
            &resource,
            &format!("{target:?}"),
            &format!("{:?}", image.status),
            deadline,
            config,
            cancel,
        )
        .await?;
    }
}

/// Wait until the volume reaches `target`.
pub async fn wait_for_volume_status<C: VolumeApi + ?Sized>(
    cloud: &C,
    account: &AccountId,
    id: &str,
    target: VolumeStatus,
    config: &WaitConfig,
    cancel: &CancellationToken,
) -> Result<Volume, WaitError> {
    let resource = format!("volume {id}");
    let deadline = Instant::now() + Duration::from_millis(config.timeout_ms);

    loop {
        let volume = cloud.show_volume(account, id).await.context(ApiSnafu {
            resource: resource.clone(),
        })?;
        if volume.status == target {
            debug!(volume = %id, "volume reached target status");
            return Ok(volume);
        }
        if volume.status == VolumeStatus::Error {
            return ResourceErroredSnafu { resource }.fail();
        }

        pause_or_bail(
            &resource,
            &format!("{target:?}"),
            &format!("{:?}", volume.status),
            deadline,
            config,
            cancel,
        )
        .await?;
    }
}
