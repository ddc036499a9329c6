//! In-memory deterministic implementation of the cloud API traits.
//!
//! Backs the roles and the test suites without network I/O. The isolation
//! policy is one coherent rendition of the per-operation contracts the
//! checks assert: shows are cross-account readable, compute and network
//! mutations are `Forbidden`, keypairs are namespaced per account (foreign
//! ones are genuinely `NotFound`), and the volume service hides foreign
//! volumes and snapshots on everything except snapshot deletion, which it
//! refuses explicitly.
//!
//! # Limitations
//!
//! - No persistence; state lives for the lifetime of the value
//! - No quotas, flavors, or networks beyond security groups
//! - Transitional statuses settle on the next show, which stands in for
//!   the progress a real cloud makes between polls
//!
//! # Example
//!
//! ```ignore
//! use bulkhead::cloud::{AccountId, ComputeApi, DeterministicCloud, ServerCreateOpts};
//!
//! let cloud = DeterministicCloud::new();
//! let alice = AccountId::new("alice");
//! let server = cloud.create_server(&alice, ServerCreateOpts {
//!     name: "fixture-server".into(),
//!     ..Default::default()
//! }).await?;
//! ```

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::AccountId;
use super::ApiError;
use super::ComputeApi;
use super::Image;
use super::ImageApi;
use super::Keypair;
use super::NetworkApi;
use super::SecurityGroup;
use super::SecurityGroupRule;
use super::Server;
use super::ServerCreateOpts;
use super::ServerStatus;
use super::Volume;
use super::VolumeApi;
use super::VolumeAttachment;
use super::VolumeSnapshot;
use super::VolumeStatus;
use crate::cloud::types::ImageStatus;

#[derive(Default)]
struct CloudState {
    servers: HashMap<String, Server>,
    images: HashMap<String, Image>,
    /// Keyed by (account, name): keypairs are per-account namespaces.
    keypairs: HashMap<(String, String), Keypair>,
    security_groups: HashMap<String, SecurityGroup>,
    rules: HashMap<String, SecurityGroupRule>,
    volumes: HashMap<String, Volume>,
    snapshots: HashMap<String, VolumeSnapshot>,
    attachments: HashMap<String, VolumeAttachment>,
    /// Every attempted operation, in call order, as `op:target`.
    operations: Vec<String>,
    /// One-shot injected failures, keyed by operation name.
    faults: HashMap<String, ApiError>,
    next_id: u64,
}

impl CloudState {
    /// Record the attempt and fire any injected fault for `op`.
    ///
    /// Attempts are recorded before any validation so tests can assert on
    /// ordering even when the call fails.
    fn note(&mut self, op: &str, target: &str) -> Result<(), ApiError> {
        self.operations.push(format!("{op}:{target}"));
        if let Some(err) = self.faults.remove(op) {
            return Err(err);
        }
        Ok(())
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn server_owned_mut(&mut self, account: &AccountId, id: &str, action: &str) -> Result<&mut Server, ApiError> {
        match self.servers.get_mut(id) {
            None => Err(ApiError::not_found(format!("server {id}"))),
            Some(s) if s.owner != *account => Err(ApiError::forbidden(format!("{action} server {id}"))),
            Some(s) => Ok(s),
        }
    }

    fn image_owned_mut(&mut self, account: &AccountId, id: &str, action: &str) -> Result<&mut Image, ApiError> {
        match self.images.get_mut(id) {
            None => Err(ApiError::not_found(format!("image {id}"))),
            Some(i) if i.owner != *account => Err(ApiError::forbidden(format!("{action} image {id}"))),
            Some(i) => Ok(i),
        }
    }

    /// Foreign volumes are hidden, not refused.
    fn volume_owned_mut(&mut self, account: &AccountId, id: &str) -> Result<&mut Volume, ApiError> {
        match self.volumes.get_mut(id) {
            Some(v) if v.owner == *account => Ok(v),
            _ => Err(ApiError::not_found(format!("volume {id}"))),
        }
    }

    /// Foreign snapshots are hidden, like their volumes.
    fn snapshot_owned_mut(&mut self, account: &AccountId, id: &str) -> Result<&mut VolumeSnapshot, ApiError> {
        match self.snapshots.get_mut(id) {
            Some(s) if s.owner == *account => Ok(s),
            _ => Err(ApiError::not_found(format!("snapshot {id}"))),
        }
    }

    /// Attachment ownership follows the attached volume's owner.
    fn attachment_owned(&self, account: &AccountId, id: &str) -> Result<VolumeAttachment, ApiError> {
        let Some(attachment) = self.attachments.get(id) else {
            return Err(ApiError::not_found(format!("attachment {id}")));
        };
        let owned = self
            .volumes
            .get(&attachment.volume_id)
            .is_some_and(|v| v.owner == *account);
        if owned {
            Ok(attachment.clone())
        } else {
            Err(ApiError::not_found(format!("attachment {id}")))
        }
    }
}

/// Mutating actions are refused while the instance lock is held. Ownership
/// is checked first, so foreign callers see Forbidden, never the lock.
fn require_unlocked(server: &Server, action: &str) -> Result<(), ApiError> {
    if server.locked {
        Err(ApiError::conflict(format!(
            "cannot {action} locked server {}",
            server.id
        )))
    } else {
        Ok(())
    }
}

/// A server action that is only valid from certain statuses.
fn require_status(server: &Server, allowed: &[ServerStatus], action: &str) -> Result<(), ApiError> {
    if allowed.contains(&server.status) {
        Ok(())
    } else {
        Err(ApiError::conflict(format!(
            "cannot {action} server {} in status {}",
            server.id, server.status
        )))
    }
}

/// In-memory deterministic cloud for tests and in-process role pairing.
#[derive(Clone, Default)]
pub struct DeterministicCloud {
    state: Arc<Mutex<CloudState>>,
}

impl DeterministicCloud {
    /// Create an empty in-memory cloud.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next call to `op` fail with `error`, once.
    ///
    /// Used to exercise best-effort paths: cleanup must keep going when a
    /// single teardown call fails.
    pub async fn fail_next(&self, op: &str, error: ApiError) {
        self.state.lock().await.faults.insert(op.to_string(), error);
    }

    /// Snapshot of every attempted operation so far, in call order.
    ///
    /// Entries are `op:target`, recorded before validation, so failed and
    /// refused attempts appear too.
    pub async fn operations(&self) -> Vec<String> {
        self.state.lock().await.operations.clone()
    }

    /// Forget recorded operations. Faults are left armed.
    pub async fn clear_operations(&self) {
        self.state.lock().await.operations.clear();
    }
}

#[async_trait]
impl ComputeApi for DeterministicCloud {
    async fn create_server(&self, account: &AccountId, opts: ServerCreateOpts) -> Result<Server, ApiError> {
        let mut state = self.state.lock().await;
        state.note("create_server", &opts.name)?;

        if let Some(image_id) = &opts.image_id {
            match state.images.get(image_id) {
                None => {
                    return Err(ApiError::bad_request(format!("invalid image reference '{image_id}'")));
                }
                Some(image) if image.owner != *account => {
                    // Booting from a foreign snapshot trips an internal
                    // fault before request validation can reject it.
                    return if image.source_server_id.is_some() {
                        Err(ApiError::server_fault(format!(
                            "failed to schedule instance from snapshot '{image_id}'"
                        )))
                    } else {
                        Err(ApiError::bad_request(format!("invalid image reference '{image_id}'")))
                    };
                }
                Some(_) => {}
            }
        }

        let id = state.next_id("srv");
        let server = Server {
            id: id.clone(),
            name: opts.name,
            owner: account.clone(),
            status: ServerStatus::Build,
            image_id: opts.image_id,
            key_name: opts.key_name,
            locked: false,
            metadata: opts.metadata,
        };
        state.servers.insert(id, server.clone());
        Ok(server)
    }

    // Shows are cross-account readable, so the caller's account is unused.
    async fn show_server(&self, _account: &AccountId, id: &str) -> Result<Server, ApiError> {
        let mut state = self.state.lock().await;
        state.note("show_server", id)?;
        let server = state
            .servers
            .get_mut(id)
            .ok_or_else(|| ApiError::not_found(format!("server {id}")))?;
        server.status = server.status.settled();
        Ok(server.clone())
    }

    async fn update_server_name(&self, account: &AccountId, id: &str, name: &str) -> Result<Server, ApiError> {
        let mut state = self.state.lock().await;
        state.note("update_server_name", id)?;
        let server = state.server_owned_mut(account, id, "update")?;
        require_unlocked(server, "update")?;
        server.name = name.to_string();
        Ok(server.clone())
    }

    async fn delete_server(&self, account: &AccountId, id: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock().await;
        state.note("delete_server", id)?;
        let server = state.server_owned_mut(account, id, "delete")?;
        require_unlocked(server, "delete")?;
        state.servers.remove(id);
        // The hypervisor severs any remaining attachments on deletion.
        let severed: Vec<String> = state
            .attachments
            .values()
            .filter(|a| a.server_id == id)
            .map(|a| a.id.clone())
            .collect();
        for attachment_id in severed {
            if let Some(attachment) = state.attachments.remove(&attachment_id) {
                if let Some(volume) = state.volumes.get_mut(&attachment.volume_id) {
                    volume.status = VolumeStatus::Available;
                    volume.attached_to = None;
                }
            }
        }
        Ok(())
    }

    async fn list_server_metadata(
        &self,
        account: &AccountId,
        id: &str,
    ) -> Result<BTreeMap<String, String>, ApiError> {
        let mut state = self.state.lock().await;
        state.note("list_server_metadata", id)?;
        let server = state.server_owned_mut(account, id, "list metadata of")?;
        Ok(server.metadata.clone())
    }

    async fn set_server_metadata_item(
        &self,
        account: &AccountId,
        id: &str,
        key: &str,
        value: &str,
    ) -> Result<(), ApiError> {
        let mut state = self.state.lock().await;
        state.note("set_server_metadata_item", id)?;
        let server = state.server_owned_mut(account, id, "set metadata on")?;
        require_unlocked(server, "set metadata on")?;
        server.metadata.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete_server_metadata_item(&self, account: &AccountId, id: &str, key: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock().await;
        state.note("delete_server_metadata_item", id)?;
        let server = state.server_owned_mut(account, id, "delete metadata on")?;
        require_unlocked(server, "delete metadata on")?;
        server.metadata.remove(key);
        Ok(())
    }

    async fn change_password(&self, account: &AccountId, id: &str, _password: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock().await;
        state.note("change_password", id)?;
        let server = state.server_owned_mut(account, id, "change password of")?;
        require_unlocked(server, "change password of")?;
        require_status(server, &[ServerStatus::Active], "change password of")?;
        Ok(())
    }

    async fn console_output(&self, account: &AccountId, id: &str, lines: u32) -> Result<String, ApiError> {
        let mut state = self.state.lock().await;
        state.note("console_output", id)?;
        let server = state.server_owned_mut(account, id, "read console of")?;
        Ok(format!("[{}] last {lines} console lines", server.id))
    }

    async fn reboot_server(&self, account: &AccountId, id: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock().await;
        state.note("reboot_server", id)?;
        let server = state.server_owned_mut(account, id, "reboot")?;
        require_unlocked(server, "reboot")?;
        require_status(server, &[ServerStatus::Active, ServerStatus::Shutoff], "reboot")?;
        server.status = ServerStatus::Reboot;
        Ok(())
    }

    async fn rebuild_server(&self, account: &AccountId, id: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock().await;
        state.note("rebuild_server", id)?;
        let server = state.server_owned_mut(account, id, "rebuild")?;
        require_unlocked(server, "rebuild")?;
        require_status(server, &[ServerStatus::Active, ServerStatus::Shutoff], "rebuild")?;
        server.status = ServerStatus::Rebuild;
        Ok(())
    }

    async fn resize_server(&self, account: &AccountId, id: &str, _flavor: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock().await;
        state.note("resize_server", id)?;
        let server = state.server_owned_mut(account, id, "resize")?;
        require_unlocked(server, "resize")?;
        require_status(server, &[ServerStatus::Active, ServerStatus::Shutoff], "resize")?;
        server.status = ServerStatus::Resize;
        Ok(())
    }

    async fn start_server(&self, account: &AccountId, id: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock().await;
        state.note("start_server", id)?;
        let server = state.server_owned_mut(account, id, "start")?;
        require_unlocked(server, "start")?;
        require_status(server, &[ServerStatus::Shutoff], "start")?;
        server.status = ServerStatus::Active;
        Ok(())
    }

    async fn stop_server(&self, account: &AccountId, id: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock().await;
        state.note("stop_server", id)?;
        let server = state.server_owned_mut(account, id, "stop")?;
        require_unlocked(server, "stop")?;
        require_status(server, &[ServerStatus::Active], "stop")?;
        server.status = ServerStatus::Shutoff;
        Ok(())
    }

    async fn lock_server(&self, account: &AccountId, id: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock().await;
        state.note("lock_server", id)?;
        let server = state.server_owned_mut(account, id, "lock")?;
        server.locked = true;
        Ok(())
    }

    async fn unlock_server(&self, account: &AccountId, id: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock().await;
        state.note("unlock_server", id)?;
        let server = state.server_owned_mut(account, id, "unlock")?;
        server.locked = false;
        Ok(())
    }

    async fn pause_server(&self, account: &AccountId, id: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock().await;
        state.note("pause_server", id)?;
        let server = state.server_owned_mut(account, id, "pause")?;
        require_unlocked(server, "pause")?;
        require_status(server, &[ServerStatus::Active], "pause")?;
        server.status = ServerStatus::Paused;
        Ok(())
    }

    async fn unpause_server(&self, account: &AccountId, id: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock().await;
        state.note("unpause_server", id)?;
        let server = state.server_owned_mut(account, id, "unpause")?;
        require_unlocked(server, "unpause")?;
        require_status(server, &[ServerStatus::Paused], "unpause")?;
        server.status = ServerStatus::Active;
        Ok(())
    }

    async fn suspend_server(&self, account: &AccountId, id: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock().await;
        state.note("suspend_server", id)?;
        let server = state.server_owned_mut(account, id, "suspend")?;
        require_unlocked(server, "suspend")?;
        require_status(server, &[ServerStatus::Active], "suspend")?;
        server.status = ServerStatus::Suspended;
        Ok(())
    }

    async fn resume_server(&self, account: &AccountId, id: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock().await;
        state.note("resume_server", id)?;
        let server = state.server_owned_mut(account, id, "resume")?;
        require_unlocked(server, "resume")?;
        require_status(server, &[ServerStatus::Suspended], "resume")?;
        server.status = ServerStatus::Active;
        Ok(())
    }

    async fn shelve_server(&self, account: &AccountId, id: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock().await;
        state.note("shelve_server", id)?;
        let server = state.server_owned_mut(account, id, "shelve")?;
        require_unlocked(server, "shelve")?;
        require_status(server, &[ServerStatus::Active, ServerStatus::Shutoff], "shelve")?;
        server.status = ServerStatus::Shelved;
        Ok(())
    }

    async fn unshelve_server(&self, account: &AccountId, id: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock().await;
        state.note("unshelve_server", id)?;
        let server = state.server_owned_mut(account, id, "unshelve")?;
        require_unlocked(server, "unshelve")?;
        require_status(
            server,
            &[ServerStatus::Shelved, ServerStatus::ShelvedOffloaded],
            "unshelve",
        )?;
        server.status = ServerStatus::Active;
        Ok(())
    }

    async fn shelve_offload_server(&self, account: &AccountId, id: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock().await;
        state.note("shelve_offload_server", id)?;
        let server = state.server_owned_mut(account, id, "shelve-offload")?;
        require_unlocked(server, "shelve-offload")?;
        require_status(server, &[ServerStatus::Shelved], "shelve-offload")?;
        server.status = ServerStatus::ShelvedOffloaded;
        Ok(())
    }

    async fn snapshot_server(&self, account: &AccountId, id: &str, image_name: &str) -> Result<Image, ApiError> {
        let mut state = self.state.lock().await;
        state.note("snapshot_server", id)?;
        let server = state.server_owned_mut(account, id, "snapshot")?;
        require_unlocked(server, "snapshot")?;
        let image_id = state.next_id("img");
        let image = Image {
            id: image_id.clone(),
            name: image_name.to_string(),
            owner: account.clone(),
            status: ImageStatus::Queued,
            source_server_id: Some(id.to_string()),
            metadata: BTreeMap::new(),
        };
        state.images.insert(image_id, image.clone());
        Ok(image)
    }

    async fn create_keypair(&self, account: &AccountId, name: &str) -> Result<Keypair, ApiError> {
        let mut state = self.state.lock().await;
        state.note("create_keypair", name)?;
        let key = (account.as_str().to_string(), name.to_string());
        if state.keypairs.contains_key(&key) {
            return Err(ApiError::conflict(format!("keypair '{name}' already exists")));
        }
        let keypair = Keypair {
            name: name.to_string(),
            owner: account.clone(),
            public_key: format!("ssh-ed25519 deterministic-{name}"),
        };
        state.keypairs.insert(key, keypair.clone());
        Ok(keypair)
    }

    async fn show_keypair(&self, account: &AccountId, name: &str) -> Result<Keypair, ApiError> {
        let mut state = self.state.lock().await;
        state.note("show_keypair", name)?;
        let key = (account.as_str().to_string(), name.to_string());
        state
            .keypairs
            .get(&key)
            .cloned()
            .ok_or_else(|| ApiError::not_found(format!("keypair {name}")))
    }

    async fn delete_keypair(&self, account: &AccountId, name: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock().await;
        state.note("delete_keypair", name)?;
        let key = (account.as_str().to_string(), name.to_string());
        match state.keypairs.remove(&key) {
            Some(_) => Ok(()),
            None => Err(ApiError::not_found(format!("keypair {name}"))),
        }
    }
}

#[async_trait]
impl ImageApi for DeterministicCloud {
    async fn create_image(&self, account: &AccountId, name: &str) -> Result<Image, ApiError> {
        let mut state = self.state.lock().await;
        state.note("create_image", name)?;
        let id = state.next_id("img");
        let image = Image {
            id: id.clone(),
            name: name.to_string(),
            owner: account.clone(),
            status: ImageStatus::Queued,
            source_server_id: None,
            metadata: BTreeMap::new(),
        };
        state.images.insert(id, image.clone());
        Ok(image)
    }

    async fn show_image(&self, _account: &AccountId, id: &str) -> Result<Image, ApiError> {
        let mut state = self.state.lock().await;
        state.note("show_image", id)?;
        let image = state
            .images
            .get_mut(id)
            .ok_or_else(|| ApiError::not_found(format!("image {id}")))?;
        image.status = image.status.settled();
        Ok(image.clone())
    }

    async fn list_image_metadata(&self, _account: &AccountId, id: &str) -> Result<BTreeMap<String, String>, ApiError> {
        let mut state = self.state.lock().await;
        state.note("list_image_metadata", id)?;
        state
            .images
            .get(id)
            .map(|i| i.metadata.clone())
            .ok_or_else(|| ApiError::not_found(format!("image {id}")))
    }

    async fn update_image(&self, account: &AccountId, id: &str, name: &str) -> Result<Image, ApiError> {
        let mut state = self.state.lock().await;
        state.note("update_image", id)?;
        let image = state.image_owned_mut(account, id, "update")?;
        image.name = name.to_string();
        Ok(image.clone())
    }

    async fn delete_image(&self, account: &AccountId, id: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock().await;
        state.note("delete_image", id)?;
        state.image_owned_mut(account, id, "delete")?;
        state.images.remove(id);
        Ok(())
    }
}

#[async_trait]
impl VolumeApi for DeterministicCloud {
    async fn create_volume(&self, account: &AccountId, name: &str, size_gb: u32) -> Result<Volume, ApiError> {
        let mut state = self.state.lock().await;
        state.note("create_volume", name)?;
        if size_gb == 0 {
            return Err(ApiError::bad_request("volume size must be at least 1 GB"));
        }
        let id = state.next_id("vol");
        let volume = Volume {
            id: id.clone(),
            name: name.to_string(),
            owner: account.clone(),
            status: VolumeStatus::Creating,
            size_gb,
            attached_to: None,
            metadata: BTreeMap::new(),
        };
        state.volumes.insert(id, volume.clone());
        Ok(volume)
    }

    async fn show_volume(&self, _account: &AccountId, id: &str) -> Result<Volume, ApiError> {
        let mut state = self.state.lock().await;
        state.note("show_volume", id)?;
        let volume = state
            .volumes
            .get_mut(id)
            .ok_or_else(|| ApiError::not_found(format!("volume {id}")))?;
        volume.status = volume.status.settled();
        Ok(volume.clone())
    }

    async fn update_volume(&self, account: &AccountId, id: &str, name: &str) -> Result<Volume, ApiError> {
        let mut state = self.state.lock().await;
        state.note("update_volume", id)?;
        let volume = state.volume_owned_mut(account, id)?;
        volume.name = name.to_string();
        Ok(volume.clone())
    }

    async fn delete_volume(&self, account: &AccountId, id: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock().await;
        state.note("delete_volume", id)?;
        let volume = state.volume_owned_mut(account, id)?;
        if volume.attached_to.is_some() {
            return Err(ApiError::conflict(format!("volume {id} is attached")));
        }
        if state.snapshots.values().any(|s| s.volume_id == id) {
            return Err(ApiError::conflict(format!("volume {id} has snapshots")));
        }
        state.volumes.remove(id);
        Ok(())
    }

    async fn extend_volume(&self, account: &AccountId, id: &str, new_size_gb: u32) -> Result<(), ApiError> {
        let mut state = self.state.lock().await;
        state.note("extend_volume", id)?;
        let volume = state.volume_owned_mut(account, id)?;
        if volume.status != VolumeStatus::Available {
            return Err(ApiError::conflict(format!(
                "volume {id} must be available to extend"
            )));
        }
        if new_size_gb <= volume.size_gb {
            return Err(ApiError::bad_request("new size must be larger than current size"));
        }
        volume.size_gb = new_size_gb;
        Ok(())
    }

    async fn show_volume_metadata(&self, _account: &AccountId, id: &str) -> Result<BTreeMap<String, String>, ApiError> {
        let mut state = self.state.lock().await;
        state.note("show_volume_metadata", id)?;
        state
            .volumes
            .get(id)
            .map(|v| v.metadata.clone())
            .ok_or_else(|| ApiError::not_found(format!("volume {id}")))
    }

    async fn update_volume_metadata(
        &self,
        account: &AccountId,
        id: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<(), ApiError> {
        let mut state = self.state.lock().await;
        state.note("update_volume_metadata", id)?;
        let volume = state.volume_owned_mut(account, id)?;
        volume.metadata.extend(metadata);
        Ok(())
    }

    async fn delete_volume_metadata_item(&self, account: &AccountId, id: &str, key: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock().await;
        state.note("delete_volume_metadata_item", id)?;
        let volume = state.volume_owned_mut(account, id)?;
        volume.metadata.remove(key);
        Ok(())
    }

    async fn attach_volume(
        &self,
        account: &AccountId,
        server_id: &str,
        volume_id: &str,
        device: &str,
    ) -> Result<VolumeAttachment, ApiError> {
        let mut state = self.state.lock().await;
        state.note("attach_volume", volume_id)?;
        let server = state.server_owned_mut(account, server_id, "attach volume to")?;
        require_unlocked(server, "attach volume to")?;
        let volume = state.volume_owned_mut(account, volume_id)?;
        if volume.status != VolumeStatus::Available {
            return Err(ApiError::conflict(format!(
                "volume {volume_id} is not available for attachment"
            )));
        }
        volume.status = VolumeStatus::Attaching;
        volume.attached_to = Some(server_id.to_string());

        let id = state.next_id("att");
        let attachment = VolumeAttachment {
            id: id.clone(),
            server_id: server_id.to_string(),
            volume_id: volume_id.to_string(),
            device: device.to_string(),
        };
        state.attachments.insert(id, attachment.clone());
        Ok(attachment)
    }

    async fn detach_volume(&self, account: &AccountId, attachment_id: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock().await;
        state.note("detach_volume", attachment_id)?;
        let attachment = state.attachment_owned(account, attachment_id)?;
        state.attachments.remove(attachment_id);
        if let Some(volume) = state.volumes.get_mut(&attachment.volume_id) {
            volume.status = VolumeStatus::Detaching;
            volume.attached_to = None;
        }
        Ok(())
    }

    async fn update_attachment(&self, account: &AccountId, attachment_id: &str, device: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock().await;
        state.note("update_attachment", attachment_id)?;
        state.attachment_owned(account, attachment_id)?;
        if let Some(attachment) = state.attachments.get_mut(attachment_id) {
            attachment.device = device.to_string();
        }
        Ok(())
    }

    async fn create_volume_snapshot(
        &self,
        account: &AccountId,
        volume_id: &str,
        name: &str,
    ) -> Result<VolumeSnapshot, ApiError> {
        let mut state = self.state.lock().await;
        state.note("create_volume_snapshot", volume_id)?;
        state.volume_owned_mut(account, volume_id)?;
        let id = state.next_id("snap");
        let snapshot = VolumeSnapshot {
            id: id.clone(),
            name: name.to_string(),
            owner: account.clone(),
            volume_id: volume_id.to_string(),
        };
        state.snapshots.insert(id, snapshot.clone());
        Ok(snapshot)
    }

    async fn show_volume_snapshot(&self, account: &AccountId, id: &str) -> Result<VolumeSnapshot, ApiError> {
        let mut state = self.state.lock().await;
        state.note("show_volume_snapshot", id)?;
        state.snapshot_owned_mut(account, id).map(|s| s.clone())
    }

    async fn update_volume_snapshot(
        &self,
        account: &AccountId,
        id: &str,
        name: &str,
    ) -> Result<VolumeSnapshot, ApiError> {
        let mut state = self.state.lock().await;
        state.note("update_volume_snapshot", id)?;
        let snapshot = state.snapshot_owned_mut(account, id)?;
        snapshot.name = name.to_string();
        Ok(snapshot.clone())
    }

    async fn delete_volume_snapshot(&self, account: &AccountId, id: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock().await;
        state.note("delete_volume_snapshot", id)?;
        // Deletion is refused, not hidden: the volume service checks the
        // policy before the ownership filter on this path.
        match state.snapshots.get(id) {
            None => Err(ApiError::not_found(format!("snapshot {id}"))),
            Some(s) if s.owner != *account => Err(ApiError::forbidden(format!("delete snapshot {id}"))),
            Some(_) => {
                state.snapshots.remove(id);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl NetworkApi for DeterministicCloud {
    async fn create_security_group(
        &self,
        account: &AccountId,
        name: &str,
        description: &str,
    ) -> Result<SecurityGroup, ApiError> {
        let mut state = self.state.lock().await;
        state.note("create_security_group", name)?;
        let id = state.next_id("sg");
        let group = SecurityGroup {
            id: id.clone(),
            name: name.to_string(),
            owner: account.clone(),
            description: description.to_string(),
        };
        state.security_groups.insert(id, group.clone());
        Ok(group)
    }

    async fn show_security_group(&self, _account: &AccountId, id: &str) -> Result<SecurityGroup, ApiError> {
        let mut state = self.state.lock().await;
        state.note("show_security_group", id)?;
        state
            .security_groups
            .get(id)
            .cloned()
            .ok_or_else(|| ApiError::not_found(format!("security group {id}")))
    }

    async fn delete_security_group(&self, account: &AccountId, id: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock().await;
        state.note("delete_security_group", id)?;
        match state.security_groups.get(id) {
            None => Err(ApiError::not_found(format!("security group {id}"))),
            Some(g) if g.owner != *account => Err(ApiError::forbidden(format!("delete security group {id}"))),
            Some(_) => {
                state.security_groups.remove(id);
                state.rules.retain(|_, rule| rule.security_group_id != id);
                Ok(())
            }
        }
    }

    async fn create_security_group_rule(
        &self,
        account: &AccountId,
        group_id: &str,
        protocol: &str,
        from_port: u16,
        to_port: u16,
    ) -> Result<SecurityGroupRule, ApiError> {
        let mut state = self.state.lock().await;
        state.note("create_security_group_rule", group_id)?;
        match state.security_groups.get(group_id) {
            None => return Err(ApiError::not_found(format!("security group {group_id}"))),
            Some(g) if g.owner != *account => {
                return Err(ApiError::forbidden(format!("add rule to security group {group_id}")));
            }
            Some(_) => {}
        }
        let id = state.next_id("rule");
        let rule = SecurityGroupRule {
            id: id.clone(),
            security_group_id: group_id.to_string(),
            owner: account.clone(),
            protocol: protocol.to_string(),
            from_port,
            to_port,
        };
        state.rules.insert(id, rule.clone());
        Ok(rule)
    }

    async fn delete_security_group_rule(&self, account: &AccountId, rule_id: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock().await;
        state.note("delete_security_group_rule", rule_id)?;
        match state.rules.get(rule_id) {
            None => Err(ApiError::not_found(format!("security group rule {rule_id}"))),
            Some(r) if r.owner != *account => {
                Err(ApiError::forbidden(format!("delete security group rule {rule_id}")))
            }
            Some(_) => {
                state.rules.remove(rule_id);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::ApiErrorKind;

    fn alice() -> AccountId {
        AccountId::new("alice")
    }

    fn bob() -> AccountId {
        AccountId::new("bob")
    }

    async fn boot_active_server(cloud: &DeterministicCloud, account: &AccountId) -> Server {
        let server = cloud
            .create_server(
                account,
                ServerCreateOpts {
                    name: "fixture".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        // First show settles BUILD into ACTIVE.
        cloud.show_server(account, &server.id).await.unwrap()
    }

    #[tokio::test]
    async fn statuses_settle_on_show() {
        let cloud = DeterministicCloud::new();
        let server = cloud
            .create_server(
                &alice(),
                ServerCreateOpts {
                    name: "s".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(server.status, ServerStatus::Build);

        let shown = cloud.show_server(&alice(), &server.id).await.unwrap();
        assert_eq!(shown.status, ServerStatus::Active);
    }

    #[tokio::test]
    async fn foreign_server_is_readable_but_not_mutable() {
        let cloud = DeterministicCloud::new();
        let server = boot_active_server(&cloud, &alice()).await;

        let shown = cloud.show_server(&bob(), &server.id).await.unwrap();
        assert_eq!(shown.id, server.id);

        let err = cloud.delete_server(&bob(), &server.id).await.unwrap_err();
        assert_eq!(err.kind(), ApiErrorKind::Forbidden);
        let err = cloud.reboot_server(&bob(), &server.id).await.unwrap_err();
        assert_eq!(err.kind(), ApiErrorKind::Forbidden);
        let err = cloud.list_server_metadata(&bob(), &server.id).await.unwrap_err();
        assert_eq!(err.kind(), ApiErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn locked_server_refuses_mutations_until_unlocked() {
        let cloud = DeterministicCloud::new();
        let server = boot_active_server(&cloud, &alice()).await;
        cloud.lock_server(&alice(), &server.id).await.unwrap();

        let err = cloud.reboot_server(&alice(), &server.id).await.unwrap_err();
        assert_eq!(err.kind(), ApiErrorKind::Conflict);
        let err = cloud.delete_server(&alice(), &server.id).await.unwrap_err();
        assert_eq!(err.kind(), ApiErrorKind::Conflict);
        let err = cloud
            .set_server_metadata_item(&alice(), &server.id, "k", "v")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ApiErrorKind::Conflict);

        // Shows are unaffected, and unlock restores the mutations.
        cloud.show_server(&alice(), &server.id).await.unwrap();
        cloud.unlock_server(&alice(), &server.id).await.unwrap();
        cloud.reboot_server(&alice(), &server.id).await.unwrap();
    }

    #[tokio::test]
    async fn lock_does_not_shadow_the_ownership_refusal() {
        let cloud = DeterministicCloud::new();
        let server = boot_active_server(&cloud, &alice()).await;
        cloud.lock_server(&alice(), &server.id).await.unwrap();

        // A foreign caller is refused for ownership, not told about the lock.
        let err = cloud.reboot_server(&bob(), &server.id).await.unwrap_err();
        assert_eq!(err.kind(), ApiErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn keypairs_are_namespaced_per_account() {
        let cloud = DeterministicCloud::new();
        cloud.create_keypair(&alice(), "kp").await.unwrap();

        let err = cloud.show_keypair(&bob(), "kp").await.unwrap_err();
        assert_eq!(err.kind(), ApiErrorKind::NotFound);
        let err = cloud.delete_keypair(&bob(), "kp").await.unwrap_err();
        assert_eq!(err.kind(), ApiErrorKind::NotFound);

        // The owner still sees it.
        cloud.show_keypair(&alice(), "kp").await.unwrap();
    }

    #[tokio::test]
    async fn foreign_volumes_are_hidden_for_mutation_only() {
        let cloud = DeterministicCloud::new();
        let volume = cloud.create_volume(&alice(), "v", 1).await.unwrap();

        // Reads work across accounts.
        cloud.show_volume(&bob(), &volume.id).await.unwrap();
        cloud.show_volume_metadata(&bob(), &volume.id).await.unwrap();

        // Mutations see nothing.
        let err = cloud.delete_volume(&bob(), &volume.id).await.unwrap_err();
        assert_eq!(err.kind(), ApiErrorKind::NotFound);
        let err = cloud.update_volume(&bob(), &volume.id, "x").await.unwrap_err();
        assert_eq!(err.kind(), ApiErrorKind::NotFound);
    }

    #[tokio::test]
    async fn foreign_snapshot_delete_is_refused_not_hidden() {
        let cloud = DeterministicCloud::new();
        let volume = cloud.create_volume(&alice(), "v", 1).await.unwrap();
        let snapshot = cloud.create_volume_snapshot(&alice(), &volume.id, "s").await.unwrap();

        let err = cloud.show_volume_snapshot(&bob(), &snapshot.id).await.unwrap_err();
        assert_eq!(err.kind(), ApiErrorKind::NotFound);
        let err = cloud.delete_volume_snapshot(&bob(), &snapshot.id).await.unwrap_err();
        assert_eq!(err.kind(), ApiErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn booting_from_foreign_images_fails_by_kind_of_image() {
        let cloud = DeterministicCloud::new();
        let server = boot_active_server(&cloud, &alice()).await;
        let plain = cloud.create_image(&alice(), "plain").await.unwrap();
        let snap = cloud.snapshot_server(&alice(), &server.id, "snap").await.unwrap();

        let opts = |image_id: &str| ServerCreateOpts {
            name: "booted".into(),
            image_id: Some(image_id.to_string()),
            ..Default::default()
        };

        let err = cloud.create_server(&bob(), opts(&plain.id)).await.unwrap_err();
        assert_eq!(err.kind(), ApiErrorKind::BadRequest);

        let err = cloud.create_server(&bob(), opts(&snap.id)).await.unwrap_err();
        assert_eq!(err.kind(), ApiErrorKind::ServerFault);

        let err = cloud.create_server(&bob(), opts("img-missing")).await.unwrap_err();
        assert_eq!(err.kind(), ApiErrorKind::BadRequest);

        // The owner can boot from both.
        cloud.create_server(&alice(), opts(&plain.id)).await.unwrap();
        cloud.create_server(&alice(), opts(&snap.id)).await.unwrap();
    }

    #[tokio::test]
    async fn volume_deletion_respects_dependents() {
        let cloud = DeterministicCloud::new();
        let server = boot_active_server(&cloud, &alice()).await;
        let volume = cloud.create_volume(&alice(), "v", 1).await.unwrap();
        cloud.show_volume(&alice(), &volume.id).await.unwrap(); // settle to available

        let attachment = cloud
            .attach_volume(&alice(), &server.id, &volume.id, "/dev/vdb")
            .await
            .unwrap();
        let err = cloud.delete_volume(&alice(), &volume.id).await.unwrap_err();
        assert_eq!(err.kind(), ApiErrorKind::Conflict);

        cloud.detach_volume(&alice(), &attachment.id).await.unwrap();

        let snapshot = cloud.create_volume_snapshot(&alice(), &volume.id, "s").await.unwrap();
        let err = cloud.delete_volume(&alice(), &volume.id).await.unwrap_err();
        assert_eq!(err.kind(), ApiErrorKind::Conflict);

        cloud.delete_volume_snapshot(&alice(), &snapshot.id).await.unwrap();
        cloud.delete_volume(&alice(), &volume.id).await.unwrap();
    }

    #[tokio::test]
    async fn wrong_state_actions_conflict() {
        let cloud = DeterministicCloud::new();
        let server = boot_active_server(&cloud, &alice()).await;

        // Starting an already-running server is a state conflict.
        let err = cloud.start_server(&alice(), &server.id).await.unwrap_err();
        assert_eq!(err.kind(), ApiErrorKind::Conflict);

        cloud.pause_server(&alice(), &server.id).await.unwrap();
        let err = cloud.pause_server(&alice(), &server.id).await.unwrap_err();
        assert_eq!(err.kind(), ApiErrorKind::Conflict);
        cloud.unpause_server(&alice(), &server.id).await.unwrap();
    }

    #[tokio::test]
    async fn injected_fault_fires_once() {
        let cloud = DeterministicCloud::new();
        let volume = cloud.create_volume(&alice(), "v", 1).await.unwrap();

        cloud
            .fail_next("update_volume", ApiError::server_fault("injected"))
            .await;
        let err = cloud.update_volume(&alice(), &volume.id, "x").await.unwrap_err();
        assert_eq!(err.kind(), ApiErrorKind::ServerFault);

        // Next call goes through.
        cloud.update_volume(&alice(), &volume.id, "y").await.unwrap();
    }

    #[tokio::test]
    async fn operation_log_records_failed_attempts() {
        let cloud = DeterministicCloud::new();
        let volume = cloud.create_volume(&alice(), "v", 1).await.unwrap();

        let _ = cloud.delete_volume(&bob(), &volume.id).await;
        let ops = cloud.operations().await;
        assert!(ops.contains(&format!("delete_volume:{}", volume.id)));
    }

    #[tokio::test]
    async fn deleting_server_severs_attachments() {
        let cloud = DeterministicCloud::new();
        let server = boot_active_server(&cloud, &alice()).await;
        let volume = cloud.create_volume(&alice(), "v", 1).await.unwrap();
        cloud.show_volume(&alice(), &volume.id).await.unwrap();
        cloud
            .attach_volume(&alice(), &server.id, &volume.id, "/dev/vdb")
            .await
            .unwrap();

        cloud.delete_server(&alice(), &server.id).await.unwrap();
        let volume = cloud.show_volume(&alice(), &volume.id).await.unwrap();
        assert_eq!(volume.attached_to, None);
        assert_eq!(volume.status, VolumeStatus::Available);
    }
}
