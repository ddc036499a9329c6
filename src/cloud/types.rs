//! Resource descriptors for the cloud API surface.
//!
//! These mirror the slices of the compute, image, volume, and network APIs
//! the isolation checks exercise. Everything is referenced by opaque string
//! identifier; the cloud owns all state.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

/// A tenant account identity.
///
/// Every API call carries the caller's account; ownership checks compare
/// it against the owner recorded at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountId(pub String);

impl AccountId {
    /// Create an account identity.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The raw account name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerStatus {
    Build,
    Active,
    Reboot,
    Rebuild,
    Resize,
    Shutoff,
    Paused,
    Suspended,
    Shelved,
    ShelvedOffloaded,
    Error,
}

impl ServerStatus {
    /// The status a transitional state settles into.
    ///
    /// Returns `self` for stable states.
    pub fn settled(self) -> Self {
        match self {
            ServerStatus::Build
            | ServerStatus::Reboot
            | ServerStatus::Rebuild
            | ServerStatus::Resize => ServerStatus::Active,
            other => other,
        }
    }
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServerStatus::Build => "BUILD",
            ServerStatus::Active => "ACTIVE",
            ServerStatus::Reboot => "REBOOT",
            ServerStatus::Rebuild => "REBUILD",
            ServerStatus::Resize => "RESIZE",
            ServerStatus::Shutoff => "SHUTOFF",
            ServerStatus::Paused => "PAUSED",
            ServerStatus::Suspended => "SUSPENDED",
            ServerStatus::Shelved => "SHELVED",
            ServerStatus::ShelvedOffloaded => "SHELVED_OFFLOADED",
            ServerStatus::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

/// Image lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImageStatus {
    Queued,
    Saving,
    Active,
}

impl ImageStatus {
    /// The status a transitional state settles into.
    pub fn settled(self) -> Self {
        match self {
            ImageStatus::Queued | ImageStatus::Saving => ImageStatus::Active,
            other => other,
        }
    }
}

/// Volume lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeStatus {
    Creating,
    Available,
    Attaching,
    InUse,
    Detaching,
    Error,
}

impl VolumeStatus {
    /// The status a transitional state settles into.
    pub fn settled(self) -> Self {
        match self {
            VolumeStatus::Creating => VolumeStatus::Available,
            VolumeStatus::Attaching => VolumeStatus::InUse,
            VolumeStatus::Detaching => VolumeStatus::Available,
            other => other,
        }
    }
}

/// A compute server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub id: String,
    pub name: String,
    pub owner: AccountId,
    pub status: ServerStatus,
    /// Image the server was booted from, if any.
    pub image_id: Option<String>,
    /// Keypair injected at boot, if any.
    pub key_name: Option<String>,
    /// Administrative lock flag. While set, mutating actions are refused
    /// with Conflict; shows and unlock still work.
    pub locked: bool,
    pub metadata: BTreeMap<String, String>,
}

/// Options for creating a server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerCreateOpts {
    pub name: String,
    /// Image to boot from. `None` boots the default image.
    pub image_id: Option<String>,
    pub key_name: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

/// An image, either uploaded directly or snapshotted from a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    pub name: String,
    pub owner: AccountId,
    pub status: ImageStatus,
    /// Set when the image is a snapshot of a server.
    pub source_server_id: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

/// An SSH keypair. Keypairs are scoped per account and addressed by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keypair {
    pub name: String,
    pub owner: AccountId,
    pub public_key: String,
}

/// A security group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub id: String,
    pub name: String,
    pub owner: AccountId,
    pub description: String,
}

/// A rule inside a security group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroupRule {
    pub id: String,
    pub security_group_id: String,
    pub owner: AccountId,
    pub protocol: String,
    pub from_port: u16,
    pub to_port: u16,
}

/// A block storage volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub name: String,
    pub owner: AccountId,
    pub status: VolumeStatus,
    pub size_gb: u32,
    /// Server the volume is attached to, if any.
    pub attached_to: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

/// A point-in-time snapshot of a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSnapshot {
    pub id: String,
    pub name: String,
    pub owner: AccountId,
    pub volume_id: String,
}

/// An attachment linking a volume to a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeAttachment {
    pub id: String,
    pub server_id: String,
    pub volume_id: String,
    /// Device node the volume is exposed as, e.g. `/dev/vdb`.
    pub device: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitional_statuses_settle_to_stable_ones() {
        assert_eq!(ServerStatus::Build.settled(), ServerStatus::Active);
        assert_eq!(ServerStatus::Reboot.settled(), ServerStatus::Active);
        assert_eq!(ServerStatus::Shutoff.settled(), ServerStatus::Shutoff);
        assert_eq!(ImageStatus::Queued.settled(), ImageStatus::Active);
        assert_eq!(VolumeStatus::Creating.settled(), VolumeStatus::Available);
        assert_eq!(VolumeStatus::Attaching.settled(), VolumeStatus::InUse);
        assert_eq!(VolumeStatus::InUse.settled(), VolumeStatus::InUse);
    }

    #[test]
    fn server_status_serializes_in_wire_case() {
        let json = serde_json::to_string(&ServerStatus::ShelvedOffloaded).unwrap();
        assert_eq!(json, "\"SHELVED_OFFLOADED\"");
        let json = serde_json::to_string(&VolumeStatus::InUse).unwrap();
        assert_eq!(json, "\"in-use\"");
    }
}
