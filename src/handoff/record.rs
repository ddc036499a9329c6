//! Fixture record handed from the setup role to the run role.
//!
//! Serialized as JSON for human readability and debugging. Field names are
//! stable: independently built readers key on them, so renaming a field is
//! a wire-format break.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

/// Identifier and display name of a provisioned resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceRef {
    /// Opaque identifier assigned by the cloud.
    pub id: String,
    /// Display name chosen at provisioning time.
    pub name: String,
}

impl ResourceRef {
    /// Create a resource reference.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// A security group rule, addressed within its parent group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleRef {
    /// Rule identifier.
    pub id: String,
    /// Identifier of the group the rule belongs to.
    pub security_group_id: String,
}

/// A volume attachment, linking a volume to a server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttachmentRef {
    /// Attachment identifier.
    pub id: String,
    /// Server the volume is attached to.
    pub server_id: String,
    /// The attached volume.
    pub volume_id: String,
}

/// The record published by the setup role and consumed by the run role.
///
/// Created only after every provisioning call succeeded; immutable once
/// written. Optional fields are omitted when the corresponding service or
/// feature was unavailable at provisioning time, and the run role skips
/// the checks that would need them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FixtureRecord {
    /// Identifier of the run that published this record.
    pub run_id: String,
    /// The server every other resource hangs off.
    pub server: ResourceRef,
    /// Image created from the server, when the image service is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ResourceRef>,
    /// Snapshot image of the server, when server snapshotting is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_snapshot: Option<ResourceRef>,
    /// Keypair name. Keypairs are addressed by name, not id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keypairname: Option<String>,
    /// Security group created for the handoff.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_group: Option<ResourceRef>,
    /// Rule created inside `security_group`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<RuleRef>,
    /// First volume, when the volume service is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume1: Option<ResourceRef>,
    /// Second volume, attached to `server`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume2: Option<ResourceRef>,
    /// Snapshot of `volume1`, when volume snapshotting is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vol_snapshot: Option<ResourceRef>,
    /// Attachment of `volume2` to `server`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentRef>,
    /// Metadata stamped on the server at provisioning time.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl FixtureRecord {
    /// Create a minimal record holding only the server reference.
    ///
    /// The setup role fills the remaining fields as provisioning steps
    /// succeed.
    pub fn new(run_id: impl Into<String>, server: ResourceRef) -> Self {
        Self {
            run_id: run_id.into(),
            server,
            image: None,
            server_snapshot: None,
            keypairname: None,
            security_group: None,
            rule: None,
            volume1: None,
            volume2: None,
            vol_snapshot: None,
            attachment: None,
            metadata: BTreeMap::new(),
        }
    }
}
