//! The cloud API surface the isolation checks exercise.
//!
//! Four traits slice the surface the way the cloud does: compute (servers,
//! keypairs), image, volume, and network (security groups). Every call
//! carries the caller's [`AccountId`]; the errors a call returns for a
//! foreign account's resource are the subject under test.
//!
//! [`DeterministicCloud`] is the in-memory implementation used by the
//! roles and the test suites.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

pub mod inmemory;
pub mod types;
pub mod waiters;

pub use inmemory::DeterministicCloud;
pub use types::AccountId;
pub use types::Image;
pub use types::ImageStatus;
pub use types::Keypair;
pub use types::SecurityGroup;
pub use types::SecurityGroupRule;
pub use types::Server;
pub use types::ServerCreateOpts;
pub use types::ServerStatus;
pub use types::Volume;
pub use types::VolumeAttachment;
pub use types::VolumeSnapshot;
pub use types::VolumeStatus;

/// Error surface of the cloud APIs.
///
/// These are the outcomes the isolation checks assert on, so the type is
/// comparable and cheap to clone. Which variant a foreign-account call
/// must produce is a per-operation contract, not a global rule.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// The caller is authenticated but not allowed to act on the resource.
    #[error("forbidden: {action}")]
    Forbidden { action: String },
    /// The resource does not exist, or the API hides its existence.
    #[error("not found: {resource}")]
    NotFound { resource: String },
    /// The request was rejected at validation.
    #[error("bad request: {reason}")]
    BadRequest { reason: String },
    /// The request conflicts with the resource's current state.
    #[error("conflict: {reason}")]
    Conflict { reason: String },
    /// The API failed internally while handling the request.
    #[error("server fault: {reason}")]
    ServerFault { reason: String },
}

impl ApiError {
    pub fn forbidden(action: impl Into<String>) -> Self {
        ApiError::Forbidden { action: action.into() }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        ApiError::NotFound {
            resource: resource.into(),
        }
    }

    pub fn bad_request(reason: impl Into<String>) -> Self {
        ApiError::BadRequest { reason: reason.into() }
    }

    pub fn conflict(reason: impl Into<String>) -> Self {
        ApiError::Conflict { reason: reason.into() }
    }

    pub fn server_fault(reason: impl Into<String>) -> Self {
        ApiError::ServerFault { reason: reason.into() }
    }

    /// The kind of this error, dropping the message payload.
    pub fn kind(&self) -> ApiErrorKind {
        match self {
            ApiError::Forbidden { .. } => ApiErrorKind::Forbidden,
            ApiError::NotFound { .. } => ApiErrorKind::NotFound,
            ApiError::BadRequest { .. } => ApiErrorKind::BadRequest,
            ApiError::Conflict { .. } => ApiErrorKind::Conflict,
            ApiError::ServerFault { .. } => ApiErrorKind::ServerFault,
        }
    }
}

/// The kind of an [`ApiError`], without its message payload.
///
/// Expectations in the check catalog compare kinds, and configuration
/// overrides name them in snake_case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiErrorKind {
    Forbidden,
    NotFound,
    BadRequest,
    Conflict,
    ServerFault,
}

impl std::fmt::Display for ApiErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ApiErrorKind::Forbidden => "forbidden",
            ApiErrorKind::NotFound => "not_found",
            ApiErrorKind::BadRequest => "bad_request",
            ApiErrorKind::Conflict => "conflict",
            ApiErrorKind::ServerFault => "server_fault",
        };
        write!(f, "{s}")
    }
}

/// Compute API: servers, their actions and metadata, and keypairs.
#[async_trait]
pub trait ComputeApi: Send + Sync {
    async fn create_server(&self, account: &AccountId, opts: ServerCreateOpts) -> Result<Server, ApiError>;
    async fn show_server(&self, account: &AccountId, id: &str) -> Result<Server, ApiError>;
    async fn update_server_name(&self, account: &AccountId, id: &str, name: &str) -> Result<Server, ApiError>;
    async fn delete_server(&self, account: &AccountId, id: &str) -> Result<(), ApiError>;

    async fn list_server_metadata(
        &self,
        account: &AccountId,
        id: &str,
    ) -> Result<BTreeMap<String, String>, ApiError>;
    async fn set_server_metadata_item(
        &self,
        account: &AccountId,
        id: &str,
        key: &str,
        value: &str,
    ) -> Result<(), ApiError>;
    async fn delete_server_metadata_item(&self, account: &AccountId, id: &str, key: &str) -> Result<(), ApiError>;

    async fn change_password(&self, account: &AccountId, id: &str, password: &str) -> Result<(), ApiError>;
    async fn console_output(&self, account: &AccountId, id: &str, lines: u32) -> Result<String, ApiError>;

    async fn reboot_server(&self, account: &AccountId, id: &str) -> Result<(), ApiError>;
    async fn rebuild_server(&self, account: &AccountId, id: &str) -> Result<(), ApiError>;
    async fn resize_server(&self, account: &AccountId, id: &str, flavor: &str) -> Result<(), ApiError>;
    async fn start_server(&self, account: &AccountId, id: &str) -> Result<(), ApiError>;
    async fn stop_server(&self, account: &AccountId, id: &str) -> Result<(), ApiError>;
    async fn lock_server(&self, account: &AccountId, id: &str) -> Result<(), ApiError>;
    async fn unlock_server(&self, account: &AccountId, id: &str) -> Result<(), ApiError>;
    async fn pause_server(&self, account: &AccountId, id: &str) -> Result<(), ApiError>;
    async fn unpause_server(&self, account: &AccountId, id: &str) -> Result<(), ApiError>;
    async fn suspend_server(&self, account: &AccountId, id: &str) -> Result<(), ApiError>;
    async fn resume_server(&self, account: &AccountId, id: &str) -> Result<(), ApiError>;
    async fn shelve_server(&self, account: &AccountId, id: &str) -> Result<(), ApiError>;
    async fn unshelve_server(&self, account: &AccountId, id: &str) -> Result<(), ApiError>;
    async fn shelve_offload_server(&self, account: &AccountId, id: &str) -> Result<(), ApiError>;

    /// Snapshot a server into a new image owned by `account`.
    async fn snapshot_server(&self, account: &AccountId, id: &str, image_name: &str) -> Result<Image, ApiError>;

    async fn create_keypair(&self, account: &AccountId, name: &str) -> Result<Keypair, ApiError>;
    async fn show_keypair(&self, account: &AccountId, name: &str) -> Result<Keypair, ApiError>;
    async fn delete_keypair(&self, account: &AccountId, name: &str) -> Result<(), ApiError>;
}

/// Image API: show, metadata, mutation, and direct upload.
#[async_trait]
pub trait ImageApi: Send + Sync {
    /// Create an image by direct upload, not tied to any server.
    async fn create_image(&self, account: &AccountId, name: &str) -> Result<Image, ApiError>;
    async fn show_image(&self, account: &AccountId, id: &str) -> Result<Image, ApiError>;
    async fn list_image_metadata(&self, account: &AccountId, id: &str) -> Result<BTreeMap<String, String>, ApiError>;
    async fn update_image(&self, account: &AccountId, id: &str, name: &str) -> Result<Image, ApiError>;
    async fn delete_image(&self, account: &AccountId, id: &str) -> Result<(), ApiError>;
}

/// Volume API: volumes, volume metadata, snapshots, and attachments.
#[async_trait]
pub trait VolumeApi: Send + Sync {
    async fn create_volume(&self, account: &AccountId, name: &str, size_gb: u32) -> Result<Volume, ApiError>;
    async fn show_volume(&self, account: &AccountId, id: &str) -> Result<Volume, ApiError>;
    async fn update_volume(&self, account: &AccountId, id: &str, name: &str) -> Result<Volume, ApiError>;
    async fn delete_volume(&self, account: &AccountId, id: &str) -> Result<(), ApiError>;
    async fn extend_volume(&self, account: &AccountId, id: &str, new_size_gb: u32) -> Result<(), ApiError>;

    async fn show_volume_metadata(
        &self,
        account: &AccountId,
        id: &str,
    ) -> Result<BTreeMap<String, String>, ApiError>;
    async fn update_volume_metadata(
        &self,
        account: &AccountId,
        id: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<(), ApiError>;
    async fn delete_volume_metadata_item(&self, account: &AccountId, id: &str, key: &str) -> Result<(), ApiError>;

    async fn attach_volume(
        &self,
        account: &AccountId,
        server_id: &str,
        volume_id: &str,
        device: &str,
    ) -> Result<VolumeAttachment, ApiError>;
    async fn detach_volume(&self, account: &AccountId, attachment_id: &str) -> Result<(), ApiError>;
    async fn update_attachment(&self, account: &AccountId, attachment_id: &str, device: &str) -> Result<(), ApiError>;

    async fn create_volume_snapshot(
        &self,
        account: &AccountId,
        volume_id: &str,
        name: &str,
    ) -> Result<VolumeSnapshot, ApiError>;
    async fn show_volume_snapshot(&self, account: &AccountId, id: &str) -> Result<VolumeSnapshot, ApiError>;
    async fn update_volume_snapshot(&self, account: &AccountId, id: &str, name: &str)
        -> Result<VolumeSnapshot, ApiError>;
    async fn delete_volume_snapshot(&self, account: &AccountId, id: &str) -> Result<(), ApiError>;
}

/// Network API: security groups and their rules.
#[async_trait]
pub trait NetworkApi: Send + Sync {
    async fn create_security_group(
        &self,
        account: &AccountId,
        name: &str,
        description: &str,
    ) -> Result<SecurityGroup, ApiError>;
    async fn show_security_group(&self, account: &AccountId, id: &str) -> Result<SecurityGroup, ApiError>;
    async fn delete_security_group(&self, account: &AccountId, id: &str) -> Result<(), ApiError>;

    async fn create_security_group_rule(
        &self,
        account: &AccountId,
        group_id: &str,
        protocol: &str,
        from_port: u16,
        to_port: u16,
    ) -> Result<SecurityGroupRule, ApiError>;
    async fn delete_security_group_rule(&self, account: &AccountId, rule_id: &str) -> Result<(), ApiError>;
}

/// The whole surface the roles need, as one bound.
pub trait CloudApi: ComputeApi + ImageApi + VolumeApi + NetworkApi {}

impl<T: ComputeApi + ImageApi + VolumeApi + NetworkApi> CloudApi for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_drop_payload() {
        assert_eq!(ApiError::forbidden("delete server").kind(), ApiErrorKind::Forbidden);
        assert_eq!(ApiError::not_found("volume v1").kind(), ApiErrorKind::NotFound);
        assert_eq!(ApiError::server_fault("boom").kind(), ApiErrorKind::ServerFault);
    }

    #[test]
    fn error_kind_names_match_config_spelling() {
        let kind: ApiErrorKind = serde_json::from_str("\"forbidden\"").unwrap();
        assert_eq!(kind, ApiErrorKind::Forbidden);
        let kind: ApiErrorKind = serde_json::from_str("\"server_fault\"").unwrap();
        assert_eq!(kind, ApiErrorKind::ServerFault);
        assert_eq!(serde_json::to_string(&ApiErrorKind::NotFound).unwrap(), "\"not_found\"");
    }
}
