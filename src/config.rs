//! Layered configuration for the harness.
//!
//! Values come from three layers with sensible defaults: built-in defaults,
//! environment variables (`BULKHEAD_*`), and an optional TOML file. The
//! file wins over the environment when one is given on the command line.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::checks::catalog::default_expectations;
use crate::checks::Expectation;
use crate::cloud::waiters::WaitConfig;
use crate::handoff::StoreConfig;

/// Default values for configuration
mod defaults {
    use std::path::PathBuf;

    pub fn store_dir() -> PathBuf {
        std::env::temp_dir()
    }
    pub fn store_prefix() -> String {
        "bulkhead-fixture".to_string()
    }
    pub fn run_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    // Timing defaults (milliseconds)
    pub fn fixture_timeout_ms() -> u64 {
        60_000
    }
    pub fn release_timeout_ms() -> u64 {
        120_000
    }
    pub fn poll_interval_ms() -> u64 {
        500
    }
    pub fn status_timeout_ms() -> u64 {
        30_000
    }
    pub fn status_poll_interval_ms() -> u64 {
        200
    }
    pub fn scrub_max_age_ms() -> u64 {
        3_600_000
    }

    // Feature defaults
    pub fn service_enabled() -> bool {
        true
    }

    // Account defaults
    pub fn producer_account() -> String {
        "account-a".to_string()
    }
    pub fn consumer_account() -> String {
        "account-b".to_string()
    }
}

/// Fixture store location and polling bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffConfig {
    /// Directory holding store files.
    #[serde(default = "defaults::store_dir")]
    pub store_dir: PathBuf,
    /// File name prefix shared by all runs of this suite.
    #[serde(default = "defaults::store_prefix")]
    pub store_prefix: String,
    /// Identifier scoping one producer/consumer pairing. Fresh per run by
    /// default; two cooperating processes override it to the same value.
    #[serde(default = "defaults::run_id")]
    pub run_id: String,
    /// Ceiling on the run role's wait for the record to appear.
    #[serde(default = "defaults::fixture_timeout_ms")]
    pub fixture_timeout_ms: u64,
    /// Ceiling on the setup role's wait for the record to disappear.
    #[serde(default = "defaults::release_timeout_ms")]
    pub release_timeout_ms: u64,
    /// Sleep between store existence polls.
    #[serde(default = "defaults::poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Ceiling on each resource status wait during provisioning.
    #[serde(default = "defaults::status_timeout_ms")]
    pub status_timeout_ms: u64,
    /// Base sleep between resource status polls.
    #[serde(default = "defaults::status_poll_interval_ms")]
    pub status_poll_interval_ms: u64,
    /// Age past which `scrub` removes leftover store files.
    #[serde(default = "defaults::scrub_max_age_ms")]
    pub scrub_max_age_ms: u64,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            store_dir: defaults::store_dir(),
            store_prefix: defaults::store_prefix(),
            run_id: defaults::run_id(),
            fixture_timeout_ms: defaults::fixture_timeout_ms(),
            release_timeout_ms: defaults::release_timeout_ms(),
            poll_interval_ms: defaults::poll_interval_ms(),
            status_timeout_ms: defaults::status_timeout_ms(),
            status_poll_interval_ms: defaults::status_poll_interval_ms(),
            scrub_max_age_ms: defaults::scrub_max_age_ms(),
        }
    }
}

impl HandoffConfig {
    /// Load handoff configuration from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(dir) = std::env::var("BULKHEAD_STORE_DIR") {
            config.store_dir = PathBuf::from(dir);
        }
        if let Ok(prefix) = std::env::var("BULKHEAD_STORE_PREFIX") {
            config.store_prefix = prefix;
        }
        if let Ok(run_id) = std::env::var("BULKHEAD_RUN_ID") {
            config.run_id = run_id;
        }
        config.fixture_timeout_ms = env_u64("BULKHEAD_FIXTURE_TIMEOUT_MS", config.fixture_timeout_ms)?;
        config.release_timeout_ms = env_u64("BULKHEAD_RELEASE_TIMEOUT_MS", config.release_timeout_ms)?;
        config.poll_interval_ms = env_u64("BULKHEAD_POLL_INTERVAL_MS", config.poll_interval_ms)?;
        config.status_timeout_ms = env_u64("BULKHEAD_STATUS_TIMEOUT_MS", config.status_timeout_ms)?;
        config.status_poll_interval_ms =
            env_u64("BULKHEAD_STATUS_POLL_INTERVAL_MS", config.status_poll_interval_ms)?;
        config.scrub_max_age_ms = env_u64("BULKHEAD_SCRUB_MAX_AGE_MS", config.scrub_max_age_ms)?;
        Ok(config)
    }

    pub fn fixture_timeout(&self) -> Duration {
        Duration::from_millis(self.fixture_timeout_ms)
    }

    pub fn release_timeout(&self) -> Duration {
        Duration::from_millis(self.release_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn scrub_max_age(&self) -> Duration {
        Duration::from_millis(self.scrub_max_age_ms)
    }

    /// Store polling settings derived from this section.
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            poll_interval_ms: self.poll_interval_ms,
        }
    }

    /// Status-wait settings derived from this section.
    pub fn wait_config(&self) -> WaitConfig {
        WaitConfig {
            timeout_ms: self.status_timeout_ms,
            poll_interval_ms: self.status_poll_interval_ms,
        }
    }
}

/// Which optional cloud services the target exposes.
///
/// A disabled feature skips its provisioning step, its record field, and
/// the checks that would need it (reported as skipped, not failed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudFeatures {
    #[serde(default = "defaults::service_enabled")]
    pub image_service_enabled: bool,
    #[serde(default = "defaults::service_enabled")]
    pub volume_service_enabled: bool,
    #[serde(default = "defaults::service_enabled")]
    pub server_snapshot_enabled: bool,
    #[serde(default = "defaults::service_enabled")]
    pub volume_snapshot_enabled: bool,
}

impl Default for CloudFeatures {
    fn default() -> Self {
        Self {
            image_service_enabled: defaults::service_enabled(),
            volume_service_enabled: defaults::service_enabled(),
            server_snapshot_enabled: defaults::service_enabled(),
            volume_snapshot_enabled: defaults::service_enabled(),
        }
    }
}

impl CloudFeatures {
    /// Load feature flags from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.image_service_enabled = env_bool("BULKHEAD_IMAGE_SERVICE_ENABLED", config.image_service_enabled)?;
        config.volume_service_enabled = env_bool("BULKHEAD_VOLUME_SERVICE_ENABLED", config.volume_service_enabled)?;
        config.server_snapshot_enabled =
            env_bool("BULKHEAD_SERVER_SNAPSHOT_ENABLED", config.server_snapshot_enabled)?;
        config.volume_snapshot_enabled =
            env_bool("BULKHEAD_VOLUME_SNAPSHOT_ENABLED", config.volume_snapshot_enabled)?;
        Ok(config)
    }
}

/// The two account identities the roles act under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Account owning the fixture resources (setup role).
    #[serde(default = "defaults::producer_account")]
    pub producer_account: String,
    /// Account issuing the isolation checks (run role).
    #[serde(default = "defaults::consumer_account")]
    pub consumer_account: String,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            producer_account: defaults::producer_account(),
            consumer_account: defaults::consumer_account(),
        }
    }
}

impl AccountConfig {
    /// Load account identities from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(account) = std::env::var("BULKHEAD_PRODUCER_ACCOUNT") {
            config.producer_account = account;
        }
        if let Ok(account) = std::env::var("BULKHEAD_CONSUMER_ACCOUNT") {
            config.consumer_account = account;
        }
        if config.producer_account == config.consumer_account {
            return Err(ConfigError::InvalidValue {
                key: "BULKHEAD_CONSUMER_ACCOUNT".to_string(),
                value: config.consumer_account,
                reason: "run role must use a different account than the setup role".to_string(),
            });
        }
        Ok(config)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub handoff: HandoffConfig,
    #[serde(default)]
    pub features: CloudFeatures,
    #[serde(default)]
    pub accounts: AccountConfig,
    /// Per-check expectation overrides, by check name. Values use the
    /// spellings of [`Expectation`], e.g. `"forbidden"`, `"not_found"`,
    /// `"forbidden_or_not_found"`, `"succeeds"`.
    #[serde(default)]
    pub expectations: BTreeMap<String, String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Ok(Self {
            handoff: HandoffConfig::load()?,
            features: CloudFeatures::load()?,
            accounts: AccountConfig::load()?,
            expectations: BTreeMap::new(),
        })
    }

    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&text).map_err(|e| match e {
            ConfigError::Parse { reason, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                reason,
            },
            other => other,
        })
    }

    /// Parse configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: "<inline>".to_string(),
            reason: e.to_string(),
        })?;
        if config.accounts.producer_account == config.accounts.consumer_account {
            return Err(ConfigError::InvalidValue {
                key: "accounts.consumer_account".to_string(),
                value: config.accounts.consumer_account,
                reason: "run role must use a different account than the setup role".to_string(),
            });
        }
        Ok(config)
    }

    /// The check catalog defaults with this configuration's overrides
    /// applied.
    pub fn effective_expectations(&self) -> Result<BTreeMap<String, Expectation>, ConfigError> {
        let mut expectations = default_expectations();
        for (name, value) in &self.expectations {
            if !expectations.contains_key(name) {
                return Err(ConfigError::InvalidValue {
                    key: format!("expectations.{name}"),
                    value: value.clone(),
                    reason: "no check with this name exists in the catalog".to_string(),
                });
            }
            let expectation = value.parse::<Expectation>().map_err(|reason| ConfigError::InvalidValue {
                key: format!("expectations.{name}"),
                value: value.clone(),
                reason,
            })?;
            expectations.insert(name.clone(), expectation);
        }
        Ok(expectations)
    }
}

fn env_u64(key: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(value) => value.parse::<u64>().map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            value: std::env::var(key).unwrap_or_default(),
            reason: format!("must be a non-negative integer: {e}"),
        }),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(value) => value.parse::<bool>().map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            value: std::env::var(key).unwrap_or_default(),
            reason: format!("must be 'true' or 'false': {e}"),
        }),
    }
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// A configuration value is invalid
    InvalidValue { key: String, value: String, reason: String },
    /// The configuration file could not be read
    Io { path: String, reason: String },
    /// The configuration file could not be parsed
    Parse { path: String, reason: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue { key, value, reason } => {
                write!(f, "Invalid configuration for {}: '{}' ({})", key, value, reason)
            }
            ConfigError::Io { path, reason } => {
                write!(f, "Cannot read configuration file {}: {}", path, reason)
            }
            ConfigError::Parse { path, reason } => {
                write!(f, "Cannot parse configuration file {}: {}", path, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
