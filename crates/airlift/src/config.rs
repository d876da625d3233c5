//! Agent configuration (`airlift.toml`).
//!
//! One document with nested sections per concern. Required fields live
//! under `[catalog]`; everything else defaults to the values a stock
//! device ships with. Durations accept either human-readable strings
//! (`"30s"`) or integer milliseconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use airlift_retry::BackoffConfig;

use crate::types::{deserialize_duration, serialize_duration};

/// Where the catalog lives and how the device authenticates to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Base URL of the remote catalog, e.g. `https://ota.example.com/fleet-a`.
    pub base_url: String,
    /// Bearer token attached to every catalog request.
    pub bearer_token: String,
    /// Device identifier sent as `x-device-id` so the catalog can scope
    /// rollouts.
    pub device_id: String,
    /// Wall-clock timeout for manifest fetches.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    #[serde(default = "default_manifest_timeout")]
    pub manifest_timeout: Duration,
    /// Wall-clock timeout for artifact fetches.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    #[serde(default = "default_artifact_timeout")]
    pub artifact_timeout: Duration,
}

/// Update cadence and apply behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Interval between manifest checks.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    #[serde(default = "default_check_interval")]
    pub check_interval: Duration,
    /// Upper bound on artifact size in bytes.
    #[serde(default = "default_max_artifact_size")]
    pub max_artifact_size: u64,
    /// Capacity of the module registry.
    #[serde(default = "default_max_modules")]
    pub max_modules: usize,
    /// How long the backup is retained after a successful commit before
    /// it is finalized away.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    #[serde(default = "default_post_commit_grace")]
    pub post_commit_grace: Duration,
    /// How long a failure outcome is held before returning to normal
    /// operation.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    #[serde(default = "default_failure_display")]
    pub failure_display: Duration,
    /// How long the safe-window signal may drop mid-download before the
    /// in-flight update is cancelled.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    #[serde(default = "default_cancel_threshold")]
    pub cancel_threshold: Duration,
    /// Whether critical-priority updates may start without the host's
    /// safe window.
    #[serde(default)]
    pub allow_critical_bypass: bool,
    /// Backoff schedule for artifact download retries.
    #[serde(default)]
    pub download: BackoffConfig,
}

/// Signature policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignatureConfig {
    /// Require every manifest entry to carry a verifiable signature.
    /// Off for dev catalogs, on for production fleets.
    #[serde(default)]
    pub signature_required: bool,
    /// PEM of the RSA public key artifacts are signed under. Required
    /// when `signature_required` is set.
    #[serde(default)]
    pub signing_public_key_pem: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub update: UpdateConfig,
    #[serde(default)]
    pub verify: SignatureConfig,
    /// Root for staged binaries, persisted state, and the event log.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_manifest_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_artifact_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_check_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_max_artifact_size() -> u64 {
    65536
}

fn default_max_modules() -> usize {
    8
}

fn default_post_commit_grace() -> Duration {
    Duration::from_secs(30)
}

fn default_failure_display() -> Duration {
    Duration::from_secs(8)
}

fn default_cancel_threshold() -> Duration {
    Duration::from_secs(5)
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".airlift")
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            check_interval: default_check_interval(),
            max_artifact_size: default_max_artifact_size(),
            max_modules: default_max_modules(),
            post_commit_grace: default_post_commit_grace(),
            failure_display: default_failure_display(),
            cancel_threshold: default_cancel_threshold(),
            allow_critical_bypass: false,
            download: BackoffConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: AgentConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.catalog.base_url.trim().is_empty() {
            bail!("catalog.base_url must not be empty");
        }
        if self.catalog.bearer_token.trim().is_empty() {
            bail!("catalog.bearer_token must not be empty");
        }
        if self.catalog.device_id.trim().is_empty() {
            bail!("catalog.device_id must not be empty");
        }
        if self.update.max_artifact_size == 0 {
            bail!("update.max_artifact_size must be positive");
        }
        if self.update.max_modules == 0 {
            bail!("update.max_modules must be positive");
        }
        if self.verify.signature_required && self.verify.signing_public_key_pem.is_none() {
            bail!("verify.signing_public_key_pem is required when signature_required is set");
        }
        Ok(())
    }
}
