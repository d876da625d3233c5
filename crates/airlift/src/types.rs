use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use airlift_semver::SemVer;

pub use airlift_retry::ErrorClass;

/// Deserialize a Duration from either a string (human-readable) or u64 (milliseconds)
pub(crate) fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        U64(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {}", e))),
        DurationHelper::U64(ms) => Ok(Duration::from_millis(ms)),
    }
}

/// Serialize a Duration as milliseconds (u64) so it roundtrips with deserialize_duration
pub(crate) fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// User-visible agent status, emitted through [`crate::orchestrator::Host::set_status`].
///
/// The host owns the rendering (LED patterns, display lines) and any
/// hold timing; the agent only reports transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Idle,
    CheckingUpdates,
    UpdateAvailable,
    Downloading,
    /// Post-commit apply window: the old module is gone and the new one
    /// is not yet live, so the host should avoid power interruptions.
    DownloadingFast,
    Applying,
    Success,
    Failure,
    Error,
}

/// Severity for lines handed to the host's log sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

/// Update priority carried by a manifest entry.
///
/// Variant order matters: `Critical` sorts greatest so pending updates
/// drain critical-first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    Critical,
}

/// One update the orchestrator has decided to perform, created during
/// manifest diff and cleared on success, failure, or cancellation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingUpdate {
    pub name: String,
    /// Tracked version at diff time; `None` for a first-time install.
    pub from: Option<SemVer>,
    pub to: SemVer,
    /// Expected content digest, lowercase hex, from the manifest. The
    /// manifest is the sole source of verification inputs.
    pub sha256: String,
    pub file_size: u64,
    /// Base64 signature over the digest, when the catalog signs.
    pub signature: Option<String>,
    pub priority: Priority,
}

impl PendingUpdate {
    /// Queue order: higher priority first, ties broken by name.
    pub fn queue_key(&self) -> (std::cmp::Reverse<Priority>, String) {
        (std::cmp::Reverse(self.priority), self.name.clone())
    }
}

/// Terminal state of one update cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum UpdateState {
    Applied {
        version: String,
    },
    RolledBack {
        /// Version restored from backup, when the reload from backup
        /// succeeded.
        restored: Option<String>,
        message: String,
    },
    Failed {
        class: ErrorClass,
        message: String,
    },
    Cancelled {
        reason: String,
    },
}

/// Evidence for one download attempt within an update cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptEvidence {
    pub attempt: u32,
    pub error: String,
    pub delay_before_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Audit record for one completed update cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateReceipt {
    pub module: String,
    pub from: Option<String>,
    pub to: String,
    pub state: UpdateState,
    pub attempts: Vec<AttemptEvidence>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}
