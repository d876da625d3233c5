//! Persisted agent state.
//!
//! A small schema-versioned JSON document under the data root recording
//! the last version tracked per module. The binaries themselves are
//! authoritative (the tracker is rebuilt from actual loads on boot);
//! this file survives modules that fail to load and feeds the CLI's
//! `status` view.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tracker::VersionTracker;

/// Current state schema version
pub const CURRENT_STATE_VERSION: &str = "airlift.state.v1";

pub const STATE_FILE: &str = "state.json";

pub fn state_path(data_dir: &Path) -> PathBuf {
    data_dir.join(STATE_FILE)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackedModule {
    pub version: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentState {
    pub state_version: String,
    pub device_id: String,
    pub updated_at: DateTime<Utc>,
    pub modules: BTreeMap<String, TrackedModule>,
}

impl AgentState {
    /// Snapshot the tracker into a persistable document.
    pub fn from_tracker(device_id: &str, tracker: &VersionTracker) -> Self {
        let now = Utc::now();
        let modules = tracker
            .iter()
            .map(|(name, version)| {
                (
                    name.to_string(),
                    TrackedModule {
                        version: version.to_string(),
                        updated_at: now,
                    },
                )
            })
            .collect();

        Self {
            state_version: CURRENT_STATE_VERSION.to_string(),
            device_id: device_id.to_string(),
            updated_at: now,
            modules,
        }
    }
}

pub fn load_state(data_dir: &Path) -> Result<Option<AgentState>> {
    let path = state_path(data_dir);
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&path)
        .with_context(|| format!("failed to read state file {}", path.display()))?;
    let state: AgentState = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse state JSON {}", path.display()))?;
    if state.state_version != CURRENT_STATE_VERSION {
        anyhow::bail!(
            "unsupported state version {} in {}",
            state.state_version,
            path.display()
        );
    }
    Ok(Some(state))
}

pub fn save_state(data_dir: &Path, state: &AgentState) -> Result<()> {
    fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;

    atomic_write_json(&state_path(data_dir), state)
}

pub fn clear_state(data_dir: &Path) -> Result<()> {
    let path = state_path(data_dir);
    if path.exists() {
        fs::remove_file(&path)
            .with_context(|| format!("failed to remove state file {}", path.display()))?;
    }
    Ok(())
}

/// Write JSON durably via a temp file and rename so a crashed write
/// never leaves a torn document.
fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value).context("failed to serialize state JSON")?;

    let tmp = path.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&tmp)
            .with_context(|| format!("failed to create temp file {}", tmp.display()))?;
        file.write_all(&json)
            .with_context(|| format!("failed to write temp file {}", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to sync temp file {}", tmp.display()))?;
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to publish state file {}", path.display()))?;
    Ok(())
}
