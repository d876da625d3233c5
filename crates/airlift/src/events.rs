//! Append-only JSONL event log for update operations.
//!
//! Every state transition and every error lands here as one line of
//! JSON, alongside the one-line diagnostics the host's log sink gets.
//! The log is the durable audit trail; receipts summarize it per update.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ErrorClass, Priority};

/// Default events file name
pub const EVENTS_FILE: &str = "events.jsonl";

/// Get the events file path for a data directory
pub fn events_path(data_dir: &Path) -> PathBuf {
    data_dir.join(EVENTS_FILE)
}

/// Module label used for agent-wide events.
pub const AGENT_SCOPE: &str = "agent";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateEvent {
    pub timestamp: DateTime<Utc>,
    /// Module name, or [`AGENT_SCOPE`] for agent-wide events.
    pub module: String,
    pub event_type: EventType,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    // Boot events
    AgentStarted {
        recovered: usize,
    },
    CommitRecovered,
    StaleStagingDiscarded,
    ModuleLoadedAtBoot {
        version: String,
    },
    ModuleUnloadable {
        error: String,
    },

    // Check events
    CheckStarted,
    CheckFailed {
        error: String,
    },
    UpdatesQueued {
        count: usize,
    },

    // Update cycle events
    UpdateStarted {
        from: Option<String>,
        to: String,
        priority: Priority,
    },
    DownloadRetried {
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    DownloadFailed {
        error: String,
    },
    VerifyFailed {
        error: String,
    },
    StagingCommitted,
    ModuleReloaded {
        version: String,
    },
    UpdateApplied {
        version: String,
    },
    RolledBack {
        restored: Option<String>,
    },
    ReloadFailedAfterRollback {
        error: String,
    },
    UpdateFailed {
        class: ErrorClass,
        message: String,
    },
    UpdateCancelled {
        reason: String,
    },
    BackupFinalized,
}

/// Append-only event log for update operations.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<UpdateEvent>,
}

impl EventLog {
    /// Create a new empty event log.
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    /// Record a new event.
    pub fn record(&mut self, event: UpdateEvent) {
        self.events.push(event);
    }

    /// Record an event for a module, stamped now.
    pub fn emit(&mut self, module: &str, event_type: EventType) {
        self.record(UpdateEvent {
            timestamp: Utc::now(),
            module: module.to_string(),
            event_type,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Write all recorded events to a file in JSONL format.
    ///
    /// Events are appended to the file if it already exists.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create events dir {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;

        let mut writer = std::io::BufWriter::new(file);

        for event in &self.events {
            let line = serde_json::to_string(event).context("failed to serialize event to JSON")?;
            writeln!(writer, "{}", line).context("failed to write event line")?;
        }

        writer.flush().context("failed to flush events file")?;

        Ok(())
    }

    /// Read all events from a JSONL file.
    pub fn read_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }

        let file = File::open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;

        let reader = BufReader::new(file);
        let mut events = Vec::new();

        for line in reader.lines() {
            let line = line.with_context(|| {
                format!("failed to read line from events file {}", path.display())
            })?;
            let event: UpdateEvent = serde_json::from_str(&line)
                .with_context(|| format!("failed to parse event JSON from line: {}", line))?;
            events.push(event);
        }

        Ok(Self { events })
    }

    /// Get all events for a specific module.
    pub fn events_for_module(&self, module: &str) -> Vec<&UpdateEvent> {
        self.events
            .iter()
            .filter(|e| e.module == module)
            .collect()
    }

    /// Get all recorded events.
    pub fn events(&self) -> &[UpdateEvent] {
        &self.events
    }

    /// Clear all recorded events (after a successful flush).
    pub fn clear(&mut self) {
        self.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn events_append_and_read_back_in_order() {
        let dir = tempdir().expect("tempdir");
        let path = events_path(dir.path());

        let mut log = EventLog::new();
        log.emit(AGENT_SCOPE, EventType::CheckStarted);
        log.emit(
            "sg",
            EventType::UpdateStarted {
                from: Some("1.0.0".to_string()),
                to: "1.1.0".to_string(),
                priority: Priority::Normal,
            },
        );
        log.write_to_file(&path).expect("write");
        log.clear();
        assert!(log.is_empty());

        log.emit(
            "sg",
            EventType::UpdateApplied {
                version: "1.1.0".to_string(),
            },
        );
        log.write_to_file(&path).expect("append");

        let loaded = EventLog::read_from_file(&path).expect("read");
        assert_eq!(loaded.events().len(), 3);
        assert_eq!(loaded.events()[0].module, AGENT_SCOPE);
        assert_eq!(loaded.events_for_module("sg").len(), 2);
        assert!(matches!(
            loaded.events()[2].event_type,
            EventType::UpdateApplied { .. }
        ));
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let dir = tempdir().expect("tempdir");
        let log = EventLog::read_from_file(&events_path(dir.path())).expect("read");
        assert!(log.is_empty());
    }

    #[test]
    fn event_lines_are_tagged_snake_case() {
        let event = UpdateEvent {
            timestamp: Utc::now(),
            module: "sg".to_string(),
            event_type: EventType::ReloadFailedAfterRollback {
                error: "init returned false".to_string(),
            },
        };
        let json = serde_json::to_string(&event).expect("serialize");
        assert!(json.contains("\"type\":\"reload_failed_after_rollback\""));
    }
}
