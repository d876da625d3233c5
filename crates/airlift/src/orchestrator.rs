//! The update orchestrator: a tick-driven state machine composing the
//! catalog client, verifier, staging store, and module runtime.
//!
//! The host calls [`Orchestrator::tick`] from its main loop with a
//! monotonic `now`; the orchestrator advances at most one state-machine
//! step, invokes every active module's `update` hook, and returns. All
//! waiting (check cadence, retry backoff, grace and failure-display
//! windows, safe-window gating) is expressed against the `now` values
//! the host supplies; nothing here sleeps or spawns.
//!
//! Error translation happens here and only here: components return
//! typed errors upward, the orchestrator turns them into state
//! transitions, status events, log lines, and event-log entries.

use std::io::Write;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use airlift_loader::{CallError, LoadError, LoadedVersion, ModuleLoader, UnloadError};
use airlift_retry::delay_before;
use airlift_semver::SemVer;

use crate::catalog::{CatalogClient, CatalogError};
use crate::config::AgentConfig;
use crate::events::{events_path, EventLog, EventType, AGENT_SCOPE};
use crate::manifest::{artifact_path, Manifest};
use crate::staging::{RecoveryAction, Slot, StagingError, StagingStore};
use crate::state::{save_state, AgentState};
use crate::tracker::VersionTracker;
use crate::types::{
    AttemptEvidence, ErrorClass, LogLevel, PendingUpdate, Priority, Status, UpdateReceipt,
    UpdateState,
};
use crate::verify::{Verifier, VerifyError};

/// Host-side collaborator contract.
///
/// The host renders status however it likes (LED patterns, a display
/// line) and owns any hold timing beyond the windows the orchestrator
/// already applies.
pub trait Host {
    /// True when the device is in a state where a module unload/reload
    /// is tolerable.
    fn safe_window(&self) -> bool;
    /// Render a status transition.
    fn set_status(&mut self, status: Status);
    /// One-line diagnostic sink; receives a line at every transition
    /// and every error.
    fn log(&mut self, level: LogLevel, message: &str);
}

/// Orchestrator-side seam over the module loader.
///
/// The production implementation is [`ModuleLoader`]; tests drive the
/// update flow with in-process doubles. This trait never crosses the
/// artifact boundary; the module ABI stays the `repr(C)` tables in
/// `airlift-abi`.
pub trait ModuleRuntime {
    fn load(&mut self, name: &str, bytes: &[u8]) -> Result<LoadedVersion, LoadError>;
    fn unload(&mut self, name: &str) -> Result<(), UnloadError>;
    fn reload(&mut self, name: &str, bytes: &[u8]) -> Result<LoadedVersion, LoadError>;
    /// Invoke every active module's `update` hook once.
    fn tick(&mut self);
    fn call(&self, name: &str, slot: u32, arg: i32) -> Result<i32, CallError>;
    fn is_loaded(&self, name: &str) -> bool;
}

impl ModuleRuntime for ModuleLoader {
    fn load(&mut self, name: &str, bytes: &[u8]) -> Result<LoadedVersion, LoadError> {
        ModuleLoader::load(self, name, bytes)
    }

    fn unload(&mut self, name: &str) -> Result<(), UnloadError> {
        ModuleLoader::unload(self, name)
    }

    fn reload(&mut self, name: &str, bytes: &[u8]) -> Result<LoadedVersion, LoadError> {
        ModuleLoader::reload(self, name, bytes)
    }

    fn tick(&mut self) {
        ModuleLoader::tick(self)
    }

    fn call(&self, name: &str, slot: u32, arg: i32) -> Result<i32, CallError> {
        ModuleLoader::call(self, name, slot, arg)
    }

    fn is_loaded(&self, name: &str) -> bool {
        ModuleLoader::is_loaded(self, name)
    }
}

#[derive(Debug, Clone)]
enum Phase {
    /// First tick: recover staging, load active binaries.
    Init,
    /// Waiting for the next check interval.
    Normal,
    /// Pending updates queued, waiting for a safe window.
    UpdateAvailable,
    /// One update in flight: downloading (with backoff between
    /// attempts), then verify/commit/reload within a tick.
    Downloading,
    /// Update applied; backup retained until the grace window elapses.
    ApplySuccess { since: Instant, module: String },
    /// Update failed; outcome held for the failure-display window.
    ApplyFailure { since: Instant },
}

struct InFlight {
    update: PendingUpdate,
    started_at: DateTime<Utc>,
    begun: Instant,
    attempts_made: u32,
    next_attempt_at: Option<Instant>,
    evidence: Vec<AttemptEvidence>,
}

#[derive(Debug)]
enum DownloadError {
    Catalog(CatalogError),
    Staging(StagingError),
}

impl std::fmt::Display for DownloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DownloadError::Catalog(e) => write!(f, "{e}"),
            DownloadError::Staging(e) => write!(f, "{e}"),
        }
    }
}

/// Top-level update agent state machine.
pub struct Orchestrator<R: ModuleRuntime> {
    config: AgentConfig,
    catalog: CatalogClient,
    verifier: Verifier,
    staging: StagingStore,
    tracker: VersionTracker,
    runtime: R,
    events: EventLog,
    events_file: std::path::PathBuf,
    phase: Phase,
    pending: Vec<PendingUpdate>,
    current: Option<InFlight>,
    last_check: Option<Instant>,
    /// When the safe-window signal dropped mid-update, if it has.
    unsafe_since: Option<Instant>,
    receipts: Vec<UpdateReceipt>,
}

impl<R: ModuleRuntime> Orchestrator<R> {
    pub fn new(config: AgentConfig, runtime: R) -> Result<Self> {
        config.validate()?;

        let catalog = CatalogClient::new(&config.catalog, config.update.max_artifact_size)
            .context("failed to build catalog client")?;
        let verifier = Verifier::new(
            config.update.max_artifact_size,
            config.verify.signature_required,
            config.verify.signing_public_key_pem.as_deref(),
        )
        .context("failed to build verifier")?;
        let staging = StagingStore::open(&config.data_dir).context("failed to open staging store")?;
        let events_file = events_path(&config.data_dir);

        Ok(Self {
            config,
            catalog,
            verifier,
            staging,
            tracker: VersionTracker::new(),
            runtime,
            events: EventLog::new(),
            events_file,
            phase: Phase::Init,
            pending: Vec::new(),
            current: None,
            last_check: None,
            unsafe_since: None,
            receipts: Vec::new(),
        })
    }

    /// Advance the state machine by one step and run module update
    /// hooks. Called from the host's main loop every iteration.
    pub fn tick(&mut self, now: Instant, host: &mut dyn Host) {
        if matches!(self.phase, Phase::Init) {
            self.initialize(host);
        }

        match self.phase.clone() {
            Phase::Init => {}
            Phase::Normal => {
                if self.check_due(now) {
                    self.check_for_updates(now, host);
                    if matches!(self.phase, Phase::UpdateAvailable) {
                        self.try_start(now, host);
                    }
                }
            }
            Phase::UpdateAvailable => self.try_start(now, host),
            Phase::Downloading => self.continue_download(now, host),
            Phase::ApplySuccess { since, module } => {
                if now.saturating_duration_since(since) >= self.config.update.post_commit_grace {
                    if let Err(e) = self.staging.finalize_success(&module) {
                        host.log(
                            LogLevel::Error,
                            &format!("{module}: failed to finalize backup: {e}"),
                        );
                    } else {
                        self.events.emit(&module, EventType::BackupFinalized);
                    }
                    self.settle(host);
                }
            }
            Phase::ApplyFailure { since } => {
                if now.saturating_duration_since(since) >= self.config.update.failure_display {
                    self.settle(host);
                }
            }
        }

        self.runtime.tick();
        self.flush_events(host);
    }

    /// The version the tracker holds for a module, if any.
    pub fn get_module_version(&self, name: &str) -> Option<SemVer> {
        self.tracker.known_version(name)
    }

    /// Host indirection for calling a module-provided function by name
    /// and slot.
    pub fn call_module(&self, name: &str, slot: u32, arg: i32) -> Result<i32, CallError> {
        self.runtime.call(name, slot, arg)
    }

    /// Updates queued but not yet started.
    pub fn pending_updates(&self) -> &[PendingUpdate] {
        &self.pending
    }

    /// Audit receipts for completed update cycles.
    pub fn receipts(&self) -> &[UpdateReceipt] {
        &self.receipts
    }

    pub fn take_receipts(&mut self) -> Vec<UpdateReceipt> {
        std::mem::take(&mut self.receipts)
    }

    pub fn tracked_modules(&self) -> impl Iterator<Item = (&str, String)> {
        self.tracker.iter().map(|(name, v)| (name, v.to_string()))
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    // Boot

    fn initialize(&mut self, host: &mut dyn Host) {
        match self.staging.recover() {
            Ok(recovered) => {
                for item in &recovered {
                    let event = match item.action {
                        RecoveryAction::CompletedCommit => EventType::CommitRecovered,
                        RecoveryAction::DiscardedStaging => EventType::StaleStagingDiscarded,
                        RecoveryAction::MissingActive => EventType::ModuleUnloadable {
                            error: "commit journal found but no active or staged binary"
                                .to_string(),
                        },
                    };
                    self.events.emit(&item.module, event);
                    host.log(
                        LogLevel::Info,
                        &format!("{}: recovery: {:?}", item.module, item.action),
                    );
                }
                self.events.emit(
                    AGENT_SCOPE,
                    EventType::AgentStarted {
                        recovered: recovered.len(),
                    },
                );
            }
            Err(e) => {
                host.log(LogLevel::Error, &format!("staging recovery failed: {e}"));
                host.set_status(Status::Error);
            }
        }

        for name in self.staging.modules().unwrap_or_default() {
            if !self.staging.exists(&name, Slot::Active) {
                continue;
            }
            match self.boot_load(&name) {
                Ok(loaded) => {
                    self.tracker.set_reported(&name, &loaded.version);
                    self.events.emit(
                        &name,
                        EventType::ModuleLoadedAtBoot {
                            version: loaded.version.clone(),
                        },
                    );
                    host.log(LogLevel::Info, &format!("{name}: loaded v{}", loaded.version));
                }
                Err(first_error) => {
                    host.log(
                        LogLevel::Warn,
                        &format!("{name}: active binary failed to load ({first_error}), trying backup"),
                    );
                    match self.boot_load_from_backup(&name) {
                        Ok(loaded) => {
                            self.tracker.set_reported(&name, &loaded.version);
                            self.events.emit(
                                &name,
                                EventType::RolledBack {
                                    restored: Some(loaded.version.clone()),
                                },
                            );
                            host.log(
                                LogLevel::Info,
                                &format!("{name}: restored v{} from backup", loaded.version),
                            );
                        }
                        Err(e) => {
                            self.events
                                .emit(&name, EventType::ModuleUnloadable { error: e });
                            host.log(LogLevel::Error, &format!("{name}: left unloaded"));
                        }
                    }
                }
            }
        }

        self.persist_state(host);
        host.set_status(Status::Idle);
        self.phase = Phase::Normal;
    }

    fn boot_load(&mut self, name: &str) -> Result<LoadedVersion, String> {
        let bytes = self
            .staging
            .read(name, Slot::Active)
            .map_err(|e| e.to_string())?;
        self.runtime.load(name, &bytes).map_err(|e| e.to_string())
    }

    fn boot_load_from_backup(&mut self, name: &str) -> Result<LoadedVersion, String> {
        self.staging.rollback(name).map_err(|e| e.to_string())?;
        self.boot_load(name)
    }

    // Checking

    fn check_due(&self, now: Instant) -> bool {
        match self.last_check {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= self.config.update.check_interval,
        }
    }

    fn check_for_updates(&mut self, now: Instant, host: &mut dyn Host) {
        self.last_check = Some(now);
        host.set_status(Status::CheckingUpdates);
        host.log(LogLevel::Info, "checking catalog for updates");
        self.events.emit(AGENT_SCOPE, EventType::CheckStarted);

        let manifest = match self.fetch_and_parse_manifest() {
            Ok(manifest) => manifest,
            Err(error) => {
                self.events
                    .emit(AGENT_SCOPE, EventType::CheckFailed { error: error.clone() });
                host.log(LogLevel::Error, &format!("update check failed: {error}"));
                host.set_status(Status::Error);
                self.phase = Phase::Normal;
                return;
            }
        };

        for (name, entry) in &manifest.modules {
            if self
                .current
                .as_ref()
                .is_some_and(|c| c.update.name == *name)
            {
                continue;
            }
            if !self.tracker.is_upgrade(name, entry.latest_version) {
                continue;
            }
            let update = PendingUpdate {
                name: name.clone(),
                from: self.tracker.known_version(name),
                to: entry.latest_version,
                sha256: entry.sha256.clone(),
                file_size: entry.file_size,
                signature: entry.signature.clone(),
                priority: entry.priority,
            };
            // A later manifest wins over a previously queued target.
            match self.pending.iter_mut().find(|p| p.name == *name) {
                Some(existing) => *existing = update,
                None => self.pending.push(update),
            }
        }
        self.pending.sort_by_key(PendingUpdate::queue_key);

        if self.pending.is_empty() {
            host.set_status(Status::Idle);
            self.phase = Phase::Normal;
        } else {
            self.events.emit(
                AGENT_SCOPE,
                EventType::UpdatesQueued {
                    count: self.pending.len(),
                },
            );
            host.log(
                LogLevel::Info,
                &format!("{} update(s) pending", self.pending.len()),
            );
            host.set_status(Status::UpdateAvailable);
            self.phase = Phase::UpdateAvailable;
        }
    }

    fn fetch_and_parse_manifest(&self) -> Result<Manifest, String> {
        let bytes = self.catalog.fetch_manifest().map_err(|e| e.to_string())?;
        Manifest::parse(&bytes).map_err(|e| e.to_string())
    }

    // Applying

    fn gate_bypassed(&self, update: &PendingUpdate) -> bool {
        update.priority == Priority::Critical && self.config.update.allow_critical_bypass
    }

    fn try_start(&mut self, now: Instant, host: &mut dyn Host) {
        let startable = self
            .pending
            .iter()
            .position(|u| host.safe_window() || self.gate_bypassed(u));
        let Some(index) = startable else {
            return;
        };
        let update = self.pending.remove(index);

        self.events.emit(
            &update.name,
            EventType::UpdateStarted {
                from: update.from.map(|v| v.to_string()),
                to: update.to.to_string(),
                priority: update.priority,
            },
        );
        host.log(
            LogLevel::Info,
            &format!(
                "{}: updating {} -> {}",
                update.name,
                update
                    .from
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "none".to_string()),
                update.to
            ),
        );
        host.set_status(Status::Downloading);

        self.current = Some(InFlight {
            update: update.clone(),
            started_at: Utc::now(),
            begun: now,
            attempts_made: 0,
            next_attempt_at: None,
            evidence: Vec::new(),
        });
        self.phase = Phase::Downloading;

        // Signature policy is decidable from the manifest alone; skip
        // the fetch entirely when the entry can never verify.
        if self.verifier.rejects_unsigned(update.signature.as_deref()) {
            let message = VerifyError::SignatureMissing.to_string();
            host.log(LogLevel::Error, &format!("{}: {message}", update.name));
            self.finish(
                host,
                now,
                UpdateState::Failed {
                    class: ErrorClass::Permanent,
                    message,
                },
            );
            return;
        }

        self.continue_download(now, host);
    }

    fn continue_download(&mut self, now: Instant, host: &mut dyn Host) {
        let Some(update) = self.current.as_ref().map(|c| c.update.clone()) else {
            self.phase = Phase::Normal;
            return;
        };

        // Pre-commit, loss of the safe window cancels the update once
        // it has been gone longer than the threshold.
        if !host.safe_window() && !self.gate_bypassed(&update) {
            let since = *self.unsafe_since.get_or_insert(now);
            if now.saturating_duration_since(since) >= self.config.update.cancel_threshold {
                self.cancel_current(now, host, "safe window lost during download");
            }
            return;
        }
        self.unsafe_since = None;

        if let Some(at) = self.current.as_ref().and_then(|c| c.next_attempt_at) {
            if now < at {
                return;
            }
        }

        let attempt = match self.current.as_mut() {
            Some(current) => {
                current.attempts_made += 1;
                current.next_attempt_at = None;
                current.attempts_made
            }
            None => return,
        };

        match self.download_once(&update) {
            Ok(bytes) => self.verify_and_apply(now, host, &update, bytes),
            Err(error) => {
                let retryable = matches!(error, DownloadError::Catalog(_));
                let retries_left =
                    retryable && attempt <= self.config.update.download.max_attempts;
                let delay = if retries_left {
                    delay_before(&self.config.update.download, attempt)
                } else {
                    Duration::ZERO
                };

                if let Some(current) = self.current.as_mut() {
                    current.evidence.push(AttemptEvidence {
                        attempt,
                        error: error.to_string(),
                        delay_before_ms: delay.as_millis() as u64,
                        timestamp: Utc::now(),
                    });
                }

                if retries_left {
                    host.log(
                        LogLevel::Warn,
                        &format!(
                            "{}: download attempt {attempt} failed ({error}), retrying in {}",
                            update.name,
                            humantime::format_duration(delay)
                        ),
                    );
                    self.events.emit(
                        &update.name,
                        EventType::DownloadRetried {
                            attempt,
                            delay_ms: delay.as_millis() as u64,
                            error: error.to_string(),
                        },
                    );
                    if let Some(current) = self.current.as_mut() {
                        current.next_attempt_at = Some(now + delay);
                    }
                } else {
                    if let Err(e) = self.staging.discard_staging(&update.name) {
                        host.log(
                            LogLevel::Error,
                            &format!("{}: failed to discard staging: {e}", update.name),
                        );
                    }
                    host.log(
                        LogLevel::Error,
                        &format!("{}: download failed: {error}", update.name),
                    );
                    self.events.emit(
                        &update.name,
                        EventType::DownloadFailed {
                            error: error.to_string(),
                        },
                    );
                    let class = if retryable {
                        ErrorClass::Retryable
                    } else {
                        ErrorClass::Permanent
                    };
                    self.finish(
                        host,
                        now,
                        UpdateState::Failed {
                            class,
                            message: error.to_string(),
                        },
                    );
                }
            }
        }
    }

    fn download_once(&mut self, update: &PendingUpdate) -> Result<Vec<u8>, DownloadError> {
        let path = artifact_path(&update.name, update.to);
        let mut writer = self
            .staging
            .open_staging(&update.name)
            .map_err(DownloadError::Staging)?;

        let bytes = match self.catalog.fetch_artifact(&path) {
            Ok(bytes) => bytes,
            Err(e) => {
                drop(writer);
                let _ = self.staging.discard_staging(&update.name);
                return Err(DownloadError::Catalog(e));
            }
        };

        if let Err(e) = writer.write_all(&bytes) {
            drop(writer);
            let _ = self.staging.discard_staging(&update.name);
            return Err(DownloadError::Staging(e.into()));
        }
        if let Err(e) = self.staging.finalize_staging(writer) {
            let _ = self.staging.discard_staging(&update.name);
            return Err(DownloadError::Staging(e));
        }

        Ok(bytes)
    }

    fn verify_and_apply(
        &mut self,
        now: Instant,
        host: &mut dyn Host,
        update: &PendingUpdate,
        bytes: Vec<u8>,
    ) {
        if let Err(error) = self
            .verifier
            .verify(&bytes, &update.sha256, update.signature.as_deref())
        {
            let _ = self.staging.discard_staging(&update.name);
            host.log(
                LogLevel::Error,
                &format!("{}: verification failed: {error}", update.name),
            );
            self.events.emit(
                &update.name,
                EventType::VerifyFailed {
                    error: error.to_string(),
                },
            );
            self.finish(
                host,
                now,
                UpdateState::Failed {
                    class: ErrorClass::Permanent,
                    message: error.to_string(),
                },
            );
            return;
        }

        host.set_status(Status::Applying);
        host.log(LogLevel::Info, &format!("{}: committing", update.name));

        if let Err(error) = self.staging.commit(&update.name) {
            let _ = self.staging.discard_staging(&update.name);
            host.log(
                LogLevel::Error,
                &format!("{}: commit failed: {error}", update.name),
            );
            self.finish(
                host,
                now,
                UpdateState::Failed {
                    class: ErrorClass::Permanent,
                    message: error.to_string(),
                },
            );
            return;
        }
        self.events.emit(&update.name, EventType::StagingCommitted);

        // The old code is gone and the new is not yet live; signal the
        // host to hold power steady through the reload.
        host.set_status(Status::DownloadingFast);

        match self.runtime.reload(&update.name, &bytes) {
            Ok(loaded) => {
                self.tracker.set_reported(&update.name, &loaded.version);
                self.persist_state(host);
                self.events.emit(
                    &update.name,
                    EventType::ModuleReloaded {
                        version: loaded.version.clone(),
                    },
                );
                host.log(
                    LogLevel::Info,
                    &format!("{}: now running v{}", update.name, loaded.version),
                );
                self.finish(host, now, UpdateState::Applied {
                    version: loaded.version,
                });
            }
            Err(error) => {
                host.log(
                    LogLevel::Error,
                    &format!("{}: reload failed ({error}), rolling back", update.name),
                );
                self.roll_back(now, host, update, &error.to_string());
            }
        }
    }

    fn roll_back(
        &mut self,
        now: Instant,
        host: &mut dyn Host,
        update: &PendingUpdate,
        reload_error: &str,
    ) {
        let restored = match self.staging.rollback(&update.name) {
            Ok(()) => match self
                .staging
                .read(&update.name, Slot::Active)
                .map_err(|e| e.to_string())
                .and_then(|old| {
                    self.runtime
                        .reload(&update.name, &old)
                        .map_err(|e| e.to_string())
                }) {
                Ok(loaded) => Some(loaded.version),
                Err(error) => {
                    self.events.emit(
                        &update.name,
                        EventType::ReloadFailedAfterRollback {
                            error: error.clone(),
                        },
                    );
                    host.log(
                        LogLevel::Error,
                        &format!("{}: reload failed after rollback: {error}", update.name),
                    );
                    None
                }
            },
            Err(StagingError::NoBackup(_)) => {
                host.log(
                    LogLevel::Warn,
                    &format!("{}: no backup to roll back to", update.name),
                );
                None
            }
            Err(error) => {
                self.events.emit(
                    &update.name,
                    EventType::ReloadFailedAfterRollback {
                        error: error.to_string(),
                    },
                );
                host.log(
                    LogLevel::Error,
                    &format!("{}: rollback failed: {error}", update.name),
                );
                None
            }
        };

        match &restored {
            Some(version) => {
                self.tracker.set_reported(&update.name, version);
                self.events.emit(
                    &update.name,
                    EventType::RolledBack {
                        restored: Some(version.clone()),
                    },
                );
                host.log(
                    LogLevel::Info,
                    &format!("{}: rolled back to v{version}", update.name),
                );
            }
            None => {
                // The module stays unloaded; its next manifest entry is
                // a fresh install from baseline.
                self.tracker.remove(&update.name);
                self.events.emit(
                    &update.name,
                    EventType::RolledBack { restored: None },
                );
            }
        }
        self.persist_state(host);

        self.finish(
            host,
            now,
            UpdateState::RolledBack {
                restored,
                message: reload_error.to_string(),
            },
        );
    }

    fn cancel_current(&mut self, now: Instant, host: &mut dyn Host, reason: &str) {
        let Some(update) = self.current.as_ref().map(|c| c.update.clone()) else {
            return;
        };
        if let Err(e) = self.staging.discard_staging(&update.name) {
            host.log(
                LogLevel::Error,
                &format!("{}: failed to discard staging: {e}", update.name),
            );
        }
        host.log(LogLevel::Warn, &format!("{}: cancelled: {reason}", update.name));

        // The catalog still offers this version; requeue so the update
        // resumes when the safe window returns.
        self.pending.push(update);
        self.pending.sort_by_key(PendingUpdate::queue_key);

        self.finish(
            host,
            now,
            UpdateState::Cancelled {
                reason: reason.to_string(),
            },
        );
    }

    /// Close out the in-flight update: receipt, terminal event, next
    /// phase, status.
    fn finish(&mut self, host: &mut dyn Host, now: Instant, state: UpdateState) {
        let Some(current) = self.current.take() else {
            return;
        };
        self.unsafe_since = None;

        let event = match &state {
            UpdateState::Applied { version } => EventType::UpdateApplied {
                version: version.clone(),
            },
            UpdateState::Failed { class, message } => EventType::UpdateFailed {
                class: *class,
                message: message.clone(),
            },
            UpdateState::RolledBack { message, .. } => EventType::UpdateFailed {
                class: ErrorClass::Permanent,
                message: message.clone(),
            },
            UpdateState::Cancelled { reason } => EventType::UpdateCancelled {
                reason: reason.clone(),
            },
        };
        self.events.emit(&current.update.name, event);

        self.receipts.push(UpdateReceipt {
            module: current.update.name.clone(),
            from: current.update.from.map(|v| v.to_string()),
            to: current.update.to.to_string(),
            state: state.clone(),
            attempts: current.evidence,
            started_at: current.started_at,
            finished_at: Utc::now(),
            duration_ms: now.saturating_duration_since(current.begun).as_millis() as u64,
        });

        match state {
            UpdateState::Applied { .. } => {
                host.set_status(Status::Success);
                self.phase = Phase::ApplySuccess {
                    since: now,
                    module: current.update.name,
                };
            }
            UpdateState::Cancelled { .. } => self.settle(host),
            UpdateState::Failed { .. } | UpdateState::RolledBack { .. } => {
                host.set_status(Status::Failure);
                self.phase = Phase::ApplyFailure { since: now };
            }
        }
    }

    /// Return to the quiescent phase appropriate for the queue.
    fn settle(&mut self, host: &mut dyn Host) {
        if self.pending.is_empty() {
            host.set_status(Status::Idle);
            self.phase = Phase::Normal;
        } else {
            host.set_status(Status::UpdateAvailable);
            self.phase = Phase::UpdateAvailable;
        }
    }

    fn persist_state(&mut self, host: &mut dyn Host) {
        let state = AgentState::from_tracker(&self.config.catalog.device_id, &self.tracker);
        if let Err(e) = save_state(&self.config.data_dir, &state) {
            host.log(LogLevel::Error, &format!("failed to persist state: {e}"));
        }
    }

    fn flush_events(&mut self, host: &mut dyn Host) {
        if self.events.is_empty() {
            return;
        }
        if let Err(e) = self.events.write_to_file(&self.events_file) {
            host.log(LogLevel::Error, &format!("failed to write event log: {e}"));
        }
        self.events.clear();
    }
}
