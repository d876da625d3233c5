//! Durable per-module staging with atomic commit.
//!
//! Each module owns up to three slots on disk plus a journal marker:
//!
//! ```text
//! <data_dir>/modules/<name>/
//!     active.bin      code loaded this session
//!     staging.bin     a new binary being prepared
//!     backup.bin      the previous active, until finalized
//!     .commit         journal marker: a commit is in flight
//! ```
//!
//! Commit is rename-based and journaled: the marker is written durably
//! before any rename and removed after the last one, so a power failure
//! at any point leaves a state [`StagingStore::recover`] can classify as
//! either pre-commit or post-commit, never a half-applied split.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use airlift_loader::valid_module_name;

pub const ACTIVE_FILE: &str = "active.bin";
pub const STAGING_FILE: &str = "staging.bin";
pub const BACKUP_FILE: &str = "backup.bin";
pub const COMMIT_MARKER: &str = ".commit";

const MARKER_CONTENT: &[u8] = b"airlift.commit.v1\n";

/// The three durable slots of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Active,
    Staging,
    Backup,
}

impl Slot {
    fn file_name(self) -> &'static str {
        match self {
            Slot::Active => ACTIVE_FILE,
            Slot::Staging => STAGING_FILE,
            Slot::Backup => BACKUP_FILE,
        }
    }
}

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("staging slot for {0:?} is already open")]
    Busy(String),
    #[error("no staged artifact for {0:?}")]
    MissingStaging(String),
    #[error("no backup available for {0:?}")]
    NoBackup(String),
    #[error("slot {slot:?} for {module:?} is absent")]
    SlotMissing { module: String, slot: Slot },
    #[error("storage is out of space")]
    NoSpace,
    #[error("staging I/O failed: {0}")]
    Io(#[from] io::Error),
}

fn classify_io(err: io::Error) -> StagingError {
    if err.kind() == io::ErrorKind::StorageFull {
        StagingError::NoSpace
    } else {
        StagingError::Io(err)
    }
}

/// What `recover` found and did for one module on boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// A journaled commit was replayed to completion.
    CompletedCommit,
    /// An unjournaled staging slot was discarded.
    DiscardedStaging,
    /// Marker present but neither staging nor active survived; the
    /// backup (if any) was left in place for the boot loader to try.
    MissingActive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredModule {
    pub module: String,
    pub action: RecoveryAction,
}

/// Write handle for a module's staging slot. Obtained from
/// [`StagingStore::open_staging`] and consumed by
/// [`StagingStore::finalize_staging`]; an abandoned writer is cleaned up
/// with [`StagingStore::discard_staging`].
pub struct StagingWriter {
    name: String,
    file: File,
}

impl StagingWriter {
    pub fn module(&self) -> &str {
        &self.name
    }
}

impl Write for StagingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Exclusive owner of the on-disk slot tree.
pub struct StagingStore {
    root: PathBuf,
    open: BTreeSet<String>,
}

impl StagingStore {
    /// Open (and create if needed) the store rooted at
    /// `<data_dir>/modules`.
    pub fn open(data_dir: &Path) -> Result<Self, StagingError> {
        let root = data_dir.join("modules");
        fs::create_dir_all(&root).map_err(classify_io)?;
        Ok(Self {
            root,
            open: BTreeSet::new(),
        })
    }

    fn module_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn slot_path(&self, name: &str, slot: Slot) -> PathBuf {
        self.module_dir(name).join(slot.file_name())
    }

    fn marker_path(&self, name: &str) -> PathBuf {
        self.module_dir(name).join(COMMIT_MARKER)
    }

    /// Names of all modules with any on-disk presence, in sorted order.
    pub fn modules(&self) -> Result<Vec<String>, StagingError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if valid_module_name(name) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn exists(&self, name: &str, slot: Slot) -> bool {
        self.slot_path(name, slot).exists()
    }

    /// Truncate any prior staging slot and return a write handle.
    pub fn open_staging(&mut self, name: &str) -> Result<StagingWriter, StagingError> {
        if self.open.contains(name) {
            return Err(StagingError::Busy(name.to_string()));
        }
        fs::create_dir_all(self.module_dir(name)).map_err(classify_io)?;
        let file = File::create(self.slot_path(name, Slot::Staging)).map_err(classify_io)?;
        self.open.insert(name.to_string());
        Ok(StagingWriter {
            name: name.to_string(),
            file,
        })
    }

    /// Flush and durably persist the staged bytes.
    pub fn finalize_staging(&mut self, mut writer: StagingWriter) -> Result<(), StagingError> {
        writer.file.flush().map_err(classify_io)?;
        writer.file.sync_all().map_err(classify_io)?;
        sync_dir(&self.module_dir(&writer.name))?;
        self.open.remove(&writer.name);
        Ok(())
    }

    /// Drop the staging slot (and any open-writer claim on it).
    pub fn discard_staging(&mut self, name: &str) -> Result<(), StagingError> {
        self.open.remove(name);
        let path = self.slot_path(name, Slot::Staging);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(classify_io(e)),
        }
    }

    /// Atomically publish the staged binary: current `active` becomes
    /// `backup`, `staging` becomes `active`.
    pub fn commit(&mut self, name: &str) -> Result<(), StagingError> {
        let staging = self.slot_path(name, Slot::Staging);
        if !staging.exists() {
            return Err(StagingError::MissingStaging(name.to_string()));
        }

        // Journal first: once the marker is durable, recovery completes
        // this commit forward instead of rolling it back.
        let dir = self.module_dir(name);
        let marker = self.marker_path(name);
        let mut file = File::create(&marker).map_err(classify_io)?;
        file.write_all(MARKER_CONTENT).map_err(classify_io)?;
        file.sync_all().map_err(classify_io)?;
        sync_dir(&dir)?;

        let active = self.slot_path(name, Slot::Active);
        if active.exists() {
            fs::rename(&active, self.slot_path(name, Slot::Backup)).map_err(classify_io)?;
        }
        fs::rename(&staging, &active).map_err(classify_io)?;
        fs::remove_file(&marker).map_err(classify_io)?;
        sync_dir(&dir)?;
        Ok(())
    }

    /// Restore the previous active from backup, discarding the current
    /// active.
    pub fn rollback(&mut self, name: &str) -> Result<(), StagingError> {
        let backup = self.slot_path(name, Slot::Backup);
        if !backup.exists() {
            return Err(StagingError::NoBackup(name.to_string()));
        }
        fs::rename(&backup, self.slot_path(name, Slot::Active)).map_err(classify_io)?;
        sync_dir(&self.module_dir(name))?;
        Ok(())
    }

    /// Delete the backup after the post-commit grace window.
    pub fn finalize_success(&mut self, name: &str) -> Result<(), StagingError> {
        let backup = self.slot_path(name, Slot::Backup);
        match fs::remove_file(&backup) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(classify_io(e)),
        }
    }

    /// Read one slot fully into memory.
    pub fn read(&self, name: &str, slot: Slot) -> Result<Vec<u8>, StagingError> {
        match fs::read(self.slot_path(name, slot)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StagingError::SlotMissing {
                module: name.to_string(),
                slot,
            }),
            Err(e) => Err(classify_io(e)),
        }
    }

    /// Boot-time slot inspection: replay journaled commits, discard
    /// unjournaled staging, report anything that needs attention.
    pub fn recover(&mut self) -> Result<Vec<RecoveredModule>, StagingError> {
        let mut recovered = Vec::new();

        for name in self.modules()? {
            let dir = self.module_dir(&name);
            let marker = self.marker_path(&name);
            let active = self.slot_path(&name, Slot::Active);
            let staging = self.slot_path(&name, Slot::Staging);

            if marker.exists() {
                if staging.exists() {
                    // Crashed before (or mid) publish: replay the
                    // commit from the journal point.
                    if active.exists() {
                        fs::rename(&active, self.slot_path(&name, Slot::Backup))
                            .map_err(classify_io)?;
                    }
                    fs::rename(&staging, &active).map_err(classify_io)?;
                    fs::remove_file(&marker).map_err(classify_io)?;
                    sync_dir(&dir)?;
                    recovered.push(RecoveredModule {
                        module: name,
                        action: RecoveryAction::CompletedCommit,
                    });
                } else if active.exists() {
                    // Crashed after publish, before clearing the
                    // marker.
                    fs::remove_file(&marker).map_err(classify_io)?;
                    sync_dir(&dir)?;
                    recovered.push(RecoveredModule {
                        module: name,
                        action: RecoveryAction::CompletedCommit,
                    });
                } else {
                    // Neither slot survived; leave any backup for the
                    // boot loader to fall back on.
                    fs::remove_file(&marker).map_err(classify_io)?;
                    sync_dir(&dir)?;
                    recovered.push(RecoveredModule {
                        module: name,
                        action: RecoveryAction::MissingActive,
                    });
                }
            } else if staging.exists() {
                // No commit record: the update never reached commit,
                // so the staged bytes are dead weight.
                fs::remove_file(&staging).map_err(classify_io)?;
                recovered.push(RecoveredModule {
                    module: name,
                    action: RecoveryAction::DiscardedStaging,
                });
            }
        }

        Ok(recovered)
    }
}

#[cfg(unix)]
fn sync_dir(path: &Path) -> Result<(), StagingError> {
    File::open(path)
        .and_then(|f| f.sync_all())
        .map_err(classify_io)
}

#[cfg(not(unix))]
fn sync_dir(_path: &Path) -> Result<(), StagingError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn stage(store: &mut StagingStore, name: &str, bytes: &[u8]) {
        let mut writer = store.open_staging(name).expect("open staging");
        writer.write_all(bytes).expect("write");
        store.finalize_staging(writer).expect("finalize");
    }

    #[test]
    fn commit_publishes_staging_and_keeps_a_backup() {
        let dir = tempdir().expect("tempdir");
        let mut store = StagingStore::open(dir.path()).expect("open");

        stage(&mut store, "sg", b"v1 code");
        store.commit("sg").expect("first commit");
        assert_eq!(store.read("sg", Slot::Active).unwrap(), b"v1 code");
        assert!(!store.exists("sg", Slot::Backup));

        stage(&mut store, "sg", b"v2 code");
        store.commit("sg").expect("second commit");
        assert_eq!(store.read("sg", Slot::Active).unwrap(), b"v2 code");
        assert_eq!(store.read("sg", Slot::Backup).unwrap(), b"v1 code");
        assert!(!store.exists("sg", Slot::Staging));
    }

    #[test]
    fn open_staging_is_exclusive_per_module() {
        let dir = tempdir().expect("tempdir");
        let mut store = StagingStore::open(dir.path()).expect("open");

        let writer = store.open_staging("sg").expect("first open");
        assert!(matches!(
            store.open_staging("sg"),
            Err(StagingError::Busy(_))
        ));
        // A different module is unaffected.
        let other = store.open_staging("ds").expect("other module");
        drop(other);
        drop(writer);

        // Discard releases the claim.
        store.discard_staging("sg").expect("discard");
        let _ = store.open_staging("sg").expect("reopen after discard");
    }

    #[test]
    fn rollback_restores_the_previous_active() {
        let dir = tempdir().expect("tempdir");
        let mut store = StagingStore::open(dir.path()).expect("open");

        stage(&mut store, "sg", b"v1 code");
        store.commit("sg").expect("commit v1");
        stage(&mut store, "sg", b"v2 code");
        store.commit("sg").expect("commit v2");

        store.rollback("sg").expect("rollback");
        assert_eq!(store.read("sg", Slot::Active).unwrap(), b"v1 code");
        assert!(!store.exists("sg", Slot::Backup));
    }

    #[test]
    fn rollback_without_backup_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let mut store = StagingStore::open(dir.path()).expect("open");

        stage(&mut store, "sg", b"v1 code");
        store.commit("sg").expect("commit");
        assert!(matches!(
            store.rollback("sg"),
            Err(StagingError::NoBackup(_))
        ));
    }

    #[test]
    fn finalize_success_drops_the_backup() {
        let dir = tempdir().expect("tempdir");
        let mut store = StagingStore::open(dir.path()).expect("open");

        stage(&mut store, "sg", b"v1 code");
        store.commit("sg").expect("commit v1");
        stage(&mut store, "sg", b"v2 code");
        store.commit("sg").expect("commit v2");

        store.finalize_success("sg").expect("finalize");
        assert!(!store.exists("sg", Slot::Backup));
        // Idempotent.
        store.finalize_success("sg").expect("finalize again");
    }

    #[test]
    fn commit_without_staging_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let mut store = StagingStore::open(dir.path()).expect("open");
        assert!(matches!(
            store.commit("sg"),
            Err(StagingError::MissingStaging(_))
        ));
    }

    #[test]
    fn read_of_an_absent_slot_names_the_slot() {
        let dir = tempdir().expect("tempdir");
        let store = StagingStore::open(dir.path()).expect("open");
        assert!(matches!(
            store.read("sg", Slot::Backup),
            Err(StagingError::SlotMissing {
                slot: Slot::Backup,
                ..
            })
        ));
    }

    // Crash matrix: each test reconstructs the exact on-disk state a
    // power failure at one point of commit() would leave behind, then
    // asserts recover() lands on pre-commit or post-commit bytes.

    fn write_raw(dir: &Path, module: &str, file: &str, bytes: &[u8]) {
        let path = dir.join("modules").join(module);
        fs::create_dir_all(&path).expect("mkdir");
        fs::write(path.join(file), bytes).expect("write raw");
    }

    #[test]
    fn crash_before_marker_discards_staging() {
        let dir = tempdir().expect("tempdir");
        write_raw(dir.path(), "sg", ACTIVE_FILE, b"old");
        write_raw(dir.path(), "sg", STAGING_FILE, b"new");

        let mut store = StagingStore::open(dir.path()).expect("open");
        let recovered = store.recover().expect("recover");

        assert_eq!(
            recovered,
            vec![RecoveredModule {
                module: "sg".to_string(),
                action: RecoveryAction::DiscardedStaging,
            }]
        );
        assert_eq!(store.read("sg", Slot::Active).unwrap(), b"old");
        assert!(!store.exists("sg", Slot::Staging));
    }

    #[test]
    fn crash_after_marker_before_renames_completes_the_commit() {
        let dir = tempdir().expect("tempdir");
        write_raw(dir.path(), "sg", ACTIVE_FILE, b"old");
        write_raw(dir.path(), "sg", STAGING_FILE, b"new");
        write_raw(dir.path(), "sg", COMMIT_MARKER, MARKER_CONTENT);

        let mut store = StagingStore::open(dir.path()).expect("open");
        let recovered = store.recover().expect("recover");

        assert_eq!(recovered[0].action, RecoveryAction::CompletedCommit);
        assert_eq!(store.read("sg", Slot::Active).unwrap(), b"new");
        assert_eq!(store.read("sg", Slot::Backup).unwrap(), b"old");
        assert!(!store.exists("sg", Slot::Staging));
        assert!(!dir.path().join("modules/sg").join(COMMIT_MARKER).exists());
    }

    #[test]
    fn crash_between_the_two_renames_completes_the_commit() {
        // active already moved to backup, staging not yet published.
        let dir = tempdir().expect("tempdir");
        write_raw(dir.path(), "sg", BACKUP_FILE, b"old");
        write_raw(dir.path(), "sg", STAGING_FILE, b"new");
        write_raw(dir.path(), "sg", COMMIT_MARKER, MARKER_CONTENT);

        let mut store = StagingStore::open(dir.path()).expect("open");
        let recovered = store.recover().expect("recover");

        assert_eq!(recovered[0].action, RecoveryAction::CompletedCommit);
        assert_eq!(store.read("sg", Slot::Active).unwrap(), b"new");
        assert_eq!(store.read("sg", Slot::Backup).unwrap(), b"old");
    }

    #[test]
    fn crash_after_publish_before_marker_removal_clears_the_marker() {
        let dir = tempdir().expect("tempdir");
        write_raw(dir.path(), "sg", ACTIVE_FILE, b"new");
        write_raw(dir.path(), "sg", BACKUP_FILE, b"old");
        write_raw(dir.path(), "sg", COMMIT_MARKER, MARKER_CONTENT);

        let mut store = StagingStore::open(dir.path()).expect("open");
        let recovered = store.recover().expect("recover");

        assert_eq!(recovered[0].action, RecoveryAction::CompletedCommit);
        assert_eq!(store.read("sg", Slot::Active).unwrap(), b"new");
        assert_eq!(store.read("sg", Slot::Backup).unwrap(), b"old");
        assert!(!dir.path().join("modules/sg").join(COMMIT_MARKER).exists());
    }

    #[test]
    fn marker_with_no_slots_leaves_backup_for_the_boot_loader() {
        let dir = tempdir().expect("tempdir");
        write_raw(dir.path(), "sg", BACKUP_FILE, b"old");
        write_raw(dir.path(), "sg", COMMIT_MARKER, MARKER_CONTENT);

        let mut store = StagingStore::open(dir.path()).expect("open");
        let recovered = store.recover().expect("recover");

        assert_eq!(recovered[0].action, RecoveryAction::MissingActive);
        assert!(store.exists("sg", Slot::Backup));
        assert!(!store.exists("sg", Slot::Active));
    }

    #[test]
    fn clean_store_recovers_to_nothing() {
        let dir = tempdir().expect("tempdir");
        write_raw(dir.path(), "sg", ACTIVE_FILE, b"steady");

        let mut store = StagingStore::open(dir.path()).expect("open");
        assert!(store.recover().expect("recover").is_empty());
        assert_eq!(store.read("sg", Slot::Active).unwrap(), b"steady");
    }

    #[test]
    fn foreign_directories_are_ignored() {
        let dir = tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("modules").join("not a module!"))
            .expect("mkdir foreign");
        write_raw(dir.path(), "sg", ACTIVE_FILE, b"steady");

        let store = StagingStore::open(dir.path()).expect("open");
        assert_eq!(store.modules().expect("modules"), vec!["sg".to_string()]);
    }
}
