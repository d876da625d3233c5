//! In-memory map of each module's currently-active version.
//!
//! Updated as the last step of a successful load or reload, read by the
//! manifest diff and by the host's version query. Modules reporting a
//! string outside the semver grammar are tracked as unknown: an unknown
//! version never equals a valid triple and never blocks an upgrade.

use std::collections::BTreeMap;
use std::fmt;

use airlift_semver::{is_upgrade, SemVer};

/// What the tracker knows about one module's version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackedVersion {
    Known(SemVer),
    /// The module reported something outside the grammar; kept verbatim
    /// for diagnostics.
    Unknown(String),
}

impl TrackedVersion {
    pub fn known(&self) -> Option<SemVer> {
        match self {
            TrackedVersion::Known(v) => Some(*v),
            TrackedVersion::Unknown(_) => None,
        }
    }
}

impl fmt::Display for TrackedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackedVersion::Known(v) => write!(f, "{v}"),
            TrackedVersion::Unknown(raw) => write!(f, "{raw} (unknown)"),
        }
    }
}

/// Name → active version for every module the device knows about.
#[derive(Debug, Clone, Default)]
pub struct VersionTracker {
    versions: BTreeMap<String, TrackedVersion>,
}

impl VersionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the version string a module reported after a successful
    /// (re)load.
    pub fn set_reported(&mut self, name: &str, reported: &str) {
        let tracked = match SemVer::parse_lenient(reported) {
            Some(v) => TrackedVersion::Known(v),
            None => TrackedVersion::Unknown(reported.to_string()),
        };
        self.versions.insert(name.to_string(), tracked);
    }

    pub fn remove(&mut self, name: &str) {
        self.versions.remove(name);
    }

    pub fn get(&self, name: &str) -> Option<&TrackedVersion> {
        self.versions.get(name)
    }

    /// The active semantic version, if the module is tracked at a valid
    /// triple.
    pub fn known_version(&self, name: &str) -> Option<SemVer> {
        self.versions.get(name).and_then(TrackedVersion::known)
    }

    /// Whether `offered` is a strict upgrade for `name`. Untracked and
    /// unknown-version modules count as baseline `0.0.0`.
    pub fn is_upgrade(&self, name: &str, offered: SemVer) -> bool {
        is_upgrade(self.known_version(name), offered)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TrackedVersion)> {
        self.versions.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}
