//! Semantic version triples for module tracking.
//!
//! Catalog manifests and loaded modules report versions as
//! `MAJOR.MINOR.PATCH` strings, optionally prefixed with `v`. This crate
//! parses that grammar into an ordered triple and keeps everything that
//! falls outside the grammar explicitly "unknown": an unknown version is
//! never equal to a valid triple and is never selected as an upgrade
//! target.
//!
//! # Example
//!
//! ```
//! use airlift_semver::SemVer;
//!
//! let current: SemVer = "1.0.3".parse().unwrap();
//! let offered: SemVer = "v1.1.0".parse().unwrap();
//! assert!(offered > current);
//! assert_eq!(offered.to_string(), "1.1.0");
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Errors produced when a version string falls outside the
/// `MAJOR.MINOR.PATCH` grammar.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SemVerError {
    #[error("empty version string")]
    Empty,
    #[error("expected three dot-separated components, got {0}")]
    ComponentCount(usize),
    #[error("non-numeric version component {0:?}")]
    BadComponent(String),
}

/// A `MAJOR.MINOR.PATCH` triple, compared component-wise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SemVer {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl SemVer {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// The baseline version assigned to modules the device has never
    /// tracked. Any published version is an upgrade over it.
    pub const BASELINE: SemVer = SemVer::new(0, 0, 0);

    /// Lenient parse: `None` for anything outside the grammar.
    ///
    /// Used where a version string comes from an untrusted reporter (a
    /// loaded module, a stale state file) and "unknown" is a valid
    /// answer rather than an error.
    pub fn parse_lenient(s: &str) -> Option<SemVer> {
        s.parse().ok()
    }
}

impl FromStr for SemVer {
    type Err = SemVerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix('v').unwrap_or(s);
        if s.is_empty() {
            return Err(SemVerError::Empty);
        }

        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 3 {
            return Err(SemVerError::ComponentCount(parts.len()));
        }

        let mut components = [0u32; 3];
        for (slot, part) in components.iter_mut().zip(&parts) {
            // Leading `+`, whitespace, and empty components are all
            // rejected by u32's own parser.
            if part.starts_with('+') {
                return Err(SemVerError::BadComponent((*part).to_string()));
            }
            *slot = part
                .parse()
                .map_err(|_| SemVerError::BadComponent((*part).to_string()))?;
        }

        Ok(SemVer::new(components[0], components[1], components[2]))
    }
}

impl fmt::Display for SemVer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Serialize for SemVer {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SemVer {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Whether `offered` is a strict upgrade over `current`.
///
/// `current = None` means the module is untracked (or tracked at an
/// unknown version) and is treated as [`SemVer::BASELINE`], so any
/// non-zero published version qualifies.
pub fn is_upgrade(current: Option<SemVer>, offered: SemVer) -> bool {
    offered > current.unwrap_or(SemVer::BASELINE)
}
