//! The catalog manifest: the single source of truth for what each
//! module's latest version is and what its artifact must hash to.
//!
//! Two document shapes are accepted on read. The current shape nests
//! entries under a `modules` key; the legacy shape is a flat top-level
//! name → entry map. Per-artifact side-files that may sit next to a
//! binary in the catalog are never consulted: verification inputs come
//! from here and nowhere else.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use airlift_loader::valid_module_name;
use airlift_semver::SemVer;

use crate::types::Priority;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("manifest root is not an object")]
    NotAnObject,
    #[error("module name {0:?} outside the grammar")]
    BadName(String),
    #[error("module {module:?} entry is missing field {field:?}")]
    MissingField { module: String, field: &'static str },
    #[error("module {module:?} has unparseable version {version:?}")]
    BadVersion { module: String, version: String },
    #[error("module {module:?} has a malformed sha256 digest")]
    BadDigest { module: String },
    #[error("module {module:?} has unknown priority {value:?}")]
    BadPriority { module: String, value: String },
}

/// One module's row in the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub latest_version: SemVer,
    /// Lowercase 64-hex content digest of the artifact.
    pub sha256: String,
    pub file_size: u64,
    /// Base64 signature over the digest, when the catalog signs.
    pub signature: Option<String>,
    /// Informational publish timestamp; unparseable values read as
    /// absent rather than failing the whole manifest.
    pub updated_at: Option<DateTime<Utc>>,
    pub priority: Priority,
}

/// Parsed manifest document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub modules: BTreeMap<String, ManifestEntry>,
}

impl Manifest {
    /// Parse a manifest body, accepting both the nested and the legacy
    /// flat shape.
    pub fn parse(bytes: &[u8]) -> Result<Manifest, ManifestError> {
        let root: Value = serde_json::from_slice(bytes)?;
        let root_obj = root.as_object().ok_or(ManifestError::NotAnObject)?;

        let entries = match root_obj.get("modules") {
            Some(nested) => nested.as_object().ok_or(ManifestError::NotAnObject)?,
            None => root_obj,
        };

        let mut modules = BTreeMap::new();
        for (name, value) in entries {
            if !valid_module_name(name) {
                return Err(ManifestError::BadName(name.clone()));
            }
            modules.insert(name.clone(), parse_entry(name, value)?);
        }

        Ok(Manifest { modules })
    }

    pub fn get(&self, name: &str) -> Option<&ManifestEntry> {
        self.modules.get(name)
    }
}

fn parse_entry(module: &str, value: &Value) -> Result<ManifestEntry, ManifestError> {
    let obj = value.as_object().ok_or(ManifestError::NotAnObject)?;
    let missing = |field: &'static str| ManifestError::MissingField {
        module: module.to_string(),
        field,
    };

    let version_str = obj
        .get("latest_version")
        .and_then(Value::as_str)
        .ok_or_else(|| missing("latest_version"))?;
    let latest_version: SemVer =
        version_str
            .parse()
            .map_err(|_| ManifestError::BadVersion {
                module: module.to_string(),
                version: version_str.to_string(),
            })?;

    let sha256 = obj
        .get("sha256")
        .and_then(Value::as_str)
        .ok_or_else(|| missing("sha256"))?;
    if sha256.len() != 64 || !sha256.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ManifestError::BadDigest {
            module: module.to_string(),
        });
    }

    let file_size = obj
        .get("file_size")
        .and_then(Value::as_u64)
        .ok_or_else(|| missing("file_size"))?;

    let signature = obj
        .get("signature")
        .and_then(Value::as_str)
        .map(str::to_string);

    let updated_at = obj
        .get("updated_at")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));

    let priority = match obj.get("priority").and_then(Value::as_str) {
        None => Priority::default(),
        Some("critical") => Priority::Critical,
        Some("normal") => Priority::Normal,
        Some("low") => Priority::Low,
        Some(other) => {
            return Err(ManifestError::BadPriority {
                module: module.to_string(),
                value: other.to_string(),
            });
        }
    };

    Ok(ManifestEntry {
        latest_version,
        sha256: sha256.to_ascii_lowercase(),
        file_size,
        signature,
        updated_at,
        priority,
    })
}

/// Catalog path of the manifest document.
pub const MANIFEST_PATH: &str = "manifest.json";

/// Catalog path of the immutable artifact for one version:
/// `<name>/<name>-v<MAJOR.MINOR.PATCH>.bin`.
pub fn artifact_path(name: &str, version: SemVer) -> String {
    format!("{name}/{name}-v{version}.bin")
}

/// Catalog path of the mutable latest pointer, used only when the
/// manifest does not yet list a module.
pub fn latest_artifact_path(name: &str) -> String {
    format!("{name}/latest.bin")
}
