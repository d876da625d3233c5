//! Loaded-module bookkeeping.
//!
//! The registry owns every [`LoadedModule`] record and, through it, the
//! module's code region. Uniqueness (at most one entry per name) and
//! capacity are enforced here so the loader's lifecycle code cannot get
//! them wrong.

use std::collections::BTreeMap;
use std::time::Instant;

use thiserror::Error;

use airlift_abi::ModuleInterface;

use crate::exec::ExecRegion;

/// Maximum module name length in bytes.
pub const MAX_NAME_LEN: usize = 31;

/// Module names are short ASCII identifiers: `[A-Za-z0-9_-]+`, at most
/// [`MAX_NAME_LEN`] bytes.
pub fn valid_module_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("module {0:?} is already loaded")]
    AlreadyLoaded(String),
    #[error("module registry is at capacity ({0} modules)")]
    CapacityExceeded(usize),
}

/// One loaded module: its identity, its code, and the interface table
/// the entry point returned.
pub struct LoadedModule {
    pub name: String,
    /// Version string as reported by the module itself.
    pub version: String,
    pub(crate) code: ExecRegion,
    /// Points into `code`; validated against the region bounds at load.
    pub(crate) interface: *const ModuleInterface,
    pub loaded_at: Instant,
    /// Cleared instead of unloading when a module must be fenced off
    /// without tearing down its region (fault quarantine is host
    /// policy, not loader policy).
    pub active: bool,
}

impl LoadedModule {
    pub(crate) fn new(
        name: String,
        version: String,
        code: ExecRegion,
        interface: *const ModuleInterface,
    ) -> Self {
        Self {
            name,
            version,
            code,
            interface,
            loaded_at: Instant::now(),
            active: true,
        }
    }

    pub fn code(&self) -> &ExecRegion {
        &self.code
    }
}

/// Name-keyed store of loaded modules with a fixed capacity.
#[derive(Default)]
pub struct ModuleRegistry {
    capacity: usize,
    modules: BTreeMap<String, LoadedModule>,
}

impl ModuleRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            modules: BTreeMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&LoadedModule> {
        self.modules.get(name)
    }

    pub fn insert(&mut self, module: LoadedModule) -> Result<(), RegistryError> {
        if self.modules.contains_key(&module.name) {
            return Err(RegistryError::AlreadyLoaded(module.name.clone()));
        }
        if self.modules.len() >= self.capacity {
            return Err(RegistryError::CapacityExceeded(self.capacity));
        }
        self.modules.insert(module.name.clone(), module);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<LoadedModule> {
        self.modules.remove(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LoadedModule> {
        self.modules.values()
    }
}
