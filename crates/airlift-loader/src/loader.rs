//! The module lifecycle: load, unload, reload, tick, call.
//!
//! Loading interprets offset 0 of a verified artifact as the entry-point
//! function, hands it the frozen [`SystemApi`] table, and validates the
//! [`ModuleInterface`] it returns before running `initialize`. Every
//! call into module code happens strictly between a successful `load`
//! and the matching `unload`; `deinitialize` is the last call into a
//! region before it is scrubbed and released.

use std::ffi::CStr;
use std::io;
use std::os::raw::c_char;

use thiserror::Error;

use airlift_abi::{ModuleFn, ModuleInterface, SystemApi};

use crate::exec::ExecRegion;
use crate::registry::{valid_module_name, LoadedModule, ModuleRegistry, RegistryError};

/// Artifacts shorter than this cannot hold an entry prologue plus an
/// interface table and are rejected before any memory is mapped.
pub const MIN_ARTIFACT_LEN: usize = 32;

/// Identity reported by a module after a successful load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedVersion {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("module {0:?} is already loaded")]
    AlreadyLoaded(String),
    #[error("module registry is at capacity ({0} modules)")]
    CapacityExceeded(usize),
    #[error("failed to allocate executable memory: {0}")]
    Memory(#[from] io::Error),
    #[error("invalid artifact: {0}")]
    InvalidArtifact(&'static str),
    #[error("module {0:?} refused to initialize")]
    InitFailed(String),
}

impl From<RegistryError> for LoadError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::AlreadyLoaded(name) => LoadError::AlreadyLoaded(name),
            RegistryError::CapacityExceeded(capacity) => LoadError::CapacityExceeded(capacity),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnloadError {
    #[error("module {0:?} is not loaded")]
    NotFound(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("module {0:?} is not loaded")]
    NotFound(String),
    #[error("module {module:?} exports no function in slot {slot}")]
    NoSuchFunction { module: String, slot: u32 },
}

/// In-process loader: owns the registry and the API table presented to
/// every module.
pub struct ModuleLoader {
    registry: ModuleRegistry,
    api: &'static SystemApi,
}

impl ModuleLoader {
    pub fn new(capacity: usize, api: &'static SystemApi) -> Self {
        Self {
            registry: ModuleRegistry::new(capacity),
            api,
        }
    }

    /// Map `bytes` executable, run the module's entry point and
    /// `initialize`, and register the result.
    ///
    /// On any failure after the region is mapped, the region is scrubbed
    /// and released before returning; a failed load leaves no trace.
    pub fn load(&mut self, name: &str, bytes: &[u8]) -> Result<LoadedVersion, LoadError> {
        if self.registry.contains(name) {
            return Err(LoadError::AlreadyLoaded(name.to_string()));
        }
        if self.registry.len() >= self.registry.capacity() {
            return Err(LoadError::CapacityExceeded(self.registry.capacity()));
        }
        if !valid_module_name(name) {
            return Err(LoadError::InvalidArtifact("module name outside the grammar"));
        }
        if bytes.len() < MIN_ARTIFACT_LEN {
            return Err(LoadError::InvalidArtifact(
                "artifact shorter than the minimum entry prologue",
            ));
        }

        let region = ExecRegion::new(bytes)?;

        // SAFETY: the artifact contract places an EntryFn at offset 0 of
        // every published module; the bytes reaching this point have
        // passed digest verification against the catalog manifest.
        let entry = unsafe { region.entry() };
        let api_ptr: *const SystemApi = self.api;
        let interface = entry(api_ptr);

        if interface.is_null() {
            return Err(LoadError::InvalidArtifact("entry point returned null"));
        }
        if !region.contains(interface.cast(), std::mem::size_of::<ModuleInterface>()) {
            return Err(LoadError::InvalidArtifact(
                "interface table lies outside the module's code region",
            ));
        }

        // SAFETY: non-null and fully inside the region we just mapped.
        let table = unsafe { &*interface };
        if !table.is_complete() {
            return Err(LoadError::InvalidArtifact(
                "interface table has null mandatory fields",
            ));
        }

        // SAFETY: both pointers were null-checked by is_complete and
        // point at NUL-terminated static strings per the module
        // contract.
        let reported_name = unsafe { read_interface_str(table.name) }
            .ok_or(LoadError::InvalidArtifact("module name is not valid UTF-8"))?;
        let reported_version = unsafe { read_interface_str(table.version) }.ok_or(
            LoadError::InvalidArtifact("module version is not valid UTF-8"),
        )?;
        if reported_name != name {
            return Err(LoadError::InvalidArtifact(
                "module reports a different name than the artifact it shipped as",
            ));
        }

        let initialize = table
            .initialize
            .ok_or(LoadError::InvalidArtifact("initialize hook is null"))?;
        if !initialize(api_ptr) {
            return Err(LoadError::InitFailed(name.to_string()));
        }

        let version = reported_version.to_string();
        self.registry.insert(LoadedModule::new(
            name.to_string(),
            version.clone(),
            region,
            interface,
        ))?;

        Ok(LoadedVersion {
            name: name.to_string(),
            version,
        })
    }

    /// Run `deinitialize` (if the module exports one), scrub the code
    /// region, and drop the registry entry.
    pub fn unload(&mut self, name: &str) -> Result<(), UnloadError> {
        let module = self
            .registry
            .remove(name)
            .ok_or_else(|| UnloadError::NotFound(name.to_string()))?;

        // SAFETY: the interface pointer was bounds-checked at load and
        // the region it points into is still mapped; this is the last
        // call into the region before it is released.
        if let Some(deinitialize) = unsafe { (*module.interface).deinitialize } {
            deinitialize();
        }
        drop(module);
        Ok(())
    }

    /// `unload` (if present) then `load`. A reload that fails in `load`
    /// leaves the module absent; reacquisition from backup is the
    /// orchestrator's job.
    pub fn reload(&mut self, name: &str, bytes: &[u8]) -> Result<LoadedVersion, LoadError> {
        let _ = self.unload(name);
        self.load(name, bytes)
    }

    /// Invoke every active module's `update` hook once.
    pub fn tick(&mut self) {
        for module in self.registry.iter() {
            if !module.active {
                continue;
            }
            // SAFETY: interface pointers are only stored after the load
            // bounds check and the region lives as long as the entry.
            if let Some(update) = unsafe { (*module.interface).update } {
                update();
            }
        }
    }

    /// Dispatch a host call to slot `slot` of a module's exported
    /// function table.
    pub fn call(&self, name: &str, slot: u32, arg: i32) -> Result<i32, CallError> {
        let module = self
            .registry
            .get(name)
            .ok_or_else(|| CallError::NotFound(name.to_string()))?;

        // SAFETY: stored interface pointers are valid for the life of
        // the registry entry.
        let table = unsafe { &*module.interface };
        let no_such = || CallError::NoSuchFunction {
            module: name.to_string(),
            slot,
        };
        if table.functions.is_null() {
            return Err(no_such());
        }

        let slot_ptr: *const Option<ModuleFn> =
            // SAFETY: pointer arithmetic only; the result is bounds-
            // checked against the code region before it is read.
            unsafe { table.functions.cast::<Option<ModuleFn>>().add(slot as usize) };
        if !module
            .code()
            .contains(slot_ptr.cast(), std::mem::size_of::<Option<ModuleFn>>())
        {
            return Err(no_such());
        }

        // SAFETY: just bounds-checked; Option<ModuleFn> is FFI-null
        // compatible, so a null slot reads as None.
        match unsafe { *slot_ptr } {
            Some(function) => Ok(function(arg)),
            None => Err(no_such()),
        }
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.registry.contains(name)
    }

    /// Version string a loaded module reported, if it is loaded.
    pub fn loaded_version(&self, name: &str) -> Option<&str> {
        self.registry.get(name).map(|m| m.version.as_str())
    }

    pub fn loaded_names(&self) -> Vec<String> {
        self.registry.names().map(str::to_string).collect()
    }

    pub fn loaded_count(&self) -> usize {
        self.registry.len()
    }
}

/// Read a NUL-terminated string field from an interface table.
///
/// Returns `None` for non-UTF-8 data or strings long enough to be
/// obviously garbage rather than a name or version.
///
/// # Safety
///
/// `ptr` must be null or point to a NUL-terminated string that stays
/// alive for the returned lifetime.
unsafe fn read_interface_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: non-null and NUL-terminated per this function's contract.
    let s = unsafe { CStr::from_ptr(ptr) }.to_str().ok()?;
    (s.len() <= 64).then_some(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn api_log(_level: u32, _message: *const c_char) {}
    extern "C" fn api_monotonic_ms() -> u64 {
        0
    }
    extern "C" fn api_read_sensor(_channel: u32) -> i32 {
        0
    }
    extern "C" fn api_store_value(_key: *const c_char, _value: i32) -> bool {
        true
    }
    extern "C" fn api_recall_value(_key: *const c_char, _out: *mut i32) -> bool {
        false
    }
    extern "C" fn api_query_module(_name: *const c_char, _slot: u32, _arg: i32) -> i32 {
        i32::MIN
    }

    static TEST_API: SystemApi = SystemApi {
        abi_version: airlift_abi::ABI_VERSION,
        log: api_log,
        monotonic_ms: api_monotonic_ms,
        read_sensor: api_read_sensor,
        store_value: api_store_value,
        recall_value: api_recall_value,
        query_module: api_query_module,
    };

    // Lifecycle paths that execute module code need real artifacts and
    // run under the end-to-end harness; these cover everything the
    // loader decides before the first instruction runs.

    #[test]
    fn rejects_names_outside_the_grammar() {
        let mut loader = ModuleLoader::new(4, &TEST_API);
        let err = loader.load("bad name", &[0u8; 64]).unwrap_err();
        assert!(matches!(err, LoadError::InvalidArtifact(_)));
    }

    #[test]
    fn rejects_truncated_artifacts_before_mapping() {
        let mut loader = ModuleLoader::new(4, &TEST_API);
        let err = loader.load("sg", &[0u8; MIN_ARTIFACT_LEN - 1]).unwrap_err();
        assert!(matches!(err, LoadError::InvalidArtifact(_)));
    }

    #[test]
    fn unloading_an_absent_module_reports_not_found() {
        let mut loader = ModuleLoader::new(4, &TEST_API);
        assert_eq!(
            loader.unload("sg"),
            Err(UnloadError::NotFound("sg".to_string()))
        );
    }

    #[test]
    fn calling_an_absent_module_reports_not_found() {
        let loader = ModuleLoader::new(4, &TEST_API);
        assert_eq!(
            loader.call("sg", 0, 7),
            Err(CallError::NotFound("sg".to_string()))
        );
    }

    #[test]
    fn loader_starts_empty() {
        let loader = ModuleLoader::new(4, &TEST_API);
        assert_eq!(loader.loaded_count(), 0);
        assert!(!loader.is_loaded("sg"));
        assert_eq!(loader.loaded_version("sg"), None);
    }
}
