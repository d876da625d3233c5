//! # Module ABI
//!
//! The stability boundary between the agent and independently compiled
//! driver modules. A module artifact is a position-independent blob whose
//! first byte is the first instruction of its entry-point function:
//!
//! ```text
//! extern "C" fn entry(api: *const SystemApi) -> *const ModuleInterface
//! ```
//!
//! The agent hands the module a [`SystemApi`] table (frozen for the life
//! of the firmware) and receives a [`ModuleInterface`] table that must
//! live inside the module's own code region. Both sides are plain
//! `repr(C)` structs of function pointers so the contract survives across
//! compilers and module toolchains; nothing here may ever depend on Rust
//! layout or grow a non-`repr(C)` field.
//!
//! Fields are appended, never reordered or removed; [`ABI_VERSION`] is
//! bumped when the tables change incompatibly.

use core::ffi::{c_char, c_void};

/// Current ABI version, written into every [`SystemApi`] the agent hands
/// out. Modules built against a newer major ABI must refuse to
/// initialize.
pub const ABI_VERSION: u32 = 1;

/// Log level codes for [`SystemApi::log`].
pub const LOG_ERROR: u32 = 0;
pub const LOG_WARN: u32 = 1;
pub const LOG_INFO: u32 = 2;
pub const LOG_DEBUG: u32 = 3;

/// The module entry point found at offset 0 of every artifact.
///
/// Returns a pointer to the module's [`ModuleInterface`], which must
/// reference memory inside the module's code region, or null if the
/// module rejects the presented API (version mismatch).
pub type EntryFn = extern "C" fn(api: *const SystemApi) -> *const ModuleInterface;

/// One slot in a module's exported function table.
///
/// Slot meaning is a contract between the host application and the
/// module family (e.g. slot 0 of a speed-limit module is the lookup).
pub type ModuleFn = extern "C" fn(arg: i32) -> i32;

/// Services the agent exposes to modules.
///
/// Read-only after process init; modules may call back into it from
/// their `update` hook. All strings crossing this boundary are
/// NUL-terminated.
#[repr(C)]
pub struct SystemApi {
    /// Always [`ABI_VERSION`].
    pub abi_version: u32,
    /// Write one diagnostic line. `level` is one of the `LOG_*` codes.
    pub log: extern "C" fn(level: u32, message: *const c_char),
    /// Monotonic milliseconds since agent start.
    pub monotonic_ms: extern "C" fn() -> u64,
    /// Read the raw value of a sensor channel.
    pub read_sensor: extern "C" fn(channel: u32) -> i32,
    /// Persist a small value under a key. Returns false when the
    /// backing store rejects the write.
    pub store_value: extern "C" fn(key: *const c_char, value: i32) -> bool,
    /// Recall a value stored by `store_value`. Returns false when the
    /// key is absent; `*out` is untouched in that case.
    pub recall_value: extern "C" fn(key: *const c_char, out: *mut i32) -> bool,
    /// Call slot `slot` of another loaded module by name. Returns the
    /// slot's result, or `i32::MIN` when the module or slot is absent.
    pub query_module: extern "C" fn(name: *const c_char, slot: u32, arg: i32) -> i32,
}

/// The table a module returns from its entry point.
///
/// Function fields are `Option` so a null pointer coming from a
/// foreign-toolchain module is representable; the loader rejects tables
/// whose mandatory fields are null.
#[repr(C)]
pub struct ModuleInterface {
    /// NUL-terminated module name. Mandatory.
    pub name: *const c_char,
    /// NUL-terminated `MAJOR.MINOR.PATCH` version. Mandatory.
    pub version: *const c_char,
    /// One-time setup after the code region is live. Mandatory; a
    /// `false` return aborts the load.
    pub initialize: Option<extern "C" fn(api: *const SystemApi) -> bool>,
    /// Teardown before the code region is released.
    pub deinitialize: Option<extern "C" fn()>,
    /// Invoked once per control-loop tick while the module is active.
    pub update: Option<extern "C" fn()>,
    /// Slot table for host-dispatched calls; layout is
    /// `[Option<ModuleFn>; N]` with N agreed out of band. May be null
    /// when the module exports nothing callable.
    pub functions: *const c_void,
}

impl ModuleInterface {
    /// Whether the mandatory fields survived the trip across the ABI.
    pub fn is_complete(&self) -> bool {
        !self.name.is_null() && !self.version.is_null() && self.initialize.is_some()
    }
}
