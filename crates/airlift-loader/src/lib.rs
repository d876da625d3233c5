//! Module loading for the airlift agent.
//!
//! A module artifact is a self-contained, position-independent blob of
//! executable code with its entry point at offset 0 (see `airlift-abi`
//! for the tables crossing that boundary). This crate owns the three
//! pieces that turn such a blob into a running driver module:
//!
//! - [`exec`] — executable memory regions with a strict lifetime: mapped
//!   and filled before the first call, never reused while loaded, zeroed
//!   on release.
//! - [`registry`] — bookkeeping for loaded modules: at most one entry
//!   per name, bounded capacity.
//! - [`loader`] — the load / unload / reload / tick lifecycle and the
//!   host-dispatched call path.
//!
//! The loader performs no object-format parsing: relocation and linking
//! are the build pipeline's job, and artifact integrity is established
//! by the verifier before bytes ever reach [`loader::ModuleLoader::load`].

pub mod exec;
pub mod hostapi;
pub mod loader;
pub mod registry;

pub use exec::ExecRegion;
pub use loader::{CallError, LoadError, LoadedVersion, ModuleLoader, UnloadError};
pub use registry::{valid_module_name, LoadedModule, ModuleRegistry, MAX_NAME_LEN};
