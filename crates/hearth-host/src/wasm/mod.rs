//! WebAssembly modules as a module loader
//!
//! Each exported function becomes a host function on a fresh exports object.
//! Modules talk back to the runtime through the `hearth` import module.

mod engine;
mod loader;

pub use engine::create_engine;
pub use loader::{HOST_IMPORT_MODULE, WasmHostState, WasmModuleLoader};
