//! Hostlink SDK - run sandboxed WebAssembly plugins from Rust
//!
//! Plugins are wasm modules that read an input buffer, write an output
//! buffer and import host functions supplied by the embedder.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            User Code                    │
//! └─────────────────┬───────────────────────┘
//!                   ↓
//! ┌─────────────────────────────────────────┐
//! │     SDK                                 │
//! │  - Manifest: modules + sandbox policy   │
//! │  - Plugin: one live instance            │
//! │  - Function / CurrentPlugin: host calls │
//! └─────────────────┬───────────────────────┘
//!                   ↓
//! ┌─────────────────────────────────────────┐
//! │     hostlink-kernel (wasmtime)          │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use hostlink::{Function, Manifest, Plugin, UserData, PTR};
//!
//! let hello = Function::new("hello_world", [PTR], [PTR], UserData::<()>::none(), |plugin, _| {
//!     let name = plugin.input_str(0)?.to_string();
//!     plugin.output_str(&format!("hello {name}"), 0);
//!     Ok(())
//! })?;
//!
//! let manifest = Manifest::from_path("plugin.wasm").with_config("greeting", "hi");
//! let mut plugin = Plugin::from_manifest(&manifest, [hello], true)?;
//! let output = plugin.call("greet", "world")?;
//! ```

pub mod current_plugin;
pub mod error;
pub mod function;
pub mod logging;
pub mod manifest;
pub mod plugin;

// =============================================================================
// SDK surface
// =============================================================================

pub use current_plugin::CurrentPlugin;
pub use error::{Error, Result};
pub use function::{Function, UserData};
pub use logging::{set_log_file, version};
pub use manifest::{Manifest, Wasm, WasmSource};
pub use plugin::{Plugin, PluginBuilder};

// =============================================================================
// Kernel re-exports
// =============================================================================

pub use hostlink_kernel::{
    CancelHandle, DEFAULT_NAMESPACE, Kernel, KernelConfig, MemoryHandle, MemoryOptions,
    MemoryStats, PTR, PluginMemory, Val, ValType,
};

/// Direct access to the kernel crate.
pub mod kernel {
    pub use hostlink_kernel::*;
}
