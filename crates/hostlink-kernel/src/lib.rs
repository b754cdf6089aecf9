//! Hostlink kernel
//!
//! The engine behind the `hostlink` SDK:
//! - wasmtime engine with an epoch ticker for timeouts and cancellation
//! - per-instance kernel memory addressed by [`MemoryHandle`]s
//! - the `hostlink:host/env` guest imports (input, output, config, vars, logging, HTTP)
//! - manifest documents and module loading from bytes, paths and URLs
//! - host function registrations with typed signatures
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        Kernel                            │
//! │   Engine ── ModuleCache ── epoch ticker thread           │
//! └──────────────────────────────────────────────────────────┘
//!                            │ instantiate(ManifestDoc, HostFunctions)
//! ┌──────────────────────────────────────────────────────────┐
//! │                       Instance                           │
//! │  Store<InstanceState>                                    │
//! │   ├─ PluginMemory (kernel memory)                        │
//! │   ├─ input / output / error / config / vars              │
//! │   └─ WASI ctx (when enabled)                             │
//! │  Linker: hostlink:host/env + user namespaces + modules   │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod env;
pub mod error;
pub mod function;
pub mod instance;
pub mod kernel;
pub mod manifest;
pub mod memory;
pub mod types;

pub use config::KernelConfig;
pub use env::ENV_MODULE;
pub use error::{IntoKernelReport, KernelError, KernelReport, KernelResult};
pub use function::{CurrentInstance, DEFAULT_NAMESPACE, HostCallback, HostFunction};
pub use instance::{CancelHandle, Instance};
pub use kernel::{CacheStats, Kernel, ModuleCache};
pub use manifest::{ManifestDoc, MemoryOptions, SourceDoc, WasmDoc, sha256_hex};
pub use memory::{MemoryStats, PAGE_SIZE, PluginMemory};
pub use types::{MemoryHandle, PTR, Val, ValType};
