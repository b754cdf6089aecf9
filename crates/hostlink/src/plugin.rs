//! Plugin sessions
//!
//! A [`Plugin`] owns one kernel instance plus the host functions linked into
//! it. Calls take `&mut self`; share a session across threads by wrapping it
//! in a mutex, or give each thread its own.

use std::collections::BTreeMap;
use std::sync::Arc;

use hostlink_kernel::{CancelHandle, HostFunction, Instance, Kernel, MemoryStats};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::function::Function;
use crate::manifest::Manifest;

/// A live plugin instance.
#[derive(Debug)]
pub struct Plugin {
    instance: Instance,
    functions: Vec<Function>,
}

impl Plugin {
    /// Build a plugin from a wasm binary, WAT text or a JSON manifest.
    pub fn new(
        wasm: impl AsRef<[u8]>,
        functions: impl IntoIterator<Item = Function>,
        with_wasi: bool,
    ) -> Result<Self> {
        PluginBuilder::from_bytes(wasm.as_ref())
            .with_functions(functions)
            .with_wasi(with_wasi)
            .build()
    }

    pub fn from_manifest(
        manifest: &Manifest,
        functions: impl IntoIterator<Item = Function>,
        with_wasi: bool,
    ) -> Result<Self> {
        PluginBuilder::from_manifest(manifest)
            .with_functions(functions)
            .with_wasi(with_wasi)
            .build()
    }

    /// Instance id, also used as the `plugin_id` log field.
    pub fn id(&self) -> &str {
        self.instance.id()
    }

    /// Call the export `name` with `input` and return its output.
    ///
    /// The output borrows the session and is replaced by the next call.
    pub fn call(&mut self, name: &str, input: impl AsRef<[u8]>) -> Result<&[u8]> {
        self.instance.call(name, input.as_ref()).map_err(Error::call)
    }

    /// Like [`Plugin::call`], decoding the output as UTF-8.
    pub fn call_str(&mut self, name: &str, input: impl AsRef<[u8]>) -> Result<&str> {
        let output = self.call(name, input)?;
        Ok(std::str::from_utf8(output)?)
    }

    pub fn function_exists(&self, name: &str) -> bool {
        self.instance.function_exists(name)
    }

    /// Merge a JSON object of config values; `null` removes a key.
    pub fn config(&mut self, json: impl AsRef<[u8]>) -> Result<()> {
        self.instance.set_config(json.as_ref()).map_err(Error::config)
    }

    pub fn set_config(&mut self, values: &BTreeMap<String, String>) -> Result<()> {
        let json = serde_json::to_vec(values)?;
        self.config(json)
    }

    /// Current config values.
    pub fn config_values(&self) -> &BTreeMap<String, String> {
        self.instance.config()
    }

    /// A handle that interrupts the running call from another thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.instance.cancel_handle()
    }

    /// Free all kernel memory. Handles from earlier calls become invalid;
    /// config and variables are kept.
    pub fn reset(&mut self) -> bool {
        self.instance.reset()
    }

    /// Message the guest recorded as an error during the last call.
    pub fn error(&self) -> Option<&str> {
        self.instance.error()
    }

    /// Kernel memory usage of this instance.
    pub fn memory_stats(&self) -> MemoryStats {
        self.instance.memory_stats()
    }

    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    /// Free the instance now instead of at drop.
    pub fn close(self) {
        debug!(plugin_id = %self.id(), "Closing plugin");
    }
}

enum Source<'a> {
    Bytes(&'a [u8]),
    Manifest(&'a Manifest),
}

/// Builder for [`Plugin`].
///
/// # Example
///
/// ```ignore
/// let plugin = PluginBuilder::from_manifest(&manifest)
///     .with_wasi(true)
///     .with_function(hello_world)
///     .build()?;
/// ```
pub struct PluginBuilder<'a> {
    source: Source<'a>,
    functions: Vec<Function>,
    with_wasi: bool,
    kernel: Option<Kernel>,
}

impl<'a> PluginBuilder<'a> {
    pub fn from_bytes(bytes: &'a [u8]) -> Self {
        Self::with_source(Source::Bytes(bytes))
    }

    pub fn from_manifest(manifest: &'a Manifest) -> Self {
        Self::with_source(Source::Manifest(manifest))
    }

    fn with_source(source: Source<'a>) -> Self {
        Self {
            source,
            functions: Vec::new(),
            with_wasi: false,
            kernel: None,
        }
    }

    pub fn with_wasi(mut self, with_wasi: bool) -> Self {
        self.with_wasi = with_wasi;
        self
    }

    pub fn with_function(mut self, function: Function) -> Self {
        self.functions.push(function);
        self
    }

    pub fn with_functions(mut self, functions: impl IntoIterator<Item = Function>) -> Self {
        self.functions.extend(functions);
        self
    }

    /// Use a specific kernel instead of the process-wide one.
    pub fn with_kernel(mut self, kernel: Kernel) -> Self {
        self.kernel = Some(kernel);
        self
    }

    pub fn build(self) -> Result<Plugin> {
        let kernel = match self.kernel {
            Some(kernel) => kernel,
            None => Kernel::shared().map_err(|e| Error::Instantiation(e.to_string()))?,
        };
        let host_functions: Vec<Arc<HostFunction>> = self
            .functions
            .iter()
            .map(|f| Arc::clone(f.host_function()))
            .collect();

        let instance = match self.source {
            Source::Bytes(bytes) => kernel.instantiate(bytes, &host_functions, self.with_wasi),
            Source::Manifest(manifest) => kernel.instantiate_manifest(
                &manifest.as_document(),
                &host_functions,
                self.with_wasi,
            ),
        }
        .map_err(Error::instantiation)?;

        info!(
            plugin_id = %instance.id(),
            functions = self.functions.len(),
            wasi = self.with_wasi,
            "Plugin ready"
        );
        Ok(Plugin {
            instance,
            functions: self.functions,
        })
    }
}
