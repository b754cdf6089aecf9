//! Kernel configuration
//!
//! Loaded with the `config` crate from an optional file plus `HOSTLINK_*`
//! environment variables (nested keys use `__`).

use config::{Config as Cfg, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "HOSTLINK";

/// Engine-wide settings shared by every instance of one [`crate::Kernel`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Interval of the epoch ticker; bounds timeout and cancel latency.
    pub epoch_tick_ms: u64,
    /// Upper bound of each instance's kernel memory, in 64KB pages.
    pub max_kernel_memory_pages: u64,
    /// Upper bound of the guest's own linear memory, in 64KB pages.
    pub max_guest_memory_pages: Option<u64>,
    /// Number of compiled modules kept for reuse.
    pub module_cache_size: usize,
    /// Fuel granted to each call, `None` disables fuel metering.
    pub fuel_per_call: Option<u64>,
    /// Whether WASI guests share the host's stdio.
    pub inherit_stdio: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            epoch_tick_ms: 10,
            max_kernel_memory_pages: 1024,
            max_guest_memory_pages: None,
            module_cache_size: 64,
            fuel_per_call: None,
            inherit_stdio: true,
        }
    }
}

impl KernelConfig {
    pub fn with_epoch_tick_ms(mut self, ms: u64) -> Self {
        self.epoch_tick_ms = ms.max(1);
        self
    }

    pub fn with_max_kernel_memory_pages(mut self, pages: u64) -> Self {
        self.max_kernel_memory_pages = pages;
        self
    }

    pub fn with_max_guest_memory_pages(mut self, pages: u64) -> Self {
        self.max_guest_memory_pages = Some(pages);
        self
    }

    pub fn with_module_cache_size(mut self, size: usize) -> Self {
        self.module_cache_size = size;
        self
    }

    pub fn with_fuel_per_call(mut self, fuel: u64) -> Self {
        self.fuel_per_call = Some(fuel);
        self
    }

    pub fn with_inherit_stdio(mut self, inherit: bool) -> Self {
        self.inherit_stdio = inherit;
        self
    }

    /// Defaults overridden by `HOSTLINK_*` environment variables.
    pub fn from_env() -> KernelResult<Self> {
        Self::build(None, env_source())
    }

    /// Parse from a string in the given format, then apply the environment.
    pub fn from_str(content: &str, format: FileFormat) -> KernelResult<Self> {
        Self::build(Some((content, format)), env_source())
    }

    /// Load from a file (format by extension), then apply the environment.
    pub fn load(path: &str) -> KernelResult<Self> {
        let format = detect_format(path)?;
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content, format)
    }

    fn build(file: Option<(&str, FileFormat)>, env: Environment) -> KernelResult<Self> {
        let mut builder = Cfg::builder();
        if let Some((content, format)) = file {
            builder = builder.add_source(File::from_str(content, format));
        }

        let config = builder
            .add_source(env)
            .build()
            .map_err(|e| KernelError::Config(e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| KernelError::Config(e.to_string()))
    }
}

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

/// Detect configuration format from file extension.
pub fn detect_format(path: &str) -> KernelResult<FileFormat> {
    let ext = std::path::Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .ok_or_else(|| KernelError::Config(format!("No file extension: {path}")))?;

    match ext.as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "toml" => Ok(FileFormat::Toml),
        "json" => Ok(FileFormat::Json),
        other => Err(KernelError::Config(format!("Unsupported format: {other}"))),
    }
}
