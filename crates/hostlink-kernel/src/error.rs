//! Error types for `hostlink-kernel`.
//!
//! Instantiation goes through several fallible stages (fetching sources,
//! verifying hashes, compiling, linking) so it returns a [`KernelReport`]
//! carrying the stage as context. Per-call operations return the plain
//! [`KernelResult`].

use error_stack::Report;
use thiserror::Error;

/// Errors produced by the kernel.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KernelError {
    /// The manifest document could not be parsed or is empty.
    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    /// A wasm source could not be loaded.
    #[error("Failed to load wasm source: {0}")]
    Load(String),

    /// A wasm source did not match its declared hash.
    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    /// Module compilation failed.
    #[error("Failed to compile module: {0}")]
    Compilation(String),

    /// Linking or instantiation failed.
    #[error("Failed to instantiate module: {0}")]
    Instantiation(String),

    /// The requested export does not exist.
    #[error("Function not found: {0}")]
    FunctionNotFound(String),

    /// The guest trapped or reported an error.
    #[error("{0}")]
    Call(String),

    /// The call was interrupted through a cancel handle.
    #[error("Plugin call cancelled")]
    Cancelled,

    /// The call exceeded the manifest timeout.
    #[error("Plugin call timed out after {0}ms")]
    Timeout(u64),

    /// Plugin or kernel configuration is malformed.
    #[error("Config error: {0}")]
    Config(String),

    /// A host function used a value kind the bridge cannot carry.
    #[error("Unsupported value type: {0}")]
    UnsupportedValType(crate::types::ValType),

    /// A host function signature is invalid.
    #[error("Invalid host function `{name}`: {reason}")]
    InvalidFunction { name: String, reason: String },

    /// Kernel memory access outside of any block.
    #[error("Memory access out of bounds: offset={offset}, size={size}")]
    MemoryOutOfBounds { offset: u64, size: u64 },

    /// Kernel memory is exhausted.
    #[error("Memory allocation failed: requested {0} bytes")]
    AllocationFailed(u64),

    /// A host function callback failed.
    #[error("Host function error: {0}")]
    HostFunction(String),

    /// An outbound HTTP request from the guest failed or was denied.
    #[error("HTTP error: {0}")]
    Http(String),

    /// A low-level I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON (de)serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

/// Plain result alias for per-call operations.
pub type KernelResult<T> = Result<T, KernelError>;

/// Error-stack backed result alias for multi-stage operations.
pub type KernelReport<T> = Result<T, Report<KernelError>>;

/// Extension trait to convert `Result<T, KernelError>` into [`KernelReport<T>`].
pub trait IntoKernelReport<T> {
    /// Wrap the error in an `error_stack::Report`.
    fn into_report(self) -> KernelReport<T>;
}

impl<T> IntoKernelReport<T> for KernelResult<T> {
    #[inline]
    fn into_report(self) -> KernelReport<T> {
        self.map_err(Report::new)
    }
}

impl From<wasmtime::Error> for KernelError {
    fn from(err: wasmtime::Error) -> Self {
        KernelError::Internal(format!("{err:#}"))
    }
}
