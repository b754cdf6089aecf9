//! SDK error type.

use error_stack::Report;
use hostlink_kernel::{KernelError, ValType};
use thiserror::Error;

/// Errors returned by the SDK.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The plugin could not be built from its manifest or bytes.
    #[error("Failed to instantiate plugin: {0}")]
    Instantiation(String),

    /// A plugin call failed: trap, guest error, cancel, timeout or missing export.
    #[error("{0}")]
    Call(String),

    /// A config update was rejected.
    #[error("Config error: {0}")]
    Config(String),

    /// An input or output slot index is past the function's arity.
    #[error("{kind} index {index} out of range (arity {arity})")]
    OutOfRange {
        kind: &'static str,
        index: usize,
        arity: usize,
    },

    /// A slot holds a different value kind than requested.
    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: ValType, actual: ValType },

    /// A host function signature was rejected.
    #[error("Host function registration failed: {0}")]
    Registration(String),

    /// Kernel memory could not be allocated or a handle is not live.
    #[error("Memory error: {0}")]
    Memory(String),

    #[error("Invalid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// SDK result alias.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn instantiation(report: Report<KernelError>) -> Self {
        tracing::debug!(error = ?report, "Instantiation failed");
        Error::Instantiation(report.current_context().to_string())
    }

    pub(crate) fn call(err: KernelError) -> Self {
        Error::Call(err.to_string())
    }

    pub(crate) fn config(err: KernelError) -> Self {
        match err {
            KernelError::Config(msg) => Error::Config(msg),
            other => Error::Config(other.to_string()),
        }
    }

    pub(crate) fn memory(err: KernelError) -> Self {
        Error::Memory(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_display() {
        let err = Error::OutOfRange {
            kind: "input",
            index: 3,
            arity: 1,
        };
        assert_eq!(err.to_string(), "input index 3 out of range (arity 1)");
    }

    #[test]
    fn kernel_errors_map_by_operation() {
        let err = Error::call(KernelError::Timeout(100));
        assert!(matches!(err, Error::Call(_)));
        assert!(err.to_string().contains("100ms"));

        let err = Error::config(KernelError::Config("bad".into()));
        assert_eq!(err.to_string(), "Config error: bad");

        let err = Error::instantiation(Report::new(KernelError::InvalidManifest(
            "manifest contains no wasm modules".into(),
        )));
        assert!(matches!(err, Error::Instantiation(_)));
        assert!(err.to_string().contains("no wasm modules"));
    }
}
