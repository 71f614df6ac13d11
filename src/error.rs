//! Error family shared by the driver contract and the pattern engine.
//!
//! Configuration mistakes (placeholder parameters at run time, unsupported
//! dimensionality, missing devices) surface synchronously and are fatal for
//! that call. Failures reported by a native runtime are wrapped in
//! [`Error::Native`] with a decoded status string plus an origin note, and
//! kernel build failures carry the captured build log. Teardown failures are
//! never returned; `Drop` implementations log them instead.

use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A placeholder parameter was still unbound when the pattern ran.
    #[error("parameter '{0}' is a placeholder without a bound value")]
    IncompleteParameter(String),

    /// A parameter name was referenced but never registered.
    #[error("no parameter named '{0}' is registered in this pattern")]
    UnknownParameter(String),

    /// PRESENT parameters must wrap an already-allocated device memory
    /// object, never a raw host pointer.
    #[error("parameter '{0}' is PRESENT but is not backed by a device memory object")]
    PresentWithoutMemory(String),

    /// A memory object cannot be both read-only and write-only.
    #[error("memory object for '{0}' was requested as both read-only and write-only")]
    ConflictingAccessFlags(String),

    /// The requested iteration space cannot be mapped onto the device.
    #[error("unsupported dimensionality: {0}")]
    UnsupportedDimensions(String),

    /// Dimensions must be populated contiguously starting from the X axis.
    #[error("the first (X) axis of the iteration space is not set")]
    MissingFirstAxis,

    /// The requested device index does not exist.
    #[error("no device at index {index} ({available} available)")]
    NoDevice { index: usize, available: usize },

    /// The pattern does not support batched execution.
    #[error("{0} does not support batched execution")]
    BatchingUnsupported(&'static str),

    /// A non-success status from the underlying native runtime.
    #[error("{message} ({details})")]
    Native { message: String, details: String },

    /// Kernel compilation failed; `log` holds the native build output.
    #[error("kernel compilation failed: {message}\n{log}")]
    Compilation { message: String, log: String },
}

impl Error {
    pub fn native(message: impl Into<String>, details: impl Into<String>) -> Self {
        Error::Native {
            message: message.into(),
            details: details.into(),
        }
    }
}

/// Expands to a `file:line` origin string for [`Error::Native`] details.
#[macro_export]
macro_rules! origin {
    () => {
        format!("{}:{}", file!(), line!())
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_error_carries_origin() {
        let err = Error::native("CUDA_ERROR_INVALID_VALUE", origin!());
        let text = err.to_string();
        assert!(text.contains("CUDA_ERROR_INVALID_VALUE"));
        assert!(text.contains("error.rs"));
    }

    #[test]
    fn compilation_error_appends_build_log() {
        let err = Error::Compilation {
            message: "program build returned CL_BUILD_PROGRAM_FAILURE".into(),
            log: "line 3: undeclared identifier 'foo'".into(),
        };
        assert!(err.to_string().contains("undeclared identifier"));
    }
}
