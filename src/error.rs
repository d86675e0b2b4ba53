//! Error handling for memreclaim
//!
//! Every failure inside a reclaim pass is described by [`ReclaimError`].
//! None of these errors ever reach the caller of
//! [`clear_gpu_memory`](crate::clear_gpu_memory): the orchestration layer
//! matches on them at each step boundary and turns them into warnings.
//! They are still ordinary values so that backends can use `?` internally
//! and tests can assert on them.

// Re-export thiserror for convenience
pub use thiserror;

/// Unified error type for memreclaim
///
/// `Clone` so that a probe failure can be stored inside a
/// [`Probed::Broken`](crate::backend::Probed) and reported on every run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReclaimError {
    // ========== Library Errors ==========
    /// Shared library opened but a required entry point is missing
    #[error("Symbol {symbol} not found in {library}")]
    SymbolMissing { library: String, symbol: String },

    // ========== Runtime Errors ==========
    /// A runtime API call returned a non-success status code
    #[error("{api} failed with code {code}: {message}")]
    RuntimeCall {
        api: String,
        code: i32,
        message: String,
    },

    /// A device-specific operation failed
    #[error("Device {device} error: {reason}")]
    Device { device: String, reason: String },

    // ========== Host Errors ==========
    /// General host memory reclamation failed
    #[error("Host memory reclamation failed: {0}")]
    HostReclaim(String),

    // ========== Internal Errors ==========
    /// Internal error (indicates a bug)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReclaimError {
    /// Build a [`ReclaimError::RuntimeCall`] from an API name and status code
    pub fn runtime_call(api: &str, code: i32, message: impl Into<String>) -> Self {
        ReclaimError::RuntimeCall {
            api: api.to_string(),
            code,
            message: message.into(),
        }
    }
}

/// Result type alias for memreclaim operations
pub type ReclaimResult<T> = Result<T, ReclaimError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_call_display_includes_code_and_message() {
        let err = ReclaimError::runtime_call("hipMemPoolTrimTo", 1, "invalid argument");
        assert_eq!(
            err.to_string(),
            "hipMemPoolTrimTo failed with code 1: invalid argument"
        );
    }

    #[test]
    fn test_symbol_missing_display() {
        let err = ReclaimError::SymbolMissing {
            library: "libcudart.so".to_string(),
            symbol: "cudaMemPoolSetAttribute".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Symbol cudaMemPoolSetAttribute not found in libcudart.so"
        );
    }

    #[test]
    fn test_device_error_display() {
        let err = ReclaimError::Device {
            device: "cuda:1".to_string(),
            reason: "busy".to_string(),
        };
        assert_eq!(err.to_string(), "Device cuda:1 error: busy");
    }
}
