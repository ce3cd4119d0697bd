//! Error types for shellcraft-core
//!
//! Re-exports shellcraft-error and provides core-specific conveniences.

pub use shellcraft_error::{Error, ErrorKind, ErrorStatus, Result};

// =============================================================================
// Core-specific error constructors
// =============================================================================

/// Create a ConfigInvalid error
pub fn config_invalid(message: impl Into<String>) -> Error {
    Error::config_invalid(message)
}

/// Create a SpawnFailed error for the given shell program
pub fn spawn_failed(shell: impl Into<String>, reason: impl Into<String>) -> Error {
    Error::spawn_failed(shell, reason)
}

/// Create a SerializationFailed error
pub fn serialization_error(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::SerializationFailed, message)
}

/// Create an InvalidArgument error
pub fn invalid_argument(message: impl Into<String>) -> Error {
    Error::invalid_argument(message)
}
