//! Error kinds for shellcraft operations

use std::fmt;

/// The kind of error that occurred.
///
/// Session outcomes (budget, malformed replies, cancellation) are not errors;
/// these kinds cover infrastructure and configuration problems only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // =========================================================================
    // General errors
    // =========================================================================
    /// Invalid configuration or parameters
    ConfigInvalid,

    /// Invalid argument passed to a function
    InvalidArgument,

    // =========================================================================
    // Shell execution errors
    // =========================================================================
    /// The shell subprocess could not be started
    SpawnFailed,

    // =========================================================================
    // Model errors
    // =========================================================================
    /// Model inference failed
    InferenceFailed,

    /// Model service not reachable
    ProviderUnavailable,

    /// Rate limit exceeded
    RateLimited,

    /// Credentials rejected by the model service
    AuthenticationFailed,

    // =========================================================================
    // IO / parse errors
    // =========================================================================
    /// File not found
    FileNotFound,

    /// Permission denied
    PermissionDenied,

    /// IO operation failed
    IoFailed,

    /// Network error
    NetworkFailed,

    /// Failed to parse input
    ParseFailed,

    /// Serialization/deserialization failed
    SerializationFailed,
}

impl ErrorKind {
    /// Returns the error kind as a static string
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConfigInvalid => "ConfigInvalid",
            ErrorKind::InvalidArgument => "InvalidArgument",

            ErrorKind::SpawnFailed => "SpawnFailed",

            ErrorKind::InferenceFailed => "InferenceFailed",
            ErrorKind::ProviderUnavailable => "ProviderUnavailable",
            ErrorKind::RateLimited => "RateLimited",
            ErrorKind::AuthenticationFailed => "AuthenticationFailed",

            ErrorKind::FileNotFound => "FileNotFound",
            ErrorKind::PermissionDenied => "PermissionDenied",
            ErrorKind::IoFailed => "IoFailed",
            ErrorKind::NetworkFailed => "NetworkFailed",
            ErrorKind::ParseFailed => "ParseFailed",
            ErrorKind::SerializationFailed => "SerializationFailed",
        }
    }

    /// Check if this error kind is retryable by default
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::NetworkFailed | ErrorKind::RateLimited | ErrorKind::ProviderUnavailable
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_display() {
        assert_eq!(ErrorKind::SpawnFailed.to_string(), "SpawnFailed");
        assert_eq!(ErrorKind::RateLimited.to_string(), "RateLimited");
    }

    #[test]
    fn test_is_retryable() {
        assert!(ErrorKind::NetworkFailed.is_retryable());
        assert!(ErrorKind::RateLimited.is_retryable());
        assert!(!ErrorKind::SpawnFailed.is_retryable());
        assert!(!ErrorKind::AuthenticationFailed.is_retryable());
        assert!(!ErrorKind::ConfigInvalid.is_retryable());
    }
}
