//! Error types for the Aurora Iceberg REST server.
//!
//! Library code returns [`AuroraError`]; configuration problems are reported
//! through [`ConfigError`], which always names the offending key.

use crate::types::ServerState;
use std::io;
use thiserror::Error;

/// Result type alias using AuroraError as the error type.
pub type Result<T> = std::result::Result<T, AuroraError>;

/// Top-level error type for server runtime operations.
#[derive(Debug, Error)]
pub enum AuroraError {
    /// Configuration failed validation (reported before any socket is opened)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The listening address is already bound by another socket
    #[error("Address already in use: {address}")]
    AddressInUse { address: String },

    /// Key material could not be loaded or the TLS context could not be built
    #[error("TLS configuration error: {reason}")]
    TlsConfiguration { reason: String },

    /// A lifecycle operation was invoked from a state that does not allow it
    #[error("Cannot {operation} server in state {from}")]
    InvalidStateTransition {
        from: ServerState,
        operation: &'static str,
    },

    /// Admission control rejected work at capacity
    #[error("Server overloaded: {reason}")]
    Overloaded { reason: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Internal errors that shouldn't normally occur
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuroraError {
    /// Creates a TLS configuration error.
    pub fn tls(reason: impl Into<String>) -> Self {
        Self::TlsConfiguration {
            reason: reason.into(),
        }
    }

    /// Creates an invalid state transition error.
    pub fn invalid_transition(from: ServerState, operation: &'static str) -> Self {
        Self::InvalidStateTransition { from, operation }
    }

    pub fn overloaded(reason: impl Into<String>) -> Self {
        Self::Overloaded {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal(reason.into())
    }

    /// Returns true if the caller can retry after backing off.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Overloaded { .. } | Self::AddressInUse { .. })
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {reason}")]
    LoadFailed { path: String, reason: String },

    /// Missing required configuration field
    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    /// Configured component is not known to this build
    #[error("Unsupported {kind} '{name}'")]
    Unsupported { kind: &'static str, name: String },
}

impl ConfigError {
    /// Creates a file not found error.
    pub fn file_not_found(path: impl Into<String>) -> Self {
        Self::FileNotFound { path: path.into() }
    }

    /// Creates a load failure error.
    pub fn load_failed(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::LoadFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates a missing field error.
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    /// Creates an invalid value error.
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn unsupported(kind: &'static str, name: impl Into<String>) -> Self {
        Self::Unsupported {
            kind,
            name: name.into(),
        }
    }

    /// The configuration key this error refers to, when there is one.
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::MissingField { field } | Self::InvalidValue { field, .. } => Some(field),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_helpers() {
        let err = ConfigError::invalid_value("min.threads", "must be positive");
        assert_eq!(err.field(), Some("min.threads"));
        assert!(err.to_string().contains("min.threads"));

        let err = ConfigError::missing_field("keystore.path");
        assert_eq!(err.field(), Some("keystore.path"));

        let err = ConfigError::unsupported("catalog backend", "hive");
        assert_eq!(err.field(), None);
        assert_eq!(err.to_string(), "Unsupported catalog backend 'hive'");
    }

    #[test]
    fn test_config_error_converts() {
        let err: AuroraError = ConfigError::missing_field("host").into();
        assert!(matches!(err, AuroraError::Config(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = AuroraError::invalid_transition(ServerState::Running, "initialize");
        assert_eq!(err.to_string(), "Cannot initialize server in state RUNNING");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        let err: AuroraError = io_err.into();
        assert!(matches!(err, AuroraError::Io(_)));
    }

    #[test]
    fn test_overloaded_is_transient() {
        assert!(AuroraError::overloaded("queue full").is_transient());
        assert!(!AuroraError::tls("bad key").is_transient());
    }
}
