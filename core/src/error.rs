//! Error types for the core crate
//!
//! This module provides a consolidated error type for the core crate,
//! wrapping errors from persistence, signing and tree materialization.

use thiserror::Error;
use std::io;

/// Core error type
#[derive(Error, Debug)]
pub enum CoreError {
    /// Malformed key, submission or partition value
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Persistence layer failure
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Key material could not be loaded or a payload could not be signed
    #[error("Signing error: {0}")]
    SigningError(String),

    /// Orphaned, unprepared or otherwise inconsistent tree node
    #[error("Structural integrity error: {0}")]
    StructuralIntegrityError(String),

    /// Pop or peek on an empty path stack
    #[error("Empty stack")]
    EmptyStackError,

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Bincode error
    #[error("Bincode error: {0}")]
    BincodeError(#[from] bincode::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::StorageError(err.to_string())
    }
}

/// Result type for the core crate
pub type Result<T> = std::result::Result<T, CoreError>;

/// Convert a displayable error to a ValidationError
pub fn to_validation_error<E: std::fmt::Display>(err: E) -> CoreError {
    CoreError::ValidationError(err.to_string())
}

/// Convert a displayable error to a StorageError
pub fn to_storage_error<E: std::fmt::Display>(err: E) -> CoreError {
    CoreError::StorageError(err.to_string())
}

/// Convert a displayable error to a SigningError
pub fn to_signing_error<E: std::fmt::Display>(err: E) -> CoreError {
    CoreError::SigningError(err.to_string())
}

/// Convert a displayable error to a StructuralIntegrityError
pub fn to_structural_error<E: std::fmt::Display>(err: E) -> CoreError {
    CoreError::StructuralIntegrityError(err.to_string())
}

/// Convert a displayable error to a ConfigError
pub fn to_config_error<E: std::fmt::Display>(err: E) -> CoreError {
    CoreError::ConfigError(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let core_err: CoreError = io_err.into();

        match core_err {
            CoreError::IoError(_) => (),
            _ => panic!("Expected IoError"),
        }

        let sql_err = rusqlite::Error::InvalidQuery;
        let core_err: CoreError = sql_err.into();
        assert!(matches!(core_err, CoreError::StorageError(_)));
    }

    #[test]
    fn test_error_helpers() {
        let err = to_validation_error("rolling period must be positive");
        assert_eq!(err.to_string(), "Validation error: rolling period must be positive");

        let err = to_structural_error("node has no parent");
        assert!(matches!(err, CoreError::StructuralIntegrityError(_)));

        let err = to_signing_error("bad key");
        assert!(matches!(err, CoreError::SigningError(_)));

        assert_eq!(CoreError::EmptyStackError.to_string(), "Empty stack");
    }
}
