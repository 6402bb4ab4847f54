//! Error types for the distribution service

use std::io;

use keyfed_core::CoreError;
use thiserror::Error;

/// Result type for the distribution service
pub type Result<T> = std::result::Result<T, DistributionError>;

/// Error type for the distribution service
#[derive(Debug, Error)]
pub enum DistributionError {
    /// Key model, tree, signing or store failure
    #[error("{0}")]
    Core(#[from] CoreError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The run was cancelled before it published
    #[error("Distribution run cancelled")]
    Cancelled,

    /// Another run holds the run lock
    #[error("A distribution run is already in progress")]
    Locked,

    /// Staging, swapping or rotating generations failed
    #[error("Publish error: {0}")]
    Publish(String),
}

impl DistributionError {
    /// Whether the previously published generation is guaranteed untouched
    pub fn leaves_publication_intact(&self) -> bool {
        !matches!(self, DistributionError::Publish(_))
    }
}

/// Helper function to convert errors into publish errors
pub fn to_publish_error<E: std::fmt::Display>(err: E) -> DistributionError {
    DistributionError::Publish(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_errors_keep_their_message() {
        let err: DistributionError =
            CoreError::StructuralIntegrityError("orphan".to_string()).into();
        assert_eq!(err.to_string(), "Structural integrity error: orphan");
        assert!(err.leaves_publication_intact());
        assert!(!to_publish_error("rename failed").leaves_publication_intact());
    }
}
