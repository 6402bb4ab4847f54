//! Error types for the federation client

use keyfed_core::CoreError;
use thiserror::Error;

/// Result type for the federation client
pub type Result<T> = std::result::Result<T, FederationError>;

/// Error type for the federation client
#[derive(Debug, Error)]
pub enum FederationError {
    /// Network failure, timeout or gateway-side server error
    #[error("Federation transport error: {0}")]
    Transport(String),

    /// The gateway refused a request
    #[error("Federation rejection: {0}")]
    Rejection(String),

    /// Unexpected status, header or body
    #[error("Federation protocol error: {0}")]
    Protocol(String),

    /// Store, signing or validation failure
    #[error("{0}")]
    Core(#[from] CoreError),

    #[error("Federation run cancelled")]
    Cancelled,

    #[error("A federation run is already in progress")]
    Locked,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl FederationError {
    /// Only transport failures are retried
    pub fn is_transient(&self) -> bool {
        matches!(self, FederationError::Transport(_))
    }
}

impl From<reqwest::Error> for FederationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            FederationError::Protocol(err.to_string())
        } else {
            FederationError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for FederationError {
    fn from(err: serde_json::Error) -> Self {
        FederationError::Protocol(err.to_string())
    }
}

/// Helper function to convert errors into protocol errors
pub fn to_protocol_error<E: std::fmt::Display>(err: E) -> FederationError {
    FederationError::Protocol(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transport_is_transient() {
        assert!(FederationError::Transport("timeout".to_string()).is_transient());
        assert!(!FederationError::Rejection("400".to_string()).is_transient());
        assert!(!to_protocol_error("bad header").is_transient());
        let core: FederationError = CoreError::StorageError("locked".to_string()).into();
        assert!(!core.is_transient());
    }
}
