//! # keyfed core
//!
//! Building blocks shared by the distribution and federation services: the
//! diagnosis key model, the persistent path stack, the writable export tree,
//! the signing provider and key persistence.

#![forbid(unsafe_code)]

pub mod config;
pub mod crypto;
pub mod error;
pub mod models;
pub mod stack;
pub mod store;
pub mod structure;
pub mod submission;
pub mod utils;

/// Re-export common types for ease of use
pub use crypto::{SignatureInfo, SigningProvider};
pub use error::{CoreError, Result};
pub use models::{DiagnosisKey, FederationBatchInfo, FederationBatchStatus, FederationCursor, KeyPosition, ReportType};
pub use stack::ImmutableStack;
pub use store::{open_store, FederationStateStore, KeyRecordStore, Store};
pub use structure::{IndexStack, IndexValue, NodeId, Tree};

/// Version of the core crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
