//! Data models for key distribution and federation
//!
//! This module provides the diagnosis key record and the bookkeeping
//! records used to track federation progress.

mod diagnosis_key;
mod federation;

pub use diagnosis_key::{
    validate_country_code, DiagnosisKey, KeyPosition, ReportType, KEY_DATA_LENGTH,
    MAX_ROLLING_PERIOD, MAX_TRANSMISSION_RISK_LEVEL,
};
pub use federation::{CursorDirection, FederationBatchInfo, FederationBatchStatus, FederationCursor};

#[cfg(test)]
pub(crate) use diagnosis_key::tests::key as test_key;

/// Domain constants for hashing
pub mod domains {
    /// Domain for published artifact digests
    pub const PUBLISHED_TREE: &str = "KEYFED_TREE";

    /// Domain for a single published file
    pub const PUBLISHED_FILE: &str = "KEYFED_FILE";
}
