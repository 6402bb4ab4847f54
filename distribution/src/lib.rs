//! keyfed distribution service
//!
//! Loads diagnosis keys from the key store, bundles them per country and
//! hour, signs every export and publishes the result as a new generation of
//! the export tree.

// Error types and result
pub mod error;
pub use error::{DistributionError, Result};

// Configuration
pub mod config;
pub use config::{DistributionConfig, EmptyPartitionPolicy};

// Key bundling and tree assembly
pub mod assembly;
pub mod bundler;
pub use bundler::{DiagnosisKeyBundler, DistributionBundle};

// Publishing
pub mod publish;
pub mod runner;
pub use publish::Publisher;
pub use runner::{DistributionRunner, RunReport, RunState};

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::BTreeSet;

    use chrono::{NaiveDate, NaiveDateTime};
    use keyfed_core::models::ReportType;
    use keyfed_core::utils::epoch_hours;
    use keyfed_core::{DiagnosisKey, SigningProvider};

    /// `hour`:00 on 2020-05-`day`
    pub fn at(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2020, 5, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    /// Key valid on 2020-04-28, long expired by any submission in May
    pub fn key(seed: u8, origin: &str, visited: &[&str], submitted: NaiveDateTime) -> DiagnosisKey {
        DiagnosisKey {
            key_data: vec![seed; 16],
            rolling_start_interval_number: 2_646_720,
            rolling_period: 144,
            transmission_risk_level: 4,
            submission_timestamp: epoch_hours(submitted),
            origin_country: origin.to_string(),
            visited_countries: visited.iter().map(|c| c.to_string()).collect::<BTreeSet<_>>(),
            report_type: ReportType::ConfirmedTest,
            days_since_onset_of_symptoms: Some(1),
            consent_to_federation: true,
        }
    }

    pub fn signer() -> SigningProvider {
        SigningProvider::from_seed([1u8; 32], "keyfed", "v1").unwrap()
    }
}
