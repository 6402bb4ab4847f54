//! Diagnosis key record
//!
//! A `DiagnosisKey` is created from a validated submission (or a validated
//! federation batch) and never modified afterwards. `key_data` is the natural
//! key used for deduplication.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::utils;

/// Length of the opaque key material
pub const KEY_DATA_LENGTH: usize = 16;

/// A key is valid for at most one day of 10 minute intervals
pub const MAX_ROLLING_PERIOD: u32 = 144;

/// Highest transmission risk level
pub const MAX_TRANSMISSION_RISK_LEVEL: u8 = 8;

/// How the key owner's diagnosis was established
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportType {
    ConfirmedTest,
    SelfReport,
    Recursive,
    Revoked,
}

impl ReportType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportType::ConfirmedTest => "CONFIRMED_TEST",
            ReportType::SelfReport => "SELF_REPORT",
            ReportType::Recursive => "RECURSIVE",
            ReportType::Revoked => "REVOKED",
        }
    }
}

impl fmt::Display for ReportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CONFIRMED_TEST" => Ok(ReportType::ConfirmedTest),
            "SELF_REPORT" => Ok(ReportType::SelfReport),
            "RECURSIVE" => Ok(ReportType::Recursive),
            "REVOKED" => Ok(ReportType::Revoked),
            other => Err(CoreError::ValidationError(format!(
                "Unknown report type: {}",
                other
            ))),
        }
    }
}

/// A published diagnosis key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiagnosisKey {
    /// Opaque key material
    pub key_data: Vec<u8>,

    /// Start of validity, in 10 minute intervals since the epoch
    pub rolling_start_interval_number: u32,

    /// Validity in 10 minute intervals
    pub rolling_period: u32,

    pub transmission_risk_level: u8,

    /// Server-assigned, in hours since the epoch
    pub submission_timestamp: u32,

    pub origin_country: String,

    pub visited_countries: BTreeSet<String>,

    pub report_type: ReportType,

    pub days_since_onset_of_symptoms: Option<i32>,

    pub consent_to_federation: bool,
}

impl DiagnosisKey {
    /// Check the structural constraints every stored key satisfies
    pub fn validate(&self) -> Result<()> {
        if self.key_data.len() != KEY_DATA_LENGTH {
            return Err(CoreError::ValidationError(format!(
                "Key data must be {} bytes, got {}",
                KEY_DATA_LENGTH,
                self.key_data.len()
            )));
        }
        if self.rolling_start_interval_number == 0 {
            return Err(CoreError::ValidationError(
                "Rolling start interval number must be positive".to_string(),
            ));
        }
        if self.rolling_period == 0 || self.rolling_period > MAX_ROLLING_PERIOD {
            return Err(CoreError::ValidationError(format!(
                "Rolling period must be in 1..={}, got {}",
                MAX_ROLLING_PERIOD, self.rolling_period
            )));
        }
        if self.transmission_risk_level > MAX_TRANSMISSION_RISK_LEVEL {
            return Err(CoreError::ValidationError(format!(
                "Transmission risk level must be in 0..={}, got {}",
                MAX_TRANSMISSION_RISK_LEVEL, self.transmission_risk_level
            )));
        }
        validate_country_code(&self.origin_country)?;
        for country in &self.visited_countries {
            validate_country_code(country)?;
        }
        Ok(())
    }

    /// Rolling start must not lie in the future relative to `now`
    pub fn validate_not_in_future(&self, now: NaiveDateTime) -> Result<()> {
        let start = utils::rolling_interval_to_datetime(self.rolling_start_interval_number);
        if start > now {
            return Err(CoreError::ValidationError(format!(
                "Rolling start {} is in the future",
                start
            )));
        }
        Ok(())
    }

    /// End of the key's rolling validity window
    pub fn expiry_time(&self) -> NaiveDateTime {
        utils::rolling_interval_to_datetime(self.rolling_start_interval_number)
            + Duration::minutes(self.rolling_period as i64 * 10)
    }

    pub fn submission_time(&self) -> NaiveDateTime {
        utils::hour_to_datetime(self.submission_timestamp)
    }

    /// Earliest time at which the key may be handed to third parties.
    ///
    /// Keys submitted within `expiry_policy_minutes` of their expiry wait until
    /// the policy has elapsed after expiry, rounded up to the next full hour.
    /// Older keys are shareable from their submission hour.
    pub fn earliest_sharing_time(&self, expiry_policy_minutes: i64) -> NaiveDateTime {
        let submission = self.submission_time();
        let expiry = self.expiry_time();
        if (submission - expiry).num_minutes() <= expiry_policy_minutes {
            utils::truncate_to_hour(expiry + Duration::minutes(expiry_policy_minutes + 60))
        } else {
            submission
        }
    }

    pub fn can_share_at(&self, at: NaiveDateTime, expiry_policy_minutes: i64) -> bool {
        at >= self.earliest_sharing_time(expiry_policy_minutes)
    }

    /// Sort key used inside export payloads
    pub fn export_order(&self) -> (u32, &[u8]) {
        (self.rolling_start_interval_number, &self.key_data)
    }

    /// Position of the key in store iteration and upload cursor order
    pub fn position(&self) -> KeyPosition {
        KeyPosition {
            submission_timestamp: self.submission_timestamp,
            key_data: self.key_data.clone(),
        }
    }
}

/// Composite `(submission_timestamp, key_data)` position in the store order
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyPosition {
    pub submission_timestamp: u32,
    #[serde(with = "hex_bytes")]
    pub key_data: Vec<u8>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// Two uppercase ASCII letters
pub fn validate_country_code(code: &str) -> Result<()> {
    if code.len() == 2 && code.bytes().all(|b| b.is_ascii_uppercase()) {
        Ok(())
    } else {
        Err(CoreError::ValidationError(format!(
            "Invalid country code: {:?}",
            code
        )))
    }
}
