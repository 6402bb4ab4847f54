//! Key submission
//!
//! Turns a TAN-authorized upload from a device into stored diagnosis keys. The
//! TAN check itself lives outside this crate and is consumed through
//! `TanVerifier`. A submission is stored completely or not at all.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use chrono::{Duration, NaiveDateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::models::{validate_country_code, DiagnosisKey, ReportType};
use crate::store::KeyRecordStore;
use crate::utils;

/// Boolean credential check supplied by the verification service
#[cfg_attr(test, mockall::automock)]
pub trait TanVerifier: Send + Sync {
    fn verify(&self, tan: &str) -> bool;
}

/// One key as sent by a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedKey {
    pub key_data: Vec<u8>,
    pub rolling_start_interval_number: u32,
    pub rolling_period: u32,
    pub transmission_risk_level: u8,
    pub report_type: ReportType,
    pub days_since_onset_of_symptoms: Option<i32>,
}

/// Device submission
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionPayload {
    pub keys: Vec<SubmittedKey>,
    pub visited_countries: BTreeSet<String>,
    pub origin: Option<String>,
    pub consent_to_federation: bool,
}

/// Limits applied to device submissions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmissionConfig {
    pub min_keys: usize,
    pub max_keys: usize,
    pub default_origin_country: String,
    pub supported_countries: BTreeSet<String>,
    /// Keys whose rolling start is older than this are dropped silently
    pub retention_days: i64,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        SubmissionConfig {
            min_keys: 1,
            max_keys: 14,
            default_origin_country: "DE".to_string(),
            supported_countries: BTreeSet::from(["DE".to_string()]),
            retention_days: 14,
        }
    }
}

/// Validates and stores device submissions
pub struct SubmissionService<S: KeyRecordStore + ?Sized, V: TanVerifier + ?Sized> {
    store: Arc<S>,
    verifier: Arc<V>,
    config: SubmissionConfig,
}

impl<S: KeyRecordStore + ?Sized, V: TanVerifier + ?Sized> SubmissionService<S, V> {
    pub fn new(store: Arc<S>, verifier: Arc<V>, config: SubmissionConfig) -> Self {
        Self {
            store,
            verifier,
            config,
        }
    }

    pub fn submit(&self, tan: &str, payload: SubmissionPayload) -> Result<usize> {
        self.submit_at(tan, payload, Utc::now().naive_utc())
    }

    /// Verify, validate and store a submission received at `now`.
    /// Returns the number of newly stored keys.
    pub fn submit_at(&self, tan: &str, payload: SubmissionPayload, now: NaiveDateTime) -> Result<usize> {
        if !self.verifier.verify(tan) {
            warn!("Rejected submission with invalid TAN");
            return Err(CoreError::ValidationError("Invalid TAN".to_string()));
        }

        let count = payload.keys.len();
        if count < self.config.min_keys || count > self.config.max_keys {
            return Err(CoreError::ValidationError(format!(
                "Submission must contain {} to {} keys, got {}",
                self.config.min_keys, self.config.max_keys, count
            )));
        }

        let origin = payload
            .origin
            .clone()
            .unwrap_or_else(|| self.config.default_origin_country.clone());
        self.check_supported(&origin)?;
        let mut visited = payload.visited_countries.clone();
        for country in &visited {
            self.check_supported(country)?;
        }
        visited.insert(origin.clone());

        let mut seen = HashSet::new();
        for key in &payload.keys {
            if !seen.insert(key.key_data.as_slice()) {
                return Err(CoreError::ValidationError(
                    "Submission contains duplicate key data".to_string(),
                ));
            }
        }

        let submission_timestamp = utils::epoch_hours(now);
        let retention_start = now - Duration::days(self.config.retention_days);
        let mut keys = Vec::with_capacity(count);
        for submitted in payload.keys {
            let key = DiagnosisKey {
                key_data: submitted.key_data,
                rolling_start_interval_number: submitted.rolling_start_interval_number,
                rolling_period: submitted.rolling_period,
                transmission_risk_level: submitted.transmission_risk_level,
                submission_timestamp,
                origin_country: origin.clone(),
                visited_countries: visited.clone(),
                report_type: submitted.report_type,
                days_since_onset_of_symptoms: submitted.days_since_onset_of_symptoms,
                consent_to_federation: payload.consent_to_federation,
            };
            key.validate()?;
            key.validate_not_in_future(now)?;
            if utils::rolling_interval_to_datetime(key.rolling_start_interval_number) < retention_start {
                debug!("Dropping key {} older than retention", utils::key_prefix(&key.key_data));
                continue;
            }
            keys.push(key);
        }

        let stored = self.store.save(&keys)?;
        info!("Stored {} of {} submitted keys", stored, count);
        Ok(stored)
    }

    fn check_supported(&self, country: &str) -> Result<()> {
        validate_country_code(country)?;
        if !self.config.supported_countries.contains(country) {
            return Err(CoreError::ValidationError(format!(
                "Country {} is not supported",
                country
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::NaiveDate;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2020, 5, 1).unwrap().and_hms_opt(14, 30, 0).unwrap()
    }

    fn submitted(seed: u8) -> SubmittedKey {
        SubmittedKey {
            key_data: vec![seed; 16],
            // 2020-04-30T00:00Z
            rolling_start_interval_number: 2_647_008,
            rolling_period: 144,
            transmission_risk_level: 5,
            report_type: ReportType::ConfirmedTest,
            days_since_onset_of_symptoms: Some(2),
        }
    }

    fn service(valid: bool) -> (Arc<MemoryStore>, SubmissionService<MemoryStore, MockTanVerifier>) {
        let mut verifier = MockTanVerifier::new();
        verifier.expect_verify().withf(|tan| tan == "tan").return_const(valid);
        let store = Arc::new(MemoryStore::new());
        let service = SubmissionService::new(store.clone(), Arc::new(verifier), SubmissionConfig::default());
        (store, service)
    }

    #[test]
    fn test_submit_assigns_server_fields() {
        let (store, service) = service(true);
        let payload = SubmissionPayload {
            keys: vec![submitted(1), submitted(2)],
            consent_to_federation: true,
            ..Default::default()
        };
        assert_eq!(service.submit_at("tan", payload, now()).unwrap(), 2);

        let keys: Vec<DiagnosisKey> = store.find_since(0).unwrap().map(|k| k.unwrap()).collect();
        assert_eq!(keys.len(), 2);
        assert!(keys.iter().all(|k| k.submission_timestamp == utils::epoch_hours(now())));
        assert!(keys.iter().all(|k| k.origin_country == "DE" && k.consent_to_federation));
        assert!(keys.iter().all(|k| k.visited_countries.contains("DE")));
    }

    #[test]
    fn test_invalid_tan_stores_nothing() {
        let (store, service) = service(false);
        let payload = SubmissionPayload {
            keys: vec![submitted(1)],
            ..Default::default()
        };
        assert!(matches!(
            service.submit_at("tan", payload, now()),
            Err(CoreError::ValidationError(_))
        ));
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_one_invalid_key_rejects_whole_submission() {
        let (store, service) = service(true);
        let mut bad = submitted(2);
        bad.rolling_period = 0;
        let payload = SubmissionPayload {
            keys: vec![submitted(1), bad],
            ..Default::default()
        };
        assert!(service.submit_at("tan", payload, now()).is_err());
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_rejects_duplicates_and_unsupported_countries() {
        let (_, service) = service(true);
        let payload = SubmissionPayload {
            keys: vec![submitted(1), submitted(1)],
            ..Default::default()
        };
        assert!(service.submit_at("tan", payload, now()).is_err());

        let payload = SubmissionPayload {
            keys: vec![submitted(1)],
            visited_countries: BTreeSet::from(["XX".to_string()]),
            ..Default::default()
        };
        assert!(service.submit_at("tan", payload, now()).is_err());

        let payload = SubmissionPayload::default();
        assert!(service.submit_at("tan", payload, now()).is_err());
    }

    #[test]
    fn test_drops_keys_beyond_retention() {
        let (store, service) = service(true);
        let mut old = submitted(2);
        old.rolling_start_interval_number -= 144 * 20;
        let payload = SubmissionPayload {
            keys: vec![submitted(1), old],
            ..Default::default()
        };
        assert_eq!(service.submit_at("tan", payload, now()).unwrap(), 1);
        assert_eq!(store.count().unwrap(), 1);
    }
}
