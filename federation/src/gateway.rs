//! Federation gateway interface and wire types
//!
//! Keys travel as JSON with base64 key data. A batch is signed over a
//! canonical byte form of its keys sorted by key data, and every per-item
//! status the gateway reports is an index into that sorted order.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{Datelike, NaiveDate};
use keyfed_core::models::ReportType;
use keyfed_core::{DiagnosisKey, SigningProvider};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{to_protocol_error, Result};

/// Request and response header carrying the batch tag
pub const BATCH_TAG_HEADER: &str = "batchTag";

/// Download response header naming the following batch of the same date
pub const NEXT_BATCH_TAG_HEADER: &str = "nextBatchTag";

/// Base64 ed25519 signature over the canonical batch bytes
pub const BATCH_SIGNATURE_HEADER: &str = "batchSignature";

/// A callback endpoint registered with the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackRegistration {
    pub id: String,
    pub url: String,
}

/// Diagnosis key as exchanged with the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireKey {
    pub key_data: String,
    pub rolling_start_interval_number: u32,
    pub rolling_period: u32,
    pub transmission_risk_level: u8,
    #[serde(default)]
    pub visited_countries: Vec<String>,
    pub origin: String,
    pub report_type: ReportType,
    #[serde(default)]
    pub days_since_onset_of_symptoms: Option<i32>,
}

impl From<&DiagnosisKey> for WireKey {
    fn from(key: &DiagnosisKey) -> Self {
        WireKey {
            key_data: STANDARD.encode(&key.key_data),
            rolling_start_interval_number: key.rolling_start_interval_number,
            rolling_period: key.rolling_period,
            transmission_risk_level: key.transmission_risk_level,
            visited_countries: key.visited_countries.iter().cloned().collect(),
            origin: key.origin_country.clone(),
            report_type: key.report_type,
            days_since_onset_of_symptoms: key.days_since_onset_of_symptoms,
        }
    }
}

impl WireKey {
    /// Turn a remote key into a local record. Remote keys never carry
    /// consent to be federated again.
    pub fn into_key(self, submission_timestamp: u32) -> Result<DiagnosisKey> {
        let key_data = STANDARD.decode(&self.key_data).map_err(to_protocol_error)?;
        Ok(DiagnosisKey {
            key_data,
            rolling_start_interval_number: self.rolling_start_interval_number,
            rolling_period: self.rolling_period,
            transmission_risk_level: self.transmission_risk_level,
            submission_timestamp,
            origin_country: self.origin,
            visited_countries: self.visited_countries.into_iter().collect(),
            report_type: self.report_type,
            days_since_onset_of_symptoms: self.days_since_onset_of_symptoms,
            consent_to_federation: false,
        })
    }
}

/// JSON body of upload requests and download responses
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireBatch {
    pub keys: Vec<WireKey>,
}

/// Per-item outcome of an upload, as indices into the signed batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchUploadResponse {
    #[serde(rename = "201", default)]
    pub status201: Vec<usize>,
    #[serde(rename = "409", default)]
    pub status409: Vec<usize>,
    #[serde(rename = "400", default)]
    pub status400: Vec<usize>,
    #[serde(rename = "500", default)]
    pub status500: Vec<usize>,
}

impl BatchUploadResponse {
    /// Every item of a batch of `len` keys accepted
    pub fn all_accepted(len: usize) -> Self {
        BatchUploadResponse {
            status201: (0..len).collect(),
            ..Default::default()
        }
    }

    /// Every item of a batch of `len` keys already present
    pub fn all_present(len: usize) -> Self {
        BatchUploadResponse {
            status409: (0..len).collect(),
            ..Default::default()
        }
    }

    pub fn is_accepted(&self, index: usize) -> bool {
        self.status201.contains(&index) || self.status409.contains(&index)
    }
}

/// Keys signed as one upload batch
#[derive(Debug, Clone)]
pub struct SignedBatch {
    pub batch_tag: String,
    /// Sorted by key data
    pub keys: Vec<DiagnosisKey>,
    pub signature: Vec<u8>,
}

impl SignedBatch {
    pub fn sign(batch_tag: String, mut keys: Vec<DiagnosisKey>, signer: &SigningProvider) -> Result<Self> {
        keys.sort_by(|a, b| a.key_data.cmp(&b.key_data));
        let signature = signer.sign(&canonical_bytes(&keys))?;
        Ok(SignedBatch {
            batch_tag,
            keys,
            signature,
        })
    }

    pub fn signature_base64(&self) -> String {
        STANDARD.encode(&self.signature)
    }

    pub fn to_wire(&self) -> WireBatch {
        WireBatch {
            keys: self.keys.iter().map(WireKey::from).collect(),
        }
    }
}

/// A batch fetched from the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedBatch {
    pub batch_tag: String,
    pub next_batch_tag: Option<String>,
    pub keys: Vec<WireKey>,
    pub signature: Option<Vec<u8>>,
}

/// Canonical bytes a batch signature covers.
///
/// Keys are taken in key data order. Per key the base64 fields are joined
/// with `.`; the visited countries (sorted, comma separated) run directly into
/// the origin.
pub fn canonical_bytes(keys: &[DiagnosisKey]) -> Vec<u8> {
    let mut sorted: Vec<&DiagnosisKey> = keys.iter().collect();
    sorted.sort_by(|a, b| a.key_data.cmp(&b.key_data));

    let mut out = String::new();
    for key in sorted {
        let report_type = match key.report_type {
            ReportType::ConfirmedTest => 1i32,
            ReportType::SelfReport => 3,
            ReportType::Recursive => 4,
            ReportType::Revoked => 5,
        };
        let visited = key.visited_countries.iter().cloned().collect::<Vec<_>>().join(",");

        out.push_str(&STANDARD.encode(&key.key_data));
        out.push('.');
        out.push_str(&STANDARD.encode((key.rolling_start_interval_number as i32).to_be_bytes()));
        out.push('.');
        out.push_str(&STANDARD.encode((key.rolling_period as i32).to_be_bytes()));
        out.push('.');
        out.push_str(&STANDARD.encode((key.transmission_risk_level as i32).to_be_bytes()));
        out.push('.');
        out.push_str(&STANDARD.encode(visited.as_bytes()));
        out.push_str(&STANDARD.encode(key.origin_country.as_bytes()));
        out.push('.');
        out.push_str(&STANDARD.encode(report_type.to_be_bytes()));
        out.push('.');
        out.push_str(&STANDARD.encode(key.days_since_onset_of_symptoms.unwrap_or(0).to_be_bytes()));
        out.push('.');
    }
    out.into_bytes()
}

/// `{year}-{month}-{day}-{random}-{counter}`, unique per upload run
pub fn batch_tag(date: NaiveDate, counter: usize) -> String {
    let mut random = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut random);
    format!(
        "{}-{}-{}-{}-{}",
        date.year(),
        date.month(),
        date.day(),
        URL_SAFE_NO_PAD.encode(random),
        counter
    )
}

/// Remote federation gateway
#[async_trait]
pub trait FederationGateway: Send + Sync {
    async fn list_callbacks(&self) -> Result<Vec<CallbackRegistration>>;

    async fn put_callback(&self, registration: &CallbackRegistration) -> Result<()>;

    async fn upload_batch(&self, batch: &SignedBatch) -> Result<BatchUploadResponse>;

    /// First batch of `date` when `batch_tag` is `None`. `Ok(None)` when the
    /// gateway has no such batch.
    async fn download_batch(&self, date: NaiveDate, batch_tag: Option<&str>) -> Result<Option<DownloadedBatch>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::key;
    use keyfed_core::crypto::verify_with;

    #[test]
    fn test_wire_key_round_trip_drops_consent() {
        let original = key(7, "DE", &["FR", "DE"], 100);
        let wire = WireKey::from(&original);
        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json["origin"], "DE");
        assert_eq!(json["reportType"], "CONFIRMED_TEST");
        assert_eq!(json["visitedCountries"], serde_json::json!(["DE", "FR"]));

        let back = wire.into_key(200).unwrap();
        assert_eq!(back.key_data, original.key_data);
        assert_eq!(back.submission_timestamp, 200);
        assert!(!back.consent_to_federation);
    }

    #[test]
    fn test_bad_base64_is_protocol_error() {
        let mut wire = WireKey::from(&key(1, "DE", &[], 1));
        wire.key_data = "%%%".to_string();
        assert!(matches!(wire.into_key(1), Err(crate::FederationError::Protocol(_))));
    }

    #[test]
    fn test_canonical_bytes_layout() {
        let k = key(1, "DE", &["FR", "DE"], 1);
        let text = String::from_utf8(canonical_bytes(&[k.clone()])).unwrap();
        let fields: Vec<&str> = text.trim_end_matches('.').split('.').collect();
        assert_eq!(fields.len(), 7);
        assert_eq!(fields[0], STANDARD.encode(&k.key_data));
        assert_eq!(
            fields[4],
            format!("{}{}", STANDARD.encode("DE,FR"), STANDARD.encode("DE"))
        );
    }

    #[test]
    fn test_canonical_bytes_ignore_input_order() {
        let a = key(1, "DE", &["DE"], 1);
        let b = key(2, "DE", &["DE"], 1);
        assert_eq!(
            canonical_bytes(&[a.clone(), b.clone()]),
            canonical_bytes(&[b, a])
        );
    }

    #[test]
    fn test_signed_batch_sorts_and_verifies() {
        let signer = crate::testing::signer();
        let batch = SignedBatch::sign(
            "tag".to_string(),
            vec![key(9, "DE", &[], 1), key(3, "DE", &[], 1)],
            &signer,
        )
        .unwrap();
        assert_eq!(batch.keys[0].key_data[0], 3);
        assert!(verify_with(
            &signer.verifying_key(),
            &canonical_bytes(&batch.keys),
            &batch.signature
        ));
        assert_eq!(STANDARD.decode(batch.signature_base64()).unwrap(), batch.signature);
    }

    #[test]
    fn test_upload_response_json() {
        let response: BatchUploadResponse =
            serde_json::from_str(r#"{"201": [0, 2], "409": [1], "500": [3]}"#).unwrap();
        assert!(response.is_accepted(1));
        assert!(!response.is_accepted(3));
        assert!(response.status400.is_empty());
    }

    #[test]
    fn test_batch_tag_format() {
        let date = NaiveDate::from_ymd_opt(2020, 9, 1).unwrap();
        let tag = batch_tag(date, 3);
        assert!(tag.starts_with("2020-9-1-"));
        assert!(tag.ends_with("-3"));
        assert_ne!(batch_tag(date, 3), tag);
    }
}
