//! Export and signature files
//!
//! An export file is a fixed 16 byte header followed by a bincode encoded
//! `KeyExport`. Keys inside an export are sorted by rolling start interval
//! number, then key data, so the same key set always produces the same bytes.
//! The detached signature file signs the complete export file, header
//! included.

use chrono::NaiveDateTime;
use keyfed_core::error::{CoreError, Result};
use keyfed_core::models::ReportType;
use keyfed_core::structure::{FileSource, RenderContext};
use keyfed_core::utils::to_epoch_seconds;
use keyfed_core::{DiagnosisKey, SignatureInfo, SigningProvider};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const EXPORT_FILE_NAME: &str = "export.bin";
pub const SIGNATURE_FILE_NAME: &str = "export.sig";

/// Export header, right padded with spaces to `HEADER_LENGTH`
pub const EXPORT_HEADER: &str = "EK Export v1";
pub const HEADER_LENGTH: usize = 16;

/// Key as it appears in an export
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportKey {
    pub key_data: Vec<u8>,
    pub rolling_start_interval_number: u32,
    pub rolling_period: u32,
    pub transmission_risk_level: u8,
    pub report_type: ReportType,
    pub days_since_onset_of_symptoms: Option<i32>,
}

impl From<&DiagnosisKey> for ExportKey {
    fn from(key: &DiagnosisKey) -> Self {
        ExportKey {
            key_data: key.key_data.clone(),
            rolling_start_interval_number: key.rolling_start_interval_number,
            rolling_period: key.rolling_period,
            transmission_risk_level: key.transmission_risk_level,
            report_type: key.report_type,
            days_since_onset_of_symptoms: key.days_since_onset_of_symptoms,
        }
    }
}

/// Payload of `export.bin`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyExport {
    /// Start of the covered window, epoch seconds
    pub start_timestamp: i64,
    /// End of the covered window, epoch seconds, exclusive
    pub end_timestamp: i64,
    pub region: String,
    pub batch_num: u32,
    pub batch_size: u32,
    pub signature_infos: Vec<SignatureInfo>,
    pub keys: Vec<ExportKey>,
}

impl KeyExport {
    pub fn new(
        keys: &[DiagnosisKey],
        start: NaiveDateTime,
        end: NaiveDateTime,
        region: &str,
        signature_info: &SignatureInfo,
    ) -> Self {
        let mut sorted: Vec<&DiagnosisKey> = keys.iter().collect();
        sorted.sort_by(|a, b| a.export_order().cmp(&b.export_order()));
        sorted.dedup_by(|a, b| a.key_data == b.key_data);

        KeyExport {
            start_timestamp: to_epoch_seconds(start),
            end_timestamp: to_epoch_seconds(end),
            region: region.to_string(),
            batch_num: 1,
            batch_size: 1,
            signature_infos: vec![signature_info.clone()],
            keys: sorted.into_iter().map(ExportKey::from).collect(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = format!("{:<width$}", EXPORT_HEADER, width = HEADER_LENGTH).into_bytes();
        bytes.extend(bincode::serialize(self)?);
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LENGTH || !bytes.starts_with(EXPORT_HEADER.as_bytes()) {
            return Err(CoreError::ValidationError(
                "Missing export header".to_string(),
            ));
        }
        Ok(bincode::deserialize(&bytes[HEADER_LENGTH..])?)
    }
}

/// One signature over an export file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportSignature {
    pub signature_info: SignatureInfo,
    pub batch_num: u32,
    pub batch_size: u32,
    pub signature: Vec<u8>,
}

/// Payload of `export.sig`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureList {
    pub signatures: Vec<ExportSignature>,
}

impl SignatureList {
    pub fn sign(signer: &SigningProvider, export: &[u8]) -> Result<Self> {
        Ok(SignatureList {
            signatures: vec![ExportSignature {
                signature_info: signer.signature_info().clone(),
                batch_num: 1,
                batch_size: 1,
                signature: signer.sign(export)?,
            }],
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// `export.bin` leaf over a fixed key set
pub struct ExportFile {
    keys: Vec<DiagnosisKey>,
    start: NaiveDateTime,
    end: NaiveDateTime,
    region: String,
    signer: Arc<SigningProvider>,
}

impl ExportFile {
    pub fn new(
        keys: Vec<DiagnosisKey>,
        start: NaiveDateTime,
        end: NaiveDateTime,
        region: impl Into<String>,
        signer: Arc<SigningProvider>,
    ) -> Self {
        ExportFile {
            keys,
            start,
            end,
            region: region.into(),
            signer,
        }
    }
}

impl FileSource for ExportFile {
    fn render(&self, _ctx: &RenderContext<'_>) -> Result<Vec<u8>> {
        KeyExport::new(
            &self.keys,
            self.start,
            self.end,
            &self.region,
            self.signer.signature_info(),
        )
        .to_bytes()
    }
}

/// `export.sig` leaf signing its sibling `export.bin`
pub struct SignatureFile {
    signer: Arc<SigningProvider>,
}

impl SignatureFile {
    pub fn new(signer: Arc<SigningProvider>) -> Self {
        SignatureFile { signer }
    }
}

impl FileSource for SignatureFile {
    fn render(&self, ctx: &RenderContext<'_>) -> Result<Vec<u8>> {
        let export = ctx.sibling_bytes(EXPORT_FILE_NAME)?;
        SignatureList::sign(&self.signer, export)?.to_bytes()
    }

    fn dependencies(&self) -> Vec<String> {
        vec![EXPORT_FILE_NAME.to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{at, key, signer};

    #[test]
    fn test_export_is_sorted_and_deterministic() {
        let mut early = key(9, "DE", &["DE"], at(1, 10));
        early.rolling_start_interval_number -= 144;
        let keys = vec![key(3, "DE", &["DE"], at(1, 10)), key(1, "DE", &["DE"], at(1, 10)), early];
        let signer = signer();

        let export = KeyExport::new(&keys, at(1, 10), at(1, 11), "DE", signer.signature_info());
        let seeds: Vec<u8> = export.keys.iter().map(|k| k.key_data[0]).collect();
        assert_eq!(seeds, vec![9, 1, 3]);

        let mut reversed = keys.clone();
        reversed.reverse();
        let again = KeyExport::new(&reversed, at(1, 10), at(1, 11), "DE", signer.signature_info());
        assert_eq!(export.to_bytes().unwrap(), again.to_bytes().unwrap());
    }

    #[test]
    fn test_header_and_decode() {
        let signer = signer();
        let export = KeyExport::new(&[key(1, "DE", &["DE"], at(1, 10))], at(1, 10), at(1, 11), "DE", signer.signature_info());
        let bytes = export.to_bytes().unwrap();
        assert_eq!(&bytes[..HEADER_LENGTH], b"EK Export v1    ");
        assert_eq!(KeyExport::from_bytes(&bytes).unwrap(), export);
        assert_eq!(export.end_timestamp - export.start_timestamp, 3600);
        assert!(KeyExport::from_bytes(b"garbage").is_err());
    }

    #[test]
    fn test_signature_covers_export_bytes() {
        let signer = signer();
        let export = KeyExport::new(&[], at(1, 10), at(1, 11), "DE", signer.signature_info())
            .to_bytes()
            .unwrap();
        let list = SignatureList::sign(&signer, &export).unwrap();
        let decoded = SignatureList::from_bytes(&list.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, list);
        assert!(signer.verify(&export, &decoded.signatures[0].signature));
        assert!(!signer.verify(b"other", &decoded.signatures[0].signature));
    }
}
