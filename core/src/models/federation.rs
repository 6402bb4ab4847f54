//! Federation bookkeeping records
//!
//! Batch infos track every remote batch the gateway has announced, and the
//! per-direction cursors mark how far upload and download have progressed.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::KeyPosition;
use crate::error::{CoreError, Result};

/// Processing state of a remote batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FederationBatchStatus {
    Unprocessed,
    Processed,
    Error,
    ErrorWontRetry,
}

impl FederationBatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FederationBatchStatus::Unprocessed => "UNPROCESSED",
            FederationBatchStatus::Processed => "PROCESSED",
            FederationBatchStatus::Error => "ERROR",
            FederationBatchStatus::ErrorWontRetry => "ERROR_WONT_RETRY",
        }
    }
}

impl fmt::Display for FederationBatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FederationBatchStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "UNPROCESSED" => Ok(FederationBatchStatus::Unprocessed),
            "PROCESSED" => Ok(FederationBatchStatus::Processed),
            "ERROR" => Ok(FederationBatchStatus::Error),
            "ERROR_WONT_RETRY" => Ok(FederationBatchStatus::ErrorWontRetry),
            other => Err(CoreError::StorageError(format!(
                "Unknown batch status: {}",
                other
            ))),
        }
    }
}

/// A batch announced by the federation gateway
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FederationBatchInfo {
    pub batch_tag: String,
    pub date: NaiveDate,
    pub status: FederationBatchStatus,
}

impl FederationBatchInfo {
    pub fn unprocessed(batch_tag: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            batch_tag: batch_tag.into(),
            date,
            status: FederationBatchStatus::Unprocessed,
        }
    }

    pub fn with_status(&self, status: FederationBatchStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }
}

/// Direction a cursor tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CursorDirection {
    Upload,
    Download,
}

impl CursorDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            CursorDirection::Upload => "upload",
            CursorDirection::Download => "download",
        }
    }
}

/// Persisted federation watermark
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "direction", rename_all = "lowercase")]
pub enum FederationCursor {
    /// Last key acknowledged by the gateway
    Upload(KeyPosition),
    /// Last remote batch persisted locally
    Download { date: NaiveDate, batch_tag: String },
}

impl FederationCursor {
    pub fn direction(&self) -> CursorDirection {
        match self {
            FederationCursor::Upload(_) => CursorDirection::Upload,
            FederationCursor::Download { .. } => CursorDirection::Download,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            FederationBatchStatus::Unprocessed,
            FederationBatchStatus::Processed,
            FederationBatchStatus::Error,
            FederationBatchStatus::ErrorWontRetry,
        ] {
            assert_eq!(status.as_str().parse::<FederationBatchStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_cursor_serialization() {
        let cursor = FederationCursor::Download {
            date: NaiveDate::from_ymd_opt(2020, 9, 1).unwrap(),
            batch_tag: "batch-1".to_string(),
        };
        let json = serde_json::to_string(&cursor).unwrap();
        assert!(json.contains("\"direction\":\"download\""));
        assert_eq!(serde_json::from_str::<FederationCursor>(&json).unwrap(), cursor);
        assert_eq!(cursor.direction(), CursorDirection::Download);

        let cursor = FederationCursor::Upload(KeyPosition {
            submission_timestamp: 12,
            key_data: vec![0xab; 16],
        });
        let json = serde_json::to_string(&cursor).unwrap();
        assert_eq!(serde_json::from_str::<FederationCursor>(&json).unwrap(), cursor);
    }
}
