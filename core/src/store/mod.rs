//! Key record persistence
//!
//! `KeyRecordStore` is the narrow persistence interface the runners consume.
//! `FederationStateStore` keeps federation cursors and batch bookkeeping next
//! to the keys so that a downloaded batch, its status and the download cursor
//! commit in one transaction.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use std::sync::Arc;

use chrono::{Duration, NaiveDate, NaiveDateTime, Utc};
use log::info;

use crate::config::StoreConfig;
use crate::error::{CoreError, Result};
use crate::models::{
    CursorDirection, DiagnosisKey, FederationBatchInfo, FederationBatchStatus, FederationCursor,
};
use crate::utils;

/// Lazily produced keys, ordered by `(submission_timestamp, key_data)`
pub type KeyIter<'a> = Box<dyn Iterator<Item = Result<DiagnosisKey>> + Send + 'a>;

/// Persistence interface over diagnosis keys
pub trait KeyRecordStore: Send + Sync {
    /// Persist a batch of keys atomically. Keys whose `key_data` is already
    /// stored are skipped. Returns the number of newly stored keys.
    fn save(&self, keys: &[DiagnosisKey]) -> Result<usize>;

    /// Keys with `submission_timestamp >= since`, in store order
    fn find_since(&self, since: u32) -> Result<KeyIter<'_>>;

    /// Delete keys submitted before `now - horizon_days`
    fn apply_retention_at(&self, horizon_days: i64, now: NaiveDateTime) -> Result<usize>;

    fn apply_retention(&self, horizon_days: i64) -> Result<usize> {
        self.apply_retention_at(horizon_days, Utc::now().naive_utc())
    }

    fn count(&self) -> Result<usize>;
}

/// Federation cursors and batch bookkeeping
pub trait FederationStateStore: Send + Sync {
    fn load_cursor(&self, direction: CursorDirection) -> Result<Option<FederationCursor>>;

    fn save_cursor(&self, cursor: &FederationCursor) -> Result<()>;

    fn batch_info(&self, batch_tag: &str) -> Result<Option<FederationBatchInfo>>;

    /// Record a batch unless its tag is already known. Returns whether it was inserted.
    fn insert_batch_info(&self, info: &FederationBatchInfo) -> Result<bool>;

    fn update_batch_status(&self, batch_tag: &str, status: FederationBatchStatus) -> Result<()>;

    /// Batches in the given status ordered by `(date, batch_tag)`
    fn batches_with_status(&self, status: FederationBatchStatus) -> Result<Vec<FederationBatchInfo>>;

    fn has_batches_for(&self, date: NaiveDate) -> Result<bool>;

    /// Store the keys of a downloaded batch, mark it processed and move the
    /// download cursor to it, all or nothing. Returns the newly stored count.
    fn commit_downloaded_batch(&self, keys: &[DiagnosisKey], batch: &FederationBatchInfo) -> Result<usize>;

    /// Delete batch infos dated before `now - horizon_days`
    fn apply_batch_retention_at(&self, horizon_days: i64, now: NaiveDateTime) -> Result<usize>;

    /// Remember a key the gateway refused. Returns whether it was not yet known.
    /// Entries go away with the key in the retention sweep.
    fn record_rejected_key(&self, key_data: &[u8]) -> Result<bool>;

    fn is_rejected_key(&self, key_data: &[u8]) -> Result<bool>;
}

/// A backend implementing both persistence interfaces
pub trait Store: KeyRecordStore + FederationStateStore {}

impl<T: KeyRecordStore + FederationStateStore> Store for T {}

/// Open the configured backend
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn Store>> {
    match config {
        StoreConfig::Memory => {
            info!("Using in-memory key store");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreConfig::Sqlite { path } => {
            info!("Using SQLite key store at {}", path.display());
            Ok(Arc::new(SqliteStore::open(path)?))
        }
    }
}

/// Validate every key before any of them is written
pub(crate) fn validate_batch(keys: &[DiagnosisKey]) -> Result<()> {
    for key in keys {
        key.validate()?;
    }
    Ok(())
}

/// First submission hour that survives retention
pub(crate) fn retention_threshold(horizon_days: i64, now: NaiveDateTime) -> Result<u32> {
    if horizon_days < 0 {
        return Err(CoreError::ValidationError(format!(
            "Retention horizon must not be negative, got {}",
            horizon_days
        )));
    }
    Ok(utils::epoch_hours(now - Duration::days(horizon_days)))
}

/// Oldest batch date that survives retention
pub(crate) fn batch_retention_date(horizon_days: i64, now: NaiveDateTime) -> Result<NaiveDate> {
    retention_threshold(horizon_days, now)?;
    Ok((now - Duration::days(horizon_days)).date())
}
