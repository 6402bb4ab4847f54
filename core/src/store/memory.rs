//! In-memory store

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{NaiveDate, NaiveDateTime};

use super::{
    batch_retention_date, retention_threshold, validate_batch, FederationStateStore, KeyIter,
    KeyRecordStore,
};
use crate::error::{CoreError, Result};
use crate::models::{
    CursorDirection, DiagnosisKey, FederationBatchInfo, FederationBatchStatus, FederationCursor,
    KeyPosition,
};

#[derive(Default)]
struct MemoryState {
    keys: BTreeMap<KeyPosition, DiagnosisKey>,
    key_data: HashSet<Vec<u8>>,
    cursors: HashMap<CursorDirection, FederationCursor>,
    batches: HashMap<String, FederationBatchInfo>,
    rejected: HashSet<Vec<u8>>,
}

impl MemoryState {
    fn insert_keys(&mut self, keys: &[DiagnosisKey]) -> usize {
        let mut inserted = 0;
        for key in keys {
            if self.key_data.insert(key.key_data.clone()) {
                self.keys.insert(key.position(), key.clone());
                inserted += 1;
            }
        }
        inserted
    }
}

/// Volatile store guarded by a single lock
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryState>> {
        self.state
            .read()
            .map_err(|_| CoreError::StorageError("Memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryState>> {
        self.state
            .write()
            .map_err(|_| CoreError::StorageError("Memory store lock poisoned".to_string()))
    }
}

impl KeyRecordStore for MemoryStore {
    fn save(&self, keys: &[DiagnosisKey]) -> Result<usize> {
        validate_batch(keys)?;
        Ok(self.write()?.insert_keys(keys))
    }

    fn find_since(&self, since: u32) -> Result<KeyIter<'_>> {
        let start = KeyPosition {
            submission_timestamp: since,
            key_data: Vec::new(),
        };
        let snapshot: Vec<DiagnosisKey> = self.read()?.keys.range(start..).map(|(_, k)| k.clone()).collect();
        Ok(Box::new(snapshot.into_iter().map(Ok)))
    }

    fn apply_retention_at(&self, horizon_days: i64, now: NaiveDateTime) -> Result<usize> {
        let threshold = retention_threshold(horizon_days, now)?;
        let mut state = self.write()?;
        let keep = state.keys.split_off(&KeyPosition {
            submission_timestamp: threshold,
            key_data: Vec::new(),
        });
        let removed = std::mem::replace(&mut state.keys, keep);
        let MemoryState { key_data, rejected, .. } = &mut *state;
        for key in removed.values() {
            key_data.remove(&key.key_data);
            rejected.remove(&key.key_data);
        }
        Ok(removed.len())
    }

    fn count(&self) -> Result<usize> {
        Ok(self.read()?.keys.len())
    }
}

impl FederationStateStore for MemoryStore {
    fn load_cursor(&self, direction: CursorDirection) -> Result<Option<FederationCursor>> {
        Ok(self.read()?.cursors.get(&direction).cloned())
    }

    fn save_cursor(&self, cursor: &FederationCursor) -> Result<()> {
        self.write()?.cursors.insert(cursor.direction(), cursor.clone());
        Ok(())
    }

    fn batch_info(&self, batch_tag: &str) -> Result<Option<FederationBatchInfo>> {
        Ok(self.read()?.batches.get(batch_tag).cloned())
    }

    fn insert_batch_info(&self, info: &FederationBatchInfo) -> Result<bool> {
        let mut state = self.write()?;
        if state.batches.contains_key(&info.batch_tag) {
            return Ok(false);
        }
        state.batches.insert(info.batch_tag.clone(), info.clone());
        Ok(true)
    }

    fn update_batch_status(&self, batch_tag: &str, status: FederationBatchStatus) -> Result<()> {
        let mut state = self.write()?;
        let info = state.batches.get_mut(batch_tag).ok_or_else(|| {
            CoreError::StorageError(format!("Unknown batch {}", batch_tag))
        })?;
        info.status = status;
        Ok(())
    }

    fn batches_with_status(&self, status: FederationBatchStatus) -> Result<Vec<FederationBatchInfo>> {
        let mut batches: Vec<FederationBatchInfo> = self
            .read()?
            .batches
            .values()
            .filter(|b| b.status == status)
            .cloned()
            .collect();
        batches.sort_by(|a, b| (a.date, &a.batch_tag).cmp(&(b.date, &b.batch_tag)));
        Ok(batches)
    }

    fn has_batches_for(&self, date: NaiveDate) -> Result<bool> {
        Ok(self.read()?.batches.values().any(|b| b.date == date))
    }

    fn commit_downloaded_batch(&self, keys: &[DiagnosisKey], batch: &FederationBatchInfo) -> Result<usize> {
        validate_batch(keys)?;
        let mut state = self.write()?;
        let inserted = state.insert_keys(keys);
        state.batches.insert(
            batch.batch_tag.clone(),
            batch.with_status(FederationBatchStatus::Processed),
        );
        let cursor = FederationCursor::Download {
            date: batch.date,
            batch_tag: batch.batch_tag.clone(),
        };
        state.cursors.insert(CursorDirection::Download, cursor);
        Ok(inserted)
    }

    fn apply_batch_retention_at(&self, horizon_days: i64, now: NaiveDateTime) -> Result<usize> {
        let cutoff = batch_retention_date(horizon_days, now)?;
        let mut state = self.write()?;
        let before = state.batches.len();
        state.batches.retain(|_, b| b.date >= cutoff);
        Ok(before - state.batches.len())
    }

    fn record_rejected_key(&self, key_data: &[u8]) -> Result<bool> {
        Ok(self.write()?.rejected.insert(key_data.to_vec()))
    }

    fn is_rejected_key(&self, key_data: &[u8]) -> Result<bool> {
        Ok(self.read()?.rejected.contains(key_data))
    }
}

#[cfg(test)]
mod tests {
    use super::super::conformance;
    use super::*;

    #[test]
    fn test_save_dedupes_on_key_data() {
        conformance::save_dedupes_on_key_data(&MemoryStore::new());
    }

    #[test]
    fn test_save_is_all_or_nothing() {
        conformance::save_is_all_or_nothing(&MemoryStore::new());
    }

    #[test]
    fn test_find_since_orders_by_position() {
        conformance::find_since_orders_by_position(&MemoryStore::new());
    }

    #[test]
    fn test_retention() {
        conformance::retention_removes_only_older_keys(&MemoryStore::new());
    }

    #[test]
    fn test_cursor_round_trip() {
        conformance::cursor_round_trip(&MemoryStore::new());
    }

    #[test]
    fn test_batch_lifecycle() {
        conformance::batch_lifecycle(&MemoryStore::new());
    }

    #[test]
    fn test_batch_retention() {
        conformance::batch_retention(&MemoryStore::new());
    }

    #[test]
    fn test_rejected_keys() {
        conformance::rejected_keys(&MemoryStore::new());
    }
}
