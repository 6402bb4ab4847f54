//! SQLite store

use std::collections::{BTreeSet, VecDeque};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{NaiveDate, NaiveDateTime};
use log::debug;
use rusqlite::{params, Connection, OptionalExtension, Transaction};

use super::{
    batch_retention_date, retention_threshold, validate_batch, FederationStateStore, KeyIter,
    KeyRecordStore,
};
use crate::error::{to_storage_error, CoreError, Result};
use crate::models::{
    CursorDirection, DiagnosisKey, FederationBatchInfo, FederationBatchStatus, FederationCursor,
    KeyPosition, ReportType,
};

/// Rows fetched per `find_since` round trip
const PAGE_SIZE: usize = 500;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS diagnosis_key (
    key_data BLOB PRIMARY KEY,
    rolling_start_interval_number INTEGER NOT NULL,
    rolling_period INTEGER NOT NULL,
    transmission_risk_level INTEGER NOT NULL,
    submission_timestamp INTEGER NOT NULL,
    origin_country TEXT NOT NULL,
    visited_countries TEXT NOT NULL,
    report_type TEXT NOT NULL,
    days_since_onset_of_symptoms INTEGER,
    consent_to_federation INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_diagnosis_key_position
    ON diagnosis_key (submission_timestamp, key_data);
CREATE TABLE IF NOT EXISTS federation_cursor (
    direction TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS federation_batch_info (
    batch_tag TEXT PRIMARY KEY,
    date TEXT NOT NULL,
    status TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS federation_rejected_key (
    key_data BLOB PRIMARY KEY
);
";

const KEY_COLUMNS: &str = "key_data, rolling_start_interval_number, rolling_period, \
    transmission_risk_level, submission_timestamp, origin_country, visited_countries, \
    report_type, days_since_onset_of_symptoms, consent_to_federation";

/// Store backed by a single SQLite connection
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CoreError::StorageError("SQLite connection lock poisoned".to_string()))
    }

    fn page_after(&self, after: &KeyPosition, limit: usize) -> Result<Vec<DiagnosisKey>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM diagnosis_key
             WHERE submission_timestamp > ?1 OR (submission_timestamp = ?1 AND key_data > ?2)
             ORDER BY submission_timestamp, key_data
             LIMIT ?3",
            KEY_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![after.submission_timestamp, after.key_data, limit as i64],
            read_row,
        )?;
        let keys: Result<Vec<DiagnosisKey>> = rows
            .map(|row| row.map_err(CoreError::from).and_then(into_key))
            .collect();
        keys
    }
}

fn insert_keys(tx: &Transaction<'_>, keys: &[DiagnosisKey]) -> Result<usize> {
    let mut stmt = tx.prepare_cached(&format!(
        "INSERT INTO diagnosis_key ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT (key_data) DO NOTHING",
        KEY_COLUMNS
    ))?;
    let mut inserted = 0;
    for key in keys {
        let visited: Vec<&str> = key.visited_countries.iter().map(String::as_str).collect();
        inserted += stmt.execute(params![
            key.key_data,
            key.rolling_start_interval_number,
            key.rolling_period,
            key.transmission_risk_level,
            key.submission_timestamp,
            key.origin_country,
            visited.join(","),
            key.report_type.as_str(),
            key.days_since_onset_of_symptoms,
            key.consent_to_federation,
        ])?;
    }
    Ok(inserted)
}

fn upsert_cursor(conn: &Connection, cursor: &FederationCursor) -> Result<()> {
    conn.execute(
        "INSERT INTO federation_cursor (direction, value) VALUES (?1, ?2)
         ON CONFLICT (direction) DO UPDATE SET value = excluded.value",
        params![cursor.direction().as_str(), serde_json::to_string(cursor)?],
    )?;
    Ok(())
}

type KeyRow = (
    Vec<u8>,
    u32,
    u32,
    u8,
    u32,
    String,
    String,
    String,
    Option<i32>,
    bool,
);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<KeyRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn into_key(row: KeyRow) -> Result<DiagnosisKey> {
    let (key_data, rsin, rolling_period, trl, submission, origin, visited, report_type, dsos, consent) = row;
    Ok(DiagnosisKey {
        key_data,
        rolling_start_interval_number: rsin,
        rolling_period,
        transmission_risk_level: trl,
        submission_timestamp: submission,
        origin_country: origin,
        visited_countries: visited
            .split(',')
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect::<BTreeSet<_>>(),
        report_type: report_type.parse::<ReportType>().map_err(to_storage_error)?,
        days_since_onset_of_symptoms: dsos,
        consent_to_federation: consent,
    })
}

fn into_batch_info(row: (String, String, String)) -> Result<FederationBatchInfo> {
    let (batch_tag, date, status) = row;
    Ok(FederationBatchInfo {
        batch_tag,
        date: NaiveDate::parse_from_str(&date, "%Y-%m-%d").map_err(to_storage_error)?,
        status: status.parse()?,
    })
}

/// Pages through the key table so large windows are never held in memory at once
struct PagedKeys<'a> {
    store: &'a SqliteStore,
    after: KeyPosition,
    buffer: VecDeque<DiagnosisKey>,
    exhausted: bool,
}

impl Iterator for PagedKeys<'_> {
    type Item = Result<DiagnosisKey>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            match self.store.page_after(&self.after, PAGE_SIZE) {
                Ok(page) => {
                    self.exhausted = page.len() < PAGE_SIZE;
                    if let Some(last) = page.last() {
                        self.after = last.position();
                    }
                    self.buffer.extend(page);
                }
                Err(err) => {
                    self.exhausted = true;
                    return Some(Err(err));
                }
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

impl KeyRecordStore for SqliteStore {
    fn save(&self, keys: &[DiagnosisKey]) -> Result<usize> {
        validate_batch(keys)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let inserted = insert_keys(&tx, keys)?;
        tx.commit()?;
        debug!("Stored {} of {} keys", inserted, keys.len());
        Ok(inserted)
    }

    fn find_since(&self, since: u32) -> Result<KeyIter<'_>> {
        Ok(Box::new(PagedKeys {
            store: self,
            after: KeyPosition {
                submission_timestamp: since,
                key_data: Vec::new(),
            },
            buffer: VecDeque::new(),
            exhausted: false,
        }))
    }

    fn apply_retention_at(&self, horizon_days: i64, now: NaiveDateTime) -> Result<usize> {
        let threshold = retention_threshold(horizon_days, now)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM diagnosis_key WHERE submission_timestamp < ?1",
            params![threshold],
        )?;
        tx.execute(
            "DELETE FROM federation_rejected_key
             WHERE key_data NOT IN (SELECT key_data FROM diagnosis_key)",
            [],
        )?;
        tx.commit()?;
        Ok(removed)
    }

    fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM diagnosis_key", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

impl FederationStateStore for SqliteStore {
    fn load_cursor(&self, direction: CursorDirection) -> Result<Option<FederationCursor>> {
        let value: Option<String> = self
            .conn()?
            .query_row(
                "SELECT value FROM federation_cursor WHERE direction = ?1",
                params![direction.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        match value {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn save_cursor(&self, cursor: &FederationCursor) -> Result<()> {
        upsert_cursor(&*self.conn()?, cursor)
    }

    fn batch_info(&self, batch_tag: &str) -> Result<Option<FederationBatchInfo>> {
        let row: Option<(String, String, String)> = self
            .conn()?
            .query_row(
                "SELECT batch_tag, date, status FROM federation_batch_info WHERE batch_tag = ?1",
                params![batch_tag],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        row.map(into_batch_info).transpose()
    }

    fn insert_batch_info(&self, info: &FederationBatchInfo) -> Result<bool> {
        let inserted = self.conn()?.execute(
            "INSERT INTO federation_batch_info (batch_tag, date, status) VALUES (?1, ?2, ?3)
             ON CONFLICT (batch_tag) DO NOTHING",
            params![info.batch_tag, info.date.to_string(), info.status.as_str()],
        )?;
        Ok(inserted == 1)
    }

    fn update_batch_status(&self, batch_tag: &str, status: FederationBatchStatus) -> Result<()> {
        let updated = self.conn()?.execute(
            "UPDATE federation_batch_info SET status = ?2 WHERE batch_tag = ?1",
            params![batch_tag, status.as_str()],
        )?;
        if updated == 0 {
            return Err(CoreError::StorageError(format!("Unknown batch {}", batch_tag)));
        }
        Ok(())
    }

    fn batches_with_status(&self, status: FederationBatchStatus) -> Result<Vec<FederationBatchInfo>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT batch_tag, date, status FROM federation_batch_info
             WHERE status = ?1 ORDER BY date, batch_tag",
        )?;
        let rows = stmt.query_map(params![status.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
        })?;
        let batches: Result<Vec<FederationBatchInfo>> = rows
            .map(|row| row.map_err(CoreError::from).and_then(into_batch_info))
            .collect();
        batches
    }

    fn has_batches_for(&self, date: NaiveDate) -> Result<bool> {
        let exists: bool = self.conn()?.query_row(
            "SELECT EXISTS (SELECT 1 FROM federation_batch_info WHERE date = ?1)",
            params![date.to_string()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn commit_downloaded_batch(&self, keys: &[DiagnosisKey], batch: &FederationBatchInfo) -> Result<usize> {
        validate_batch(keys)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let inserted = insert_keys(&tx, keys)?;
        tx.execute(
            "INSERT INTO federation_batch_info (batch_tag, date, status) VALUES (?1, ?2, ?3)
             ON CONFLICT (batch_tag) DO UPDATE SET status = excluded.status",
            params![
                batch.batch_tag,
                batch.date.to_string(),
                FederationBatchStatus::Processed.as_str()
            ],
        )?;
        upsert_cursor(
            &tx,
            &FederationCursor::Download {
                date: batch.date,
                batch_tag: batch.batch_tag.clone(),
            },
        )?;
        tx.commit()?;
        Ok(inserted)
    }

    fn apply_batch_retention_at(&self, horizon_days: i64, now: NaiveDateTime) -> Result<usize> {
        let cutoff = batch_retention_date(horizon_days, now)?;
        let removed = self.conn()?.execute(
            "DELETE FROM federation_batch_info WHERE date < ?1",
            params![cutoff.to_string()],
        )?;
        Ok(removed)
    }

    fn record_rejected_key(&self, key_data: &[u8]) -> Result<bool> {
        let inserted = self.conn()?.execute(
            "INSERT INTO federation_rejected_key (key_data) VALUES (?1)
             ON CONFLICT (key_data) DO NOTHING",
            params![key_data],
        )?;
        Ok(inserted == 1)
    }

    fn is_rejected_key(&self, key_data: &[u8]) -> Result<bool> {
        let exists: bool = self.conn()?.query_row(
            "SELECT EXISTS (SELECT 1 FROM federation_rejected_key WHERE key_data = ?1)",
            params![key_data],
            |row| row.get(0),
        )?;
        Ok(exists)
    }
}
