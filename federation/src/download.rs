//! Download of remotely originated batches
//!
//! A run first asks the gateway for the first batch of every date in the
//! window that has no known batch yet, then gives each `Error` batch one more
//! chance, and finally drains the `Unprocessed` queue, following
//! `next_batch_tag` chains. Each batch is stored, marked processed and set as
//! the download cursor in a single store transaction.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, NaiveDate, NaiveDateTime, Utc};
use keyfed_core::crypto::verify_with;
use keyfed_core::models::ReportType;
use keyfed_core::utils::{self, RunLock};
use keyfed_core::{CoreError, DiagnosisKey, FederationBatchInfo, FederationBatchStatus, Store};
use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::config::FederationConfig;
use crate::error::{FederationError, Result};
use crate::gateway::{canonical_bytes, DownloadedBatch, FederationGateway};

/// Accepted `days_since_onset_of_symptoms` range for remote keys
pub const MIN_DAYS_SINCE_ONSET: i32 = -14;
pub const MAX_DAYS_SINCE_ONSET: i32 = 4000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadReport {
    pub batches_processed: usize,
    pub batches_failed: usize,
    pub keys_stored: usize,
    pub keys_dropped: usize,
    pub batch_infos_removed: usize,
}

/// Whether a remote key may be stored
pub fn accepts_remote_key(key: &DiagnosisKey, local_origin: &str) -> bool {
    let onset_ok = key
        .days_since_onset_of_symptoms
        .map_or(false, |d| (MIN_DAYS_SINCE_ONSET..=MAX_DAYS_SINCE_ONSET).contains(&d));
    onset_ok
        && key.report_type != ReportType::SelfReport
        && key.origin_country != local_origin
        && key.validate().is_ok()
}

pub struct DownloadRunner<S: Store + ?Sized, G: FederationGateway + ?Sized> {
    store: Arc<S>,
    gateway: Arc<G>,
    config: FederationConfig,
    trusted_keys: Vec<Vec<u8>>,
    lock: RunLock,
}

impl<S: Store + ?Sized, G: FederationGateway + ?Sized> DownloadRunner<S, G> {
    pub fn new(store: Arc<S>, gateway: Arc<G>, config: FederationConfig) -> Result<Self> {
        let trusted_keys = config.download.trusted_keys()?;
        if trusted_keys.is_empty() {
            warn!("No trusted peer keys configured, batch signatures are not checked");
        }
        Ok(DownloadRunner {
            store,
            gateway,
            config,
            trusted_keys,
            lock: RunLock::new(),
        })
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<DownloadReport> {
        self.run_at(Utc::now().naive_utc(), cancel).await
    }

    pub async fn run_at(&self, now: NaiveDateTime, cancel: &CancellationToken) -> Result<DownloadReport> {
        let _guard = self.lock.try_acquire().ok_or(FederationError::Locked)?;
        let mut report = DownloadReport::default();
        let mut prefetched = HashMap::new();

        let today = now.date();
        for offset in (0..=self.config.download.window_days).rev() {
            let date = today - Duration::days(offset);
            if self.store.has_batches_for(date)? {
                continue;
            }
            if let Some(batch) = self.fetch(date, None, cancel).await? {
                info!("Discovered first batch {} for {}", batch.batch_tag, date);
                self.store
                    .insert_batch_info(&FederationBatchInfo::unprocessed(batch.batch_tag.clone(), date))?;
                prefetched.insert(batch.batch_tag.clone(), batch);
            }
        }

        for info in self.store.batches_with_status(FederationBatchStatus::Error)? {
            self.process(&info, &mut prefetched, now, &mut report, cancel).await?;
        }

        loop {
            let queue = self.store.batches_with_status(FederationBatchStatus::Unprocessed)?;
            if queue.is_empty() {
                break;
            }
            for info in queue {
                self.process(&info, &mut prefetched, now, &mut report, cancel).await?;
            }
        }

        report.batch_infos_removed = self
            .store
            .apply_batch_retention_at(self.config.core.retention_days, now)?;
        info!(
            "Download finished: {} batches processed, {} failed, {} keys stored, {} dropped",
            report.batches_processed, report.batches_failed, report.keys_stored, report.keys_dropped
        );
        Ok(report)
    }

    /// Process one batch and record the outcome in its status
    async fn process(
        &self,
        info: &FederationBatchInfo,
        prefetched: &mut HashMap<String, DownloadedBatch>,
        now: NaiveDateTime,
        report: &mut DownloadReport,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let outcome = match prefetched.remove(&info.batch_tag) {
            Some(batch) => self.store_batch(info, batch, now),
            None => match self.fetch(info.date, Some(&info.batch_tag), cancel).await {
                Ok(Some(batch)) => self.store_batch(info, batch, now),
                Ok(None) => Err(FederationError::Protocol(format!(
                    "Gateway no longer serves batch {}",
                    info.batch_tag
                ))),
                Err(e) => Err(e),
            },
        };

        match outcome {
            Ok((stored, dropped)) => {
                report.batches_processed += 1;
                report.keys_stored += stored;
                report.keys_dropped += dropped;
                Ok(())
            }
            Err(e @ FederationError::Cancelled) | Err(e @ FederationError::Core(CoreError::StorageError(_))) => Err(e),
            Err(e) => {
                let status = match info.status {
                    FederationBatchStatus::Error => FederationBatchStatus::ErrorWontRetry,
                    _ => FederationBatchStatus::Error,
                };
                error!("Batch {} of {} failed, marking {}: {}", info.batch_tag, info.date, status, e);
                self.store.update_batch_status(&info.batch_tag, status)?;
                report.batches_failed += 1;
                Ok(())
            }
        }
    }

    /// Validate and persist a downloaded batch. Returns stored and dropped key counts.
    fn store_batch(
        &self,
        info: &FederationBatchInfo,
        batch: DownloadedBatch,
        now: NaiveDateTime,
    ) -> Result<(usize, usize)> {
        let submitted = utils::epoch_hours(now);
        let total = batch.keys.len();
        let keys = batch
            .keys
            .into_iter()
            .map(|k| k.into_key(submitted))
            .collect::<Result<Vec<DiagnosisKey>>>()?;
        self.verify(&info.batch_tag, &keys, batch.signature.as_deref())?;

        if let Some(next) = batch.next_batch_tag {
            if self
                .store
                .insert_batch_info(&FederationBatchInfo::unprocessed(next.clone(), info.date))?
            {
                debug!("Queued batch {} after {}", next, info.batch_tag);
            }
        }

        let accepted: Vec<DiagnosisKey> = keys
            .into_iter()
            .filter(|k| accepts_remote_key(k, &self.config.origin_country))
            .collect();
        let dropped = total - accepted.len();
        if dropped > 0 {
            warn!("Dropped {} of {} keys from batch {}", dropped, total, info.batch_tag);
        }

        let stored = self.store.commit_downloaded_batch(&accepted, info)?;
        info!("Stored {} new keys from batch {} of {}", stored, info.batch_tag, info.date);
        Ok((stored, dropped))
    }

    fn verify(&self, batch_tag: &str, keys: &[DiagnosisKey], signature: Option<&[u8]>) -> Result<()> {
        if self.trusted_keys.is_empty() {
            return Ok(());
        }
        let signature = signature
            .ok_or_else(|| FederationError::Protocol(format!("Batch {} is not signed", batch_tag)))?;
        let payload = canonical_bytes(keys);
        if self.trusted_keys.iter().any(|key| verify_with(key, &payload, signature)) {
            Ok(())
        } else {
            Err(FederationError::Protocol(format!(
                "Batch {} signature does not match any trusted peer",
                batch_tag
            )))
        }
    }

    async fn fetch(
        &self,
        date: NaiveDate,
        batch_tag: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Option<DownloadedBatch>> {
        let retry = &self.config.core.retry;
        let download = utils::retry_if(
            || self.gateway.download_batch(date, batch_tag),
            retry.max_retries,
            retry.initial_backoff,
            retry.max_backoff,
            FederationError::is_transient,
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FederationError::Cancelled),
            batch = download => batch,
        }
    }
}
