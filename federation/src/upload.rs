//! Upload of locally originated keys
//!
//! Candidates are the consented keys of the origin country after the upload
//! cursor, in store order, up to the first key the expiry policy still holds
//! back. They are sent in signed batches of at most `max_batch_key_count`.
//! After each batch the cursor moves over the settled keys: those the gateway
//! acknowledged (201 or 409) and those it already refused in an earlier run.
//! A first refusal is reported and recorded; it holds the cursor and ends the
//! run, so the key is offered once more next time. Items answered with 500 or
//! not answered at all are resent, and fail the run once retries run out.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{NaiveDateTime, Utc};
use keyfed_core::models::CursorDirection;
use keyfed_core::utils::{self, RunLock};
use keyfed_core::{DiagnosisKey, FederationCursor, KeyPosition, SigningProvider, Store};
use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::config::FederationConfig;
use crate::error::{FederationError, Result};
use crate::gateway::{batch_tag, BatchUploadResponse, FederationGateway, SignedBatch};

/// A key the gateway refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedKey {
    /// Short hex prefix of the key data
    pub key_prefix: String,
    pub position: KeyPosition,
    pub batch_tag: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    pub candidates: usize,
    pub batches: usize,
    pub accepted: usize,
    pub rejected: Vec<RejectedKey>,
    /// Cursor after the run, `None` when no key was ever acknowledged
    pub cursor: Option<KeyPosition>,
}

/// Per-chunk result of an upload
#[derive(Debug, Default)]
struct ChunkOutcome {
    /// Key data the cursor may move over
    settled: HashSet<Vec<u8>>,
    accepted: usize,
    /// Keys still without a final answer after every retry
    unanswered: usize,
}

pub struct UploadRunner<S: Store + ?Sized, G: FederationGateway + ?Sized> {
    store: Arc<S>,
    gateway: Arc<G>,
    signer: Arc<SigningProvider>,
    config: FederationConfig,
    lock: RunLock,
}

impl<S: Store + ?Sized, G: FederationGateway + ?Sized> UploadRunner<S, G> {
    pub fn new(store: Arc<S>, gateway: Arc<G>, signer: Arc<SigningProvider>, config: FederationConfig) -> Self {
        UploadRunner {
            store,
            gateway,
            signer,
            config,
            lock: RunLock::new(),
        }
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<UploadReport> {
        self.run_at(Utc::now().naive_utc(), cancel).await
    }

    pub async fn run_at(&self, now: NaiveDateTime, cancel: &CancellationToken) -> Result<UploadReport> {
        let _guard = self.lock.try_acquire().ok_or(FederationError::Locked)?;

        let cursor = match self.store.load_cursor(CursorDirection::Upload)? {
            Some(FederationCursor::Upload(position)) => Some(position),
            _ => None,
        };
        let candidates = self.candidates(cursor.as_ref(), now)?;
        let mut report = UploadReport {
            candidates: candidates.len(),
            cursor: cursor.clone(),
            ..Default::default()
        };

        if candidates.len() < self.config.upload.min_batch_key_count {
            info!(
                "{} keys pending, waiting for at least {}",
                candidates.len(),
                self.config.upload.min_batch_key_count
            );
            return Ok(report);
        }

        let mut counter = 0;
        for chunk in candidates.chunks(self.config.upload.max_batch_key_count) {
            if cancel.is_cancelled() {
                return Err(FederationError::Cancelled);
            }
            report.batches += 1;
            let outcome = self.upload_chunk(chunk, now, &mut counter, &mut report, cancel).await?;
            report.accepted += outcome.accepted;

            let acknowledged = self.acknowledged_prefix(chunk, &outcome.settled);
            if acknowledged > 0 {
                let position = chunk[acknowledged - 1].position();
                self.store.save_cursor(&FederationCursor::Upload(position.clone()))?;
                report.cursor = Some(position);
            }
            if outcome.unanswered > 0 {
                return Err(FederationError::Transport(format!(
                    "{} keys without a final status after {} retries",
                    outcome.unanswered, self.config.core.retry.max_retries
                )));
            }
            if acknowledged < chunk.len() {
                warn!(
                    "Batch {} acknowledged {} of {} keys, cursor held",
                    report.batches,
                    acknowledged,
                    chunk.len()
                );
                break;
            }
        }

        info!(
            "Upload finished: {} candidates, {} accepted, {} rejected in {} batches",
            report.candidates,
            report.accepted,
            report.rejected.len(),
            report.batches
        );
        Ok(report)
    }

    fn candidates(&self, cursor: Option<&KeyPosition>, now: NaiveDateTime) -> Result<Vec<DiagnosisKey>> {
        let since = cursor.map(|c| c.submission_timestamp).unwrap_or(0);
        let policy = self.config.upload.expiry_policy_minutes;
        let mut candidates = Vec::new();
        for key in self.store.find_since(since)? {
            let key = key?;
            if cursor.map_or(false, |c| key.position() <= *c) {
                continue;
            }
            if !key.consent_to_federation || key.origin_country != self.config.origin_country {
                continue;
            }
            if !key.can_share_at(now, policy) {
                debug!("Key {} not shareable before {}", utils::key_prefix(&key.key_data), key.earliest_sharing_time(policy));
                break;
            }
            candidates.push(key);
        }
        Ok(candidates)
    }

    /// Number of leading keys the cursor may move over
    fn acknowledged_prefix(&self, chunk: &[DiagnosisKey], settled: &HashSet<Vec<u8>>) -> usize {
        let prefix = chunk.iter().take_while(|k| settled.contains(&k.key_data)).count();
        if self.config.upload.allow_partial_acknowledgement || prefix == chunk.len() {
            prefix
        } else {
            0
        }
    }

    /// Upload one chunk, resending items the gateway answered with 500 or
    /// left out of its response.
    async fn upload_chunk(
        &self,
        chunk: &[DiagnosisKey],
        now: NaiveDateTime,
        counter: &mut usize,
        report: &mut UploadReport,
        cancel: &CancellationToken,
    ) -> Result<ChunkOutcome> {
        let retry = &self.config.core.retry;
        let mut outcome = ChunkOutcome::default();
        let mut pending = chunk.to_vec();
        let mut attempt = 0;
        let mut backoff = retry.initial_backoff;

        loop {
            *counter += 1;
            let batch = SignedBatch::sign(batch_tag(now.date(), *counter), pending, &self.signer)?;
            let response = self.send(&batch, cancel).await?;

            let mut resend = Vec::new();
            for (index, key) in batch.keys.iter().enumerate() {
                let prefix = utils::key_prefix(&key.key_data);
                if response.is_accepted(index) {
                    outcome.settled.insert(key.key_data.clone());
                    outcome.accepted += 1;
                } else if response.status400.contains(&index) {
                    if self.store.record_rejected_key(&key.key_data)? {
                        error!("Gateway rejected key {} in batch {}", prefix, batch.batch_tag);
                        report.rejected.push(RejectedKey {
                            key_prefix: prefix,
                            position: key.position(),
                            batch_tag: batch.batch_tag.clone(),
                        });
                    } else {
                        info!("Key {} rejected again, skipping it", prefix);
                        outcome.settled.insert(key.key_data.clone());
                    }
                } else {
                    if !response.status500.contains(&index) {
                        warn!("No status for key {} in batch {}", prefix, batch.batch_tag);
                    }
                    resend.push(key.clone());
                }
            }

            if resend.is_empty() {
                return Ok(outcome);
            }
            if attempt >= retry.max_retries {
                warn!("{} keys still failing after {} retries", resend.len(), attempt);
                outcome.unanswered = resend.len();
                return Ok(outcome);
            }
            attempt += 1;
            debug!("Resending {} keys in {:?}", resend.len(), backoff);
            tokio::time::sleep(backoff).await;
            backoff = backoff.saturating_mul(2).min(retry.max_backoff);
            pending = resend;
        }
    }

    async fn send(&self, batch: &SignedBatch, cancel: &CancellationToken) -> Result<BatchUploadResponse> {
        let retry = &self.config.core.retry;
        let upload = utils::retry_if(
            || self.gateway.upload_batch(batch),
            retry.max_retries,
            retry.initial_backoff,
            retry.max_backoff,
            FederationError::is_transient,
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FederationError::Cancelled),
            response = upload => response,
        }
    }
}
