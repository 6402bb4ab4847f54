//! Utility functions and helpers
//!
//! Epoch conversions shared by the key model and the runners, bounded retry
//! helpers for transport calls, and the run-lock that keeps scheduled jobs
//! from overlapping.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use log::{debug, warn};

/// Seconds in one submission-timestamp interval
pub const SECONDS_PER_HOUR: i64 = 3600;

/// Seconds in one rolling interval
pub const SECONDS_PER_ROLLING_INTERVAL: i64 = 600;

/// Convert epoch seconds to a UTC date time
pub fn from_epoch_seconds(seconds: i64) -> NaiveDateTime {
    DateTime::<Utc>::from_timestamp(seconds, 0)
        .map(|dt| dt.naive_utc())
        .unwrap_or_default()
}

/// Epoch seconds of a UTC date time
pub fn to_epoch_seconds(at: NaiveDateTime) -> i64 {
    at.and_utc().timestamp()
}

/// Number of whole hours since the epoch
pub fn epoch_hours(at: NaiveDateTime) -> u32 {
    to_epoch_seconds(at).div_euclid(SECONDS_PER_HOUR).max(0) as u32
}

/// Start of the given epoch hour
pub fn hour_to_datetime(hours: u32) -> NaiveDateTime {
    from_epoch_seconds(hours as i64 * SECONDS_PER_HOUR)
}

/// Start of a rolling interval
pub fn rolling_interval_to_datetime(interval: u32) -> NaiveDateTime {
    from_epoch_seconds(interval as i64 * SECONDS_PER_ROLLING_INTERVAL)
}

/// Floor a date time to the start of its hour
pub fn truncate_to_hour(at: NaiveDateTime) -> NaiveDateTime {
    hour_to_datetime(epoch_hours(at))
}

/// Current UTC time truncated to the hour
pub fn current_hour() -> NaiveDateTime {
    truncate_to_hour(Utc::now().naive_utc())
}

/// Short hex prefix of key material, safe to log
pub fn key_prefix(bytes: &[u8]) -> String {
    hex::encode(&bytes[..bytes.len().min(4)])
}

/// Retry only the errors `is_retryable` accepts, doubling the backoff up to
/// `max_backoff`. Non-retryable errors return immediately.
pub async fn retry_if<F, Fut, T, E, P>(
    operation: F,
    max_retries: usize,
    initial_backoff: Duration,
    max_backoff: Duration,
    is_retryable: P,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut retries = 0;
    let mut backoff = initial_backoff;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if retries >= max_retries || !is_retryable(&err) {
                    return Err(err);
                }

                retries += 1;
                debug!("Attempt {} failed, retrying in {:?}", retries, backoff);
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2).min(max_backoff);
            }
        }
    }
}

/// In-process guard against overlapping runs of the same job
#[derive(Debug, Clone, Default)]
pub struct RunLock {
    active: Arc<AtomicBool>,
}

impl RunLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock, or `None` if a run is already active
    pub fn try_acquire(&self) -> Option<RunGuard> {
        match self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Some(RunGuard {
                active: self.active.clone(),
            }),
            Err(_) => {
                warn!("Run lock already held");
                None
            }
        }
    }

    pub fn is_held(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

/// Releases its `RunLock` when dropped
#[derive(Debug)]
pub struct RunGuard {
    active: Arc<AtomicBool>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
    }
}
