//! Retry schedules.
//!
//! Both the oracle client (per HTTP request) and the store retryer (per
//! store call) retry a bounded number of times with an explicit list of
//! per-attempt delays, e.g. 1s, 3s, 5s and then give up.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::storage::StoreError;

/// Ordered list of delays to sleep before each retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySchedule {
    delays: Vec<Duration>,
}

impl RetrySchedule {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    /// Schedule that never retries.
    pub fn none() -> Self {
        Self { delays: Vec::new() }
    }

    pub fn from_secs(secs: &[u64]) -> Self {
        Self::new(secs.iter().copied().map(Duration::from_secs).collect())
    }

    pub fn from_millis(millis: &[u64]) -> Self {
        Self::new(millis.iter().copied().map(Duration::from_millis).collect())
    }

    /// Delay before retry number `retry` (0-based), or `None` when exhausted.
    pub fn delay_for(&self, retry: usize) -> Option<Duration> {
        self.delays.get(retry).copied()
    }

    pub fn max_retries(&self) -> usize {
        self.delays.len()
    }
}

impl Default for RetrySchedule {
    /// 1s, 3s, 5s.
    fn default() -> Self {
        Self::from_secs(&[1, 3, 5])
    }
}

// ---------------------------------------------------------------------------
// Store retryer
// ---------------------------------------------------------------------------

/// Re-runs a store call while it fails with a transient error.
#[derive(Debug, Clone, Default)]
pub struct StoreRetryer {
    schedule: RetrySchedule,
}

impl StoreRetryer {
    pub fn new(schedule: RetrySchedule) -> Self {
        Self { schedule }
    }

    pub async fn run<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut retry = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => match self.schedule.delay_for(retry) {
                    Some(delay) => {
                        warn!(op, attempt = retry + 1, delay_ms = delay.as_millis() as u64, error = %e,
                            "Transient store error, retrying");
                        tokio::time::sleep(delay).await;
                        retry += 1;
                    }
                    None => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
