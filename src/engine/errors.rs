//! Error sink.
//!
//! Engine tasks never fail on their own; they report here and carry on.
//! A single reporter task turns reports into `tracing` events. Reporting
//! never blocks: when the channel is full or gone the error is logged
//! inline instead.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::error;

use crate::oracle::OracleError;
use crate::storage::StoreError;

/// Failures the engine recovered from by requeueing, resetting or skipping.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to claim new orders: {0}")]
    Claim(#[source] StoreError),

    #[error("failed to query accrual service for order {order}: {source}")]
    Oracle {
        order: String,
        #[source]
        source: OracleError,
    },

    #[error("rate limited on order {order} without a valid Retry-After header")]
    RetryAfter { order: String },

    #[error("failed to settle order {order}: {source}")]
    Settle {
        order: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to reset order {order} to NEW: {source}")]
    Reset {
        order: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to release stale claims: {0}")]
    Recovery(#[source] StoreError),
}

#[derive(Debug, Clone)]
pub struct ErrorSink {
    tx: mpsc::Sender<EngineError>,
}

impl ErrorSink {
    /// A sink and the receiving end, for callers that consume reports
    /// themselves.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<EngineError>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// A sink drained by a spawned reporter task. The task ends once every
    /// clone of the sink is dropped.
    pub fn spawn_reporter(capacity: usize) -> (Self, JoinHandle<u64>) {
        let (sink, mut rx) = Self::channel(capacity);
        let handle = tokio::spawn(async move {
            let mut reported = 0u64;
            while let Some(err) = rx.recv().await {
                error!(error = %err, "Accrual engine error");
                reported += 1;
            }
            reported
        });
        (sink, handle)
    }

    pub fn report(&self, err: EngineError) {
        if let Err(e) = self.tx.try_send(err) {
            let err = match e {
                mpsc::error::TrySendError::Full(err) | mpsc::error::TrySendError::Closed(err) => err,
            };
            error!(error = %err, "Accrual engine error (sink unavailable)");
        }
    }
}
