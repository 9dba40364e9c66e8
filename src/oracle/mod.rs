//! Accrual oracle integration.
//!
//! Defines the `AccrualOracle` trait and the verdict types the engine
//! interprets. `http::HttpAccrualClient` is the production implementation.
//!
//! Protocol: `GET <base>/api/orders/<number>`
//! - 200: `{"order": "...", "status": "...", "accrual": 500}`
//! - 204: order not known to the oracle (yet)
//! - 429: rate limited, `Retry-After: <seconds>`
//! - 5xx: transient, retried by the client

pub mod http;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

use crate::types::OrderStatus;

pub use http::HttpAccrualClient;

/// Status as reported by the oracle. NEW is never reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccrualStatus {
    Registered,
    Processing,
    Invalid,
    Processed,
}

impl AccrualStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, AccrualStatus::Processed | AccrualStatus::Invalid)
    }
}

impl From<AccrualStatus> for OrderStatus {
    fn from(status: AccrualStatus) -> Self {
        match status {
            AccrualStatus::Registered => OrderStatus::Registered,
            AccrualStatus::Processing => OrderStatus::Processing,
            AccrualStatus::Invalid => OrderStatus::Invalid,
            AccrualStatus::Processed => OrderStatus::Processed,
        }
    }
}

impl fmt::Display for AccrualStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(OrderStatus::from(*self).as_str())
    }
}

/// Body of a 200 response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AccrualVerdict {
    #[serde(default)]
    pub order: String,
    pub status: AccrualStatus,
    #[serde(default)]
    pub accrual: Option<Decimal>,
}

/// What the oracle said about one order.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Assessed(AccrualVerdict),
    /// 204: the oracle has no record of the order.
    Unknown,
    /// 429. `retry_after` is `None` when the header is missing or malformed.
    RateLimited { retry_after: Option<Duration> },
}

#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("accrual request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("accrual service unavailable (HTTP {status}) after {attempts} attempts")]
    Unavailable { status: u16, attempts: usize },

    #[error("unexpected accrual response HTTP {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("malformed accrual response: {0}")]
    Decode(String),
}

/// Abstraction over the external accrual service.
#[async_trait]
pub trait AccrualOracle: Send + Sync {
    /// Ask for the current verdict on `number`. Implementations retry
    /// transient failures internally before returning an error.
    async fn fetch_verdict(&self, number: &str) -> Result<Verdict, OracleError>;
}
