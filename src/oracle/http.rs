//! HTTP client for the accrual service.
//!
//! Transport-level retry: connection failures and HTTP 500/503 are retried
//! with the configured schedule (1s, 3s, 5s by default), then surfaced.
//! 429 is never retried here; it is handed to the engine's rate gate.
//! When the client shares that gate, every attempt waits on it first.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{AccrualOracle, AccrualVerdict, OracleError, Verdict};
use crate::engine::rate_gate::RateGate;
use crate::retry::RetrySchedule;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

pub struct HttpAccrualClient {
    http: Client,
    base_url: String,
    retry: RetrySchedule,
    gate: Option<Arc<RateGate>>,
}

impl HttpAccrualClient {
    pub fn new(base_url: &str, timeout: Option<Duration>, retry: RetrySchedule) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout.unwrap_or(Duration::from_secs(DEFAULT_TIMEOUT_SECS)))
            .user_agent(concat!("accrual-engine/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client for the accrual service")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry,
            gate: None,
        })
    }

    /// Hold every attempt, retries included, until `gate` is open.
    pub fn with_rate_gate(mut self, gate: Arc<RateGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn order_url(&self, number: &str) -> String {
        format!("{}/api/orders/{}", self.base_url, urlencoding::encode(number))
    }

    async fn interpret(response: Response) -> Result<Verdict, OracleError> {
        let status = response.status();
        match status {
            StatusCode::OK => {
                let body = response.bytes().await?;
                let verdict: AccrualVerdict = serde_json::from_slice(&body).map_err(|e| {
                    OracleError::Decode(format!("{e}: {}", String::from_utf8_lossy(&body)))
                })?;
                Ok(Verdict::Assessed(verdict))
            }
            StatusCode::NO_CONTENT => Ok(Verdict::Unknown),
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_retry_after);
                Ok(Verdict::RateLimited { retry_after })
            }
            _ => {
                let body = response.text().await.unwrap_or_default();
                Err(OracleError::UnexpectedStatus { status: status.as_u16(), body })
            }
        }
    }
}

/// `Retry-After` in delta-seconds form. HTTP-date values are not used by
/// the accrual service and are treated as malformed. Zero carries no hint.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().filter(|secs| *secs > 0).map(Duration::from_secs)
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::INTERNAL_SERVER_ERROR || status == StatusCode::SERVICE_UNAVAILABLE
}

#[async_trait]
impl AccrualOracle for HttpAccrualClient {
    async fn fetch_verdict(&self, number: &str) -> Result<Verdict, OracleError> {
        let url = self.order_url(number);
        let mut retry = 0;

        loop {
            if let Some(gate) = &self.gate {
                gate.wait().await;
            }
            debug!(url = %url, attempt = retry + 1, "Querying accrual service");
            let outcome = self.http.get(&url).send().await;

            let failure = match outcome {
                Ok(response) if is_retryable_status(response.status()) => {
                    OracleError::Unavailable { status: response.status().as_u16(), attempts: retry + 1 }
                }
                Ok(response) => return Self::interpret(response).await,
                Err(e) if e.is_connect() || e.is_timeout() || e.is_request() => OracleError::Transport(e),
                Err(e) => return Err(OracleError::Transport(e)),
            };

            match self.retry.delay_for(retry) {
                Some(delay) => {
                    warn!(order = number, attempt = retry + 1, delay_ms = delay.as_millis() as u64,
                        error = %failure, "Retryable accrual service error");
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                None => return Err(failure),
            }
        }
    }
}
