//! Configuration loading from TOML with environment variable overrides.
//!
//! Reads `config.toml` (or the file named by `ACCRUAL_CONFIG`) into
//! strongly-typed structs. Every field has a default, so a missing section
//! or a missing file is fine. `DATABASE_URI` and `ACCRUAL_SYSTEM_ADDRESS`
//! override the matching file values.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::engine::EngineConfig;
use crate::retry::RetrySchedule;

pub const CONFIG_PATH_ENV: &str = "ACCRUAL_CONFIG";
pub const DATABASE_URI_ENV: &str = "DATABASE_URI";
pub const ACCRUAL_ADDRESS_ENV: &str = "ACCRUAL_SYSTEM_ADDRESS";

const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineSection,
    pub accrual: AccrualSection,
    pub database: DatabaseSection,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct EngineSection {
    pub poll_interval_ms: u64,
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub claim_batch_size: u32,
    pub redelivery_delay_ms: u64,
    pub returned_delay_ms: u64,
    /// 0 keeps polling a non-final order for as long as the claim lives.
    pub max_pending_cycles: u32,
    pub recover_on_start: bool,
    pub store_retry_delays_ms: Vec<u64>,
    pub error_sink_capacity: usize,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            worker_count: 5,
            queue_capacity: 50,
            claim_batch_size: 100,
            redelivery_delay_ms: 500,
            returned_delay_ms: 1_000,
            max_pending_cycles: 0,
            recover_on_start: true,
            store_retry_delays_ms: vec![1_000, 3_000, 5_000],
            error_sink_capacity: 50,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AccrualSection {
    /// Base URL of the accrual service, e.g. `http://localhost:8080`.
    pub address: String,
    pub timeout_secs: u64,
    pub retry_delays_ms: Vec<u64>,
}

impl Default for AccrualSection {
    fn default() -> Self {
        Self {
            address: String::new(),
            timeout_secs: 30,
            retry_delays_ms: vec![1_000, 3_000, 5_000],
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct DatabaseSection {
    pub uri: String,
    pub max_connections: u32,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            uri: "sqlite://accrual.db".to_string(),
            max_connections: 5,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml_str(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Resolve the config path from `ACCRUAL_CONFIG`, load it if present,
    /// apply environment overrides and validate.
    pub fn from_env() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut cfg = if Path::new(&path).exists() {
            Self::load(&path)?
        } else if std::env::var(CONFIG_PATH_ENV).is_ok() {
            bail!("Config file named by {CONFIG_PATH_ENV} not found: {path}");
        } else {
            Self::default()
        };
        cfg.apply_overrides(|name| std::env::var(name).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply `DATABASE_URI` / `ACCRUAL_SYSTEM_ADDRESS` from `lookup`.
    /// Empty values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(uri) = lookup(DATABASE_URI_ENV).filter(|v| !v.trim().is_empty()) {
            self.database.uri = uri;
        }
        if let Some(address) = lookup(ACCRUAL_ADDRESS_ENV).filter(|v| !v.trim().is_empty()) {
            self.accrual.address = address;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.accrual.address.trim().is_empty() {
            bail!("Accrual service address not configured (set [accrual].address or {ACCRUAL_ADDRESS_ENV})");
        }
        if self.database.uri.trim().is_empty() {
            bail!("Database URI not configured (set [database].uri or {DATABASE_URI_ENV})");
        }
        if self.engine.worker_count == 0 {
            bail!("[engine].worker_count must be at least 1");
        }
        if self.engine.poll_interval_ms == 0 {
            bail!("[engine].poll_interval_ms must be positive");
        }
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        let e = &self.engine;
        EngineConfig {
            poll_interval: Duration::from_millis(e.poll_interval_ms),
            worker_count: e.worker_count,
            queue_capacity: e.queue_capacity,
            claim_batch_size: e.claim_batch_size,
            redelivery_delay: Duration::from_millis(e.redelivery_delay_ms),
            returned_delay: Duration::from_millis(e.returned_delay_ms),
            max_pending_cycles: e.max_pending_cycles,
            recover_on_start: e.recover_on_start,
            store_retry: RetrySchedule::from_millis(&e.store_retry_delays_ms),
            error_sink_capacity: e.error_sink_capacity,
        }
    }

    pub fn accrual_timeout(&self) -> Duration {
        Duration::from_secs(self.accrual.timeout_secs)
    }

    pub fn accrual_retry(&self) -> RetrySchedule {
        RetrySchedule::from_millis(&self.accrual.retry_delays_ms)
    }
}
