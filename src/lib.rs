//! Loyalty accrual engine.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod engine;
pub mod oracle;
pub mod retry;
pub mod storage;
pub mod types;
