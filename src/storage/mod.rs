//! Persistence layer.
//!
//! Defines the `OrderStore` trait, the atomic primitives the engine relies
//! on, and the SQLite implementation that also carries the record-keeping
//! operations for users, uploads and withdrawals.

pub mod sqlite;

use async_trait::async_trait;

use crate::types::{Order, OrderNumberError, OrderStatus};

pub use sqlite::SqliteStore;

/// Errors surfaced by the store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Driver(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("order not found: {0}")]
    OrderNotFound(String),

    #[error("order {0} is not claimed for processing")]
    NotClaimed(String),

    #[error("cannot settle order {number} with non-terminal status {status}")]
    NotTerminal { number: String, status: OrderStatus },

    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("login is already taken: {0}")]
    LoginTaken(String),

    #[error(transparent)]
    InvalidOrderNumber(#[from] OrderNumberError),

    #[error("order {0} was already uploaded by this user")]
    OrderAlreadyUploaded(String),

    #[error("order {0} was already uploaded by another user")]
    OrderOwnedByAnotherUser(String),

    #[error("insufficient funds: need {needed}, have {available}")]
    InsufficientFunds {
        needed: rust_decimal::Decimal,
        available: rust_decimal::Decimal,
    },

    #[error("amount out of range: {0}")]
    AmountOutOfRange(rust_decimal::Decimal),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether retrying the same call may succeed: lost connections, pool
    /// exhaustion and a busy or locked database.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Driver(e) => match e {
                sqlx::Error::Io(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed => true,
                sqlx::Error::Database(db) => {
                    matches!(db.code().as_deref(), Some("5" | "6" | "261" | "517"))
                }
                _ => false,
            },
            _ => false,
        }
    }
}

/// Store primitives consumed by the accrual engine.
///
/// Every method is atomic on its own; settlement is the only path that
/// credits a balance.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Flip up to `limit` NEW orders (oldest first) to PROCESSING and return
    /// them. No order is ever returned to two callers.
    async fn claim_new_orders(&self, limit: u32) -> Result<Vec<Order>, StoreError>;

    /// Persist a terminal verdict. When the status is PROCESSED the owner's
    /// balance is credited by the accrual in the same transaction.
    async fn settle_order(&self, order: &Order) -> Result<(), StoreError>;

    /// Unconditionally put the order back to NEW.
    async fn reset_order_to_new(&self, number: &str) -> Result<(), StoreError>;

    /// Reset every PROCESSING order to NEW, returning how many were reset.
    async fn release_stale_claims(&self) -> Result<u64, StoreError>;
}
