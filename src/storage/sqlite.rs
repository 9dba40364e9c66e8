//! SQLite-backed order store.
//!
//! SQLite has no `FOR UPDATE SKIP LOCKED`. The claim is a single
//! `UPDATE … RETURNING`, which SQLite runs under its database write lock,
//! so two claimants can never receive the same NEW order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info};

use super::{OrderStore, StoreError};
use crate::types::{
    from_minor_units, to_minor_units, Balance, Order, OrderNumber, OrderStatus, Withdrawal,
};

const ORDER_COLUMNS: &str = "number, login, status, accrual, uploaded_at";

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `uri` and run migrations.
    pub async fn connect(uri: &str, max_connections: u32) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(uri)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        info!(uri, max_connections, "Order store ready");
        Ok(store)
    }

    /// A private in-memory database. The pool keeps a single connection
    /// alive forever because every SQLite memory connection is its own DB.
    pub async fn connect_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    // -- Users -----------------------------------------------------------

    pub async fn create_user(&self, login: &str) -> Result<(), StoreError> {
        let result = sqlx::query("INSERT INTO users (login) VALUES (?)")
            .bind(login)
            .execute(&self.pool)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::LoginTaken(login.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn balance(&self, login: &str) -> Result<Balance, StoreError> {
        let row = sqlx::query("SELECT balance_current, balance_withdrawn FROM users WHERE login = ?")
            .bind(login)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::UserNotFound(login.to_string()))?;
        Ok(Balance {
            current: from_minor_units(row.try_get("balance_current")?),
            withdrawn: from_minor_units(row.try_get("balance_withdrawn")?),
        })
    }

    // -- Orders ----------------------------------------------------------

    /// Record a NEW order for `login`. The number must pass the Luhn check.
    pub async fn upload_order(&self, login: &str, number: &str) -> Result<Order, StoreError> {
        let number = OrderNumber::parse(number)?;
        self.ensure_user(login).await?;

        let uploaded_at = Utc::now();
        let result = sqlx::query(
            "INSERT INTO orders (number, login, status, uploaded_at) VALUES (?, ?, 'NEW', ?)",
        )
        .bind(number.as_str())
        .bind(login)
        .bind(uploaded_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                debug!(order = %number, login, "Order uploaded");
                Ok(Order {
                    number: number.to_string(),
                    login: login.to_string(),
                    status: OrderStatus::New,
                    accrual: None,
                    uploaded_at,
                })
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                let owner: String = sqlx::query_scalar("SELECT login FROM orders WHERE number = ?")
                    .bind(number.as_str())
                    .fetch_one(&self.pool)
                    .await?;
                if owner == login {
                    Err(StoreError::OrderAlreadyUploaded(number.to_string()))
                } else {
                    Err(StoreError::OrderOwnedByAnotherUser(number.to_string()))
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn fetch_order(&self, number: &str) -> Result<Option<Order>, StoreError> {
        let row = sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE number = ?"))
            .bind(number)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(order_from_row).transpose()
    }

    /// Orders uploaded by `login`, newest first.
    pub async fn orders_for_user(&self, login: &str) -> Result<Vec<Order>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE login = ? ORDER BY uploaded_at DESC, rowid DESC"
        ))
        .bind(login)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(order_from_row).collect()
    }

    // -- Withdrawals -----------------------------------------------------

    /// Debit `sum` from the user's balance against `order`, atomically
    /// refusing when the balance would go negative.
    pub async fn withdraw(&self, login: &str, order: &str, sum: Decimal) -> Result<Withdrawal, StoreError> {
        let order = OrderNumber::parse(order)?;
        let minor = to_minor_units(sum)
            .filter(|m| *m > 0)
            .ok_or(StoreError::AmountOutOfRange(sum))?;

        let mut tx = self.pool.begin().await?;

        let debited = sqlx::query(
            "UPDATE users
                SET balance_current = balance_current - ?,
                    balance_withdrawn = balance_withdrawn + ?
              WHERE login = ? AND balance_current >= ?",
        )
        .bind(minor)
        .bind(minor)
        .bind(login)
        .bind(minor)
        .execute(&mut *tx)
        .await?;

        if debited.rows_affected() == 0 {
            let available: Option<i64> =
                sqlx::query_scalar("SELECT balance_current FROM users WHERE login = ?")
                    .bind(login)
                    .fetch_optional(&mut *tx)
                    .await?;
            return Err(match available {
                Some(current) => StoreError::InsufficientFunds {
                    needed: sum,
                    available: from_minor_units(current),
                },
                None => StoreError::UserNotFound(login.to_string()),
            });
        }

        let processed_at = Utc::now();
        sqlx::query(
            "INSERT INTO withdrawals (order_number, login, sum, processed_at) VALUES (?, ?, ?, ?)",
        )
        .bind(order.as_str())
        .bind(login)
        .bind(minor)
        .bind(processed_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(login, order = %order, sum = %sum, "Withdrawal recorded");

        Ok(Withdrawal {
            order: order.to_string(),
            sum: from_minor_units(minor),
            processed_at,
        })
    }

    /// Withdrawals made by `login`, newest first.
    pub async fn withdrawals_for_user(&self, login: &str) -> Result<Vec<Withdrawal>, StoreError> {
        let rows = sqlx::query(
            "SELECT order_number, sum, processed_at FROM withdrawals
              WHERE login = ? ORDER BY processed_at DESC, id DESC",
        )
        .bind(login)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(Withdrawal {
                    order: row.try_get("order_number")?,
                    sum: from_minor_units(row.try_get("sum")?),
                    processed_at: row.try_get("processed_at")?,
                })
            })
            .collect()
    }

    async fn ensure_user(&self, login: &str) -> Result<(), StoreError> {
        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM users WHERE login = ?")
            .bind(login)
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => Ok(()),
            None => Err(StoreError::UserNotFound(login.to_string())),
        }
    }
}

#[async_trait]
impl OrderStore for SqliteStore {
    async fn claim_new_orders(&self, limit: u32) -> Result<Vec<Order>, StoreError> {
        let rows = sqlx::query(&format!(
            "UPDATE orders SET status = 'PROCESSING'
              WHERE status = 'NEW'
                AND number IN (SELECT number FROM orders WHERE status = 'NEW'
                                ORDER BY uploaded_at, rowid LIMIT ?)
          RETURNING {ORDER_COLUMNS}"
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut orders = rows.iter().map(order_from_row).collect::<Result<Vec<_>, _>>()?;
        // RETURNING yields rows in no particular order.
        orders.sort_by(|a, b| a.uploaded_at.cmp(&b.uploaded_at));

        if !orders.is_empty() {
            debug!(count = orders.len(), "Claimed new orders");
        }
        Ok(orders)
    }

    async fn settle_order(&self, order: &Order) -> Result<(), StoreError> {
        if !order.status.is_terminal() {
            return Err(StoreError::NotTerminal {
                number: order.number.clone(),
                status: order.status,
            });
        }

        let accrual = match order.status {
            OrderStatus::Processed => {
                let amount = order.accrual.unwrap_or(Decimal::ZERO);
                let minor = to_minor_units(amount)
                    .filter(|m| *m >= 0)
                    .ok_or(StoreError::AmountOutOfRange(amount))?;
                Some(minor)
            }
            _ => None,
        };

        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE orders SET status = ?, accrual = ? WHERE number = ? AND status = 'PROCESSING'",
        )
        .bind(order.status.as_str())
        .bind(accrual)
        .bind(&order.number)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM orders WHERE number = ?")
                .bind(&order.number)
                .fetch_optional(&mut *tx)
                .await?;
            return Err(match exists {
                Some(_) => StoreError::NotClaimed(order.number.clone()),
                None => StoreError::OrderNotFound(order.number.clone()),
            });
        }

        if let Some(minor) = accrual {
            // Credit the recorded owner, not whoever the caller says it is.
            let credited = sqlx::query(
                "UPDATE users SET balance_current = balance_current + ?
                  WHERE login = (SELECT login FROM orders WHERE number = ?)",
            )
            .bind(minor)
            .bind(&order.number)
            .execute(&mut *tx)
            .await?;
            if credited.rows_affected() == 0 {
                return Err(StoreError::UserNotFound(order.login.clone()));
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn reset_order_to_new(&self, number: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE orders SET status = 'NEW' WHERE number = ?")
            .bind(number)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn release_stale_claims(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("UPDATE orders SET status = 'NEW' WHERE status = 'PROCESSING'")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn order_from_row(row: &SqliteRow) -> Result<Order, StoreError> {
    let status: String = row.try_get("status")?;
    let status = OrderStatus::from_str(&status).map_err(StoreError::Corrupt)?;
    let accrual: Option<i64> = row.try_get("accrual")?;
    let uploaded_at: DateTime<Utc> = row.try_get("uploaded_at")?;
    Ok(Order {
        number: row.try_get("number")?,
        login: row.try_get("login")?,
        status,
        accrual: accrual.map(from_minor_units),
        uploaded_at,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
