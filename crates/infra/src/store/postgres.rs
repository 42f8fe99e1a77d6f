//! Postgres-backed stock store implementation.
//!
//! This module runs the deduction primitives against PostgreSQL, which acts
//! as the single serialization point for every process sharing the database.
//!
//! ## Expected Schema
//!
//! Schema migration is owned outside this workspace. The store expects:
//!
//! ```sql
//! CREATE TABLE stock (
//!     sku         TEXT PRIMARY KEY,
//!     quantity    BIGINT NOT NULL CHECK (quantity >= 0),
//!     updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//!
//! CREATE TABLE stock_deductions (
//!     idempotency_key     UUID PRIMARY KEY,
//!     sku                 TEXT NOT NULL,
//!     quantity            BIGINT NOT NULL,
//!     resulting_quantity  BIGINT NOT NULL,
//!     deducted_at         TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//! ```
//!
//! ## Error Mapping
//!
//! | SQLx Error | SQLSTATE | StoreError |
//! |------------|----------|------------|
//! | Database (serialization_failure) | `40001` | `SerializationFailure` |
//! | Database (deadlock_detected) | `40P01` | `Deadlock` |
//! | Database (lock_not_available) | `55P03` | `LockTimeout` |
//! | Database (query_canceled) | `57014` | `LockTimeout` |
//! | Database (unique violation on `stock_deductions_pkey`) | `23505` | `DuplicateDeduction` |
//! | Database (other integrity violation) | `23xxx` | `Constraint` |
//! | Database (other) | any other | `Database` |
//! | Io / Tls / PoolTimedOut / PoolClosed | N/A | `Connection` |
//! | ColumnDecode / Decode / RowNotFound | N/A | `Decode` |
//! | Other | N/A | `Database` |
//!
//! ## Thread Safety
//!
//! `PostgresStockStore` is `Send + Sync` and cheap to clone; all operations go
//! through the SQLx connection pool.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};

use stockguard_core::{IdempotencyKey, Quantity, Sku};

use super::r#trait::{ConditionalUpdate, StockStore, StockTransaction, StoreError};

const JOURNAL_PRIMARY_KEY: &str = "stock_deductions_pkey";

/// Postgres-backed stock store.
///
/// ## Lock Waits
///
/// Every transaction opened by `begin()` sets `lock_timeout` locally, so a
/// locking read never waits longer than the configured bound. Single
/// statements issued outside a transaction inherit the session setting; use
/// [`PostgresStockStore::connect_options`] to apply the same bound there.
#[derive(Debug, Clone)]
pub struct PostgresStockStore {
    pool: Arc<PgPool>,
    lock_timeout: Duration,
}

impl PostgresStockStore {
    /// Create a new store on top of an existing connection pool.
    pub fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self {
            pool: Arc::new(pool),
            lock_timeout,
        }
    }

    /// Connection options with a session-level `lock_timeout`.
    pub fn connect_options(
        database_url: &str,
        lock_timeout: Duration,
    ) -> Result<PgConnectOptions, StoreError> {
        let options: PgConnectOptions = database_url
            .parse()
            .map_err(|e| StoreError::Connection(format!("invalid database url: {e}")))?;
        Ok(options.options([("lock_timeout", lock_timeout_setting(lock_timeout))]))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn conditional_decrement_plain(
        &self,
        sku: &Sku,
        quantity: Quantity,
    ) -> Result<ConditionalUpdate, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE stock
            SET quantity = quantity - $2,
                updated_at = NOW()
            WHERE sku = $1 AND quantity >= $2
            RETURNING quantity
            "#,
        )
        .bind(sku.as_str())
        .bind(quantity.get())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("conditional_decrement", e))?;

        match row {
            Some(row) => Ok(ConditionalUpdate::Applied {
                new_quantity: read_i64(&row, "quantity")?,
            }),
            None => Ok(ConditionalUpdate::NotApplied),
        }
    }

    /// Journal lookup, guarded decrement and journal insert as one statement.
    ///
    /// Two requests racing with the same key both miss `prior`; the loser
    /// fails on the journal primary key and the whole statement (including
    /// its decrement) is undone.
    async fn conditional_decrement_journaled(
        &self,
        sku: &Sku,
        quantity: Quantity,
        key: IdempotencyKey,
    ) -> Result<ConditionalUpdate, StoreError> {
        let row = sqlx::query(
            r#"
            WITH prior AS (
                SELECT resulting_quantity
                FROM stock_deductions
                WHERE idempotency_key = $3
            ),
            applied AS (
                UPDATE stock
                SET quantity = quantity - $2,
                    updated_at = NOW()
                WHERE sku = $1
                    AND quantity >= $2
                    AND NOT EXISTS (SELECT 1 FROM prior)
                RETURNING quantity
            ),
            journaled AS (
                INSERT INTO stock_deductions (idempotency_key, sku, quantity, resulting_quantity)
                SELECT $3, $1, $2, quantity FROM applied
            )
            SELECT quantity AS new_quantity, FALSE AS replayed FROM applied
            UNION ALL
            SELECT resulting_quantity AS new_quantity, TRUE AS replayed FROM prior
            "#,
        )
        .bind(sku.as_str())
        .bind(quantity.get())
        .bind(key.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("conditional_decrement", e))?;

        let Some(row) = row else {
            return Ok(ConditionalUpdate::NotApplied);
        };

        let new_quantity = read_i64(&row, "new_quantity")?;
        let replayed: bool = row
            .try_get("replayed")
            .map_err(|e| StoreError::Decode(format!("failed to read replayed: {e}")))?;

        if replayed {
            Ok(ConditionalUpdate::Replayed { new_quantity })
        } else {
            Ok(ConditionalUpdate::Applied { new_quantity })
        }
    }
}

#[async_trait]
impl StockStore for PostgresStockStore {
    type Tx = PgStockTransaction;

    #[instrument(
        skip(self),
        fields(sku = %sku, quantity = quantity.get(), rows_affected = tracing::field::Empty),
        err
    )]
    async fn conditional_decrement(
        &self,
        sku: &Sku,
        quantity: Quantity,
        key: Option<IdempotencyKey>,
    ) -> Result<ConditionalUpdate, StoreError> {
        let result = match key {
            Some(key) => self.conditional_decrement_journaled(sku, quantity, key).await?,
            None => self.conditional_decrement_plain(sku, quantity).await?,
        };
        Span::current().record("rows_affected", result.rows_affected());
        Ok(result)
    }

    #[instrument(skip(self), fields(sku = %sku), err(level = "debug"))]
    async fn current_quantity(&self, sku: &Sku) -> Result<Option<i64>, StoreError> {
        let row = sqlx::query("SELECT quantity FROM stock WHERE sku = $1")
            .bind(sku.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("current_quantity", e))?;

        row.map(|row| read_i64(&row, "quantity")).transpose()
    }

    #[instrument(skip(self), err(level = "debug"))]
    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // `SET LOCAL` cannot take bind parameters; set_config(.., true) is
        // the transaction-scoped equivalent.
        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(lock_timeout_setting(self.lock_timeout))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("set_lock_timeout", e))?;

        Ok(PgStockTransaction { tx })
    }
}

/// Open Postgres transaction. Dropping it without `commit` rolls back.
pub struct PgStockTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StockTransaction for PgStockTransaction {
    #[instrument(skip(self), fields(sku = %sku), err(level = "debug"))]
    async fn locking_read(&mut self, sku: &Sku) -> Result<Option<i64>, StoreError> {
        let row = sqlx::query("SELECT quantity FROM stock WHERE sku = $1 FOR UPDATE")
            .bind(sku.as_str())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("locking_read", e))?;

        row.map(|row| read_i64(&row, "quantity")).transpose()
    }

    async fn recorded_deduction(
        &mut self,
        key: IdempotencyKey,
    ) -> Result<Option<i64>, StoreError> {
        let row = sqlx::query(
            "SELECT resulting_quantity FROM stock_deductions WHERE idempotency_key = $1",
        )
        .bind(key.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("recorded_deduction", e))?;

        row.map(|row| read_i64(&row, "resulting_quantity"))
            .transpose()
    }

    #[instrument(skip(self), fields(sku = %sku), err(level = "debug"))]
    async fn write(&mut self, sku: &Sku, new_quantity: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE stock
            SET quantity = $2,
                updated_at = NOW()
            WHERE sku = $1
            "#,
        )
        .bind(sku.as_str())
        .bind(new_quantity)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("write", e))?;

        if result.rows_affected() != 1 {
            return Err(StoreError::Database(format!(
                "stock row {sku} disappeared while locked"
            )));
        }
        Ok(())
    }

    async fn record_deduction(
        &mut self,
        key: IdempotencyKey,
        sku: &Sku,
        quantity: Quantity,
        new_quantity: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO stock_deductions (idempotency_key, sku, quantity, resulting_quantity)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(key.as_uuid())
        .bind(sku.as_str())
        .bind(quantity.get())
        .bind(new_quantity)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("record_deduction", e))?;

        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

fn lock_timeout_setting(timeout: Duration) -> String {
    // Postgres treats 0 as "wait forever"; never emit it.
    format!("{}ms", timeout.as_millis().max(1))
}

fn read_i64(row: &PgRow, column: &str) -> Result<i64, StoreError> {
    row.try_get(column)
        .map_err(|e| StoreError::Decode(format!("failed to read {column}: {e}")))
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            let code = db_err.code().map(|c| c.into_owned()).unwrap_or_default();
            classify_sqlstate(&code, db_err.constraint(), msg)
        }
        sqlx::Error::Io(e) => StoreError::Connection(format!("io error in {operation}: {e}")),
        sqlx::Error::Tls(e) => StoreError::Connection(format!("tls error in {operation}: {e}")),
        sqlx::Error::PoolTimedOut => {
            StoreError::Connection(format!("connection pool timed out in {operation}"))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Connection(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::RowNotFound => {
            StoreError::Decode(format!("unexpected row not found in {operation}"))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Decode(format!("decode error in {operation}: {err}"))
        }
        _ => StoreError::Database(format!("sqlx error in {operation}: {err}")),
    }
}

fn classify_sqlstate(code: &str, constraint: Option<&str>, msg: String) -> StoreError {
    match code {
        "40001" => StoreError::SerializationFailure(msg),
        "40P01" => StoreError::Deadlock(msg),
        // lock_not_available is raised when lock_timeout expires; query_canceled
        // when a statement_timeout cuts the wait short.
        "55P03" | "57014" => StoreError::LockTimeout(msg),
        "23505" if constraint == Some(JOURNAL_PRIMARY_KEY) => StoreError::DuplicateDeduction(msg),
        c if c.starts_with("23") => StoreError::Constraint(msg),
        _ => StoreError::Database(msg),
    }
}
