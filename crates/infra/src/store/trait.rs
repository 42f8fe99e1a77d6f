use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use stockguard_core::{IdempotencyKey, Quantity, Sku};

/// Result of a single-statement conditional decrement.
///
/// ## Row Count Semantics
///
/// The store executes the equivalent of
/// `UPDATE stock SET quantity = quantity - :qty WHERE sku = :sku AND quantity >= :qty`
/// as one indivisible statement. The check and the write are the same
/// statement, so there is no window between them for another writer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConditionalUpdate {
    /// One row matched and was decremented.
    Applied { new_quantity: i64 },
    /// The idempotency key was already journaled; nothing was decremented.
    Replayed { new_quantity: i64 },
    /// No row matched: the SKU is missing or holds too few units.
    NotApplied,
}

impl ConditionalUpdate {
    /// Number of stock rows the statement changed.
    pub fn rows_affected(&self) -> u64 {
        match self {
            ConditionalUpdate::Applied { .. } => 1,
            ConditionalUpdate::Replayed { .. } | ConditionalUpdate::NotApplied => 0,
        }
    }
}

/// How the deduction core treats a store error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorClass {
    /// Contention signal; re-running the attempt may succeed.
    Transient,
    /// Re-running would fail the same way; surface immediately.
    Fatal,
}

/// Store operation error.
///
/// These are **infrastructure errors**. Business declines (not enough stock)
/// are never produced by a store; the core computes them from fresh reads.
///
/// ## Error Categories
///
/// - **Transient**: `LockTimeout`, `SerializationFailure`, `Deadlock`,
///   `DuplicateDeduction`, `ConcurrentModification`
/// - **Fatal**: `Connection`, `Constraint`, `Decode`, `Database`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("lock wait timed out: {0}")]
    LockTimeout(String),

    #[error("serialization failure: {0}")]
    SerializationFailure(String),

    #[error("deadlock detected: {0}")]
    Deadlock(String),

    /// Two requests with the same idempotency key raced to journal.
    #[error("concurrent duplicate deduction: {0}")]
    DuplicateDeduction(String),

    /// The row changed between two statements of one attempt.
    #[error("concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("connection failure: {0}")]
    Connection(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("malformed row: {0}")]
    Decode(String),

    #[error("database error: {0}")]
    Database(String),
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::LockTimeout(_)
            | StoreError::SerializationFailure(_)
            | StoreError::Deadlock(_)
            | StoreError::DuplicateDeduction(_)
            | StoreError::ConcurrentModification(_) => ErrorClass::Transient,
            StoreError::Connection(_)
            | StoreError::Constraint(_)
            | StoreError::Decode(_)
            | StoreError::Database(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// Transactional access to stock rows.
///
/// This is the narrow seam the deduction strategies consume. It makes no
/// assumption about the backing store beyond row-level atomicity of single
/// statements and exclusive row locks for locking reads.
///
/// ## Implementation Requirements
///
/// Implementations must:
/// - execute `conditional_decrement` as one atomic statement
/// - never let a committed quantity go below zero
/// - bound every lock wait with a finite timeout and report it as
///   `StoreError::LockTimeout`
/// - roll back a transaction that is dropped without `commit`
#[async_trait]
pub trait StockStore: Send + Sync {
    type Tx: StockTransaction;

    /// Decrement `quantity` units of `sku` if, and only if, enough are on hand.
    ///
    /// When `key` is given the deduction is journaled in the same statement,
    /// and an already journaled key yields `ConditionalUpdate::Replayed`.
    async fn conditional_decrement(
        &self,
        sku: &Sku,
        quantity: Quantity,
        key: Option<IdempotencyKey>,
    ) -> Result<ConditionalUpdate, StoreError>;

    /// Non-locking read of the committed quantity. `None` if the SKU is unknown.
    async fn current_quantity(&self, sku: &Sku) -> Result<Option<i64>, StoreError>;

    /// Open a transaction scoped to one deduction attempt.
    async fn begin(&self) -> Result<Self::Tx, StoreError>;
}

/// One open unit of work. Consumed by `commit` or `rollback`.
#[async_trait]
pub trait StockTransaction: Send {
    /// Read the quantity while taking an exclusive row lock held until the
    /// transaction ends. `None` if the SKU is unknown.
    async fn locking_read(&mut self, sku: &Sku) -> Result<Option<i64>, StoreError>;

    /// Quantity journaled for `key` by an earlier committed deduction.
    async fn recorded_deduction(&mut self, key: IdempotencyKey)
    -> Result<Option<i64>, StoreError>;

    /// Overwrite the quantity of a row previously read with `locking_read`.
    async fn write(&mut self, sku: &Sku, new_quantity: i64) -> Result<(), StoreError>;

    /// Journal a deduction under `key` (visible to others after commit).
    async fn record_deduction(
        &mut self,
        key: IdempotencyKey,
        sku: &Sku,
        quantity: Quantity,
        new_quantity: i64,
    ) -> Result<(), StoreError>;

    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

#[async_trait]
impl<S> StockStore for Arc<S>
where
    S: StockStore + ?Sized,
{
    type Tx = S::Tx;

    async fn conditional_decrement(
        &self,
        sku: &Sku,
        quantity: Quantity,
        key: Option<IdempotencyKey>,
    ) -> Result<ConditionalUpdate, StoreError> {
        (**self).conditional_decrement(sku, quantity, key).await
    }

    async fn current_quantity(&self, sku: &Sku) -> Result<Option<i64>, StoreError> {
        (**self).current_quantity(sku).await
    }

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        (**self).begin().await
    }
}
