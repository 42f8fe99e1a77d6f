//! Pessimistic row-lock strategy.

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use stockguard_inventory::{Deduction, DeductionRequest, StockRecord};

use super::{DeductionError, DeductionStrategy, StrategyKind};
use crate::store::{StockStore, StockTransaction, StoreError};

/// Deducts inside a transaction that holds the row lock from read to commit.
///
/// ## Flow
///
/// 1. `BEGIN`
/// 2. `SELECT quantity ... FOR UPDATE` (waits up to the lock timeout)
/// 3. Validate against the locked value
/// 4. `UPDATE` and, with an idempotency key, journal the deduction
/// 5. `COMMIT`
///
/// Every exit after step 1 ends the transaction exactly once: commit on
/// success, rollback on any decline or error. If the future is dropped
/// mid-flight the transaction handle rolls back when it is dropped.
#[derive(Debug, Clone)]
pub struct PessimisticLockStrategy<S> {
    store: S,
}

impl<S> PessimisticLockStrategy<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

/// Steps 2-4, run while `tx` is open.
async fn locked_deduct<T>(
    tx: &mut T,
    request: &DeductionRequest,
) -> Result<Deduction, DeductionError>
where
    T: StockTransaction,
{
    let Some(current) = tx.locking_read(&request.sku).await? else {
        return Err(DeductionError::NotFound(request.sku.clone()));
    };

    // The row lock serializes us with any other deduction carrying this key.
    if let Some(key) = request.idempotency_key {
        if let Some(new_quantity) = tx.recorded_deduction(key).await? {
            debug!(new_quantity, "idempotency key already journaled");
            return Ok(Deduction::replayed(new_quantity));
        }
    }

    let record = StockRecord::new(request.sku.clone(), current)
        .map_err(|e| DeductionError::Fatal(StoreError::Decode(e.to_string())))?;
    let new_quantity = record.plan_deduction(request.quantity)?;

    tx.write(&request.sku, new_quantity).await?;
    if let Some(key) = request.idempotency_key {
        tx.record_deduction(key, &request.sku, request.quantity, new_quantity)
            .await?;
    }

    Ok(Deduction::applied(new_quantity))
}

#[async_trait]
impl<S> DeductionStrategy for PessimisticLockStrategy<S>
where
    S: StockStore,
{
    fn kind(&self) -> StrategyKind {
        StrategyKind::PessimisticLock
    }

    #[instrument(
        skip(self, request),
        fields(
            strategy = "pessimistic",
            sku = %request.sku,
            quantity = request.quantity.get()
        ),
        err(level = "debug")
    )]
    async fn deduct(&self, request: &DeductionRequest) -> Result<Deduction, DeductionError> {
        let mut tx = self.store.begin().await?;

        match locked_deduct(&mut tx, request).await {
            Ok(deduction) if !deduction.replayed => {
                tx.commit().await?;
                Ok(deduction)
            }
            outcome => {
                if let Err(err) = tx.rollback().await {
                    warn!(error = %err, "rollback failed; connection will discard the transaction");
                }
                outcome
            }
        }
    }
}
