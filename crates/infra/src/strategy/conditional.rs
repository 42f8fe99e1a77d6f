//! Atomic conditional update strategy.

use async_trait::async_trait;
use tracing::{debug, instrument};

use stockguard_inventory::{Deduction, DeductionRequest, StockRecord};

use super::{DeductionError, DeductionStrategy, StrategyKind};
use crate::store::{ConditionalUpdate, StockStore, StoreError};

/// Deducts with one guarded `UPDATE ... WHERE quantity >= :qty`.
///
/// ## Flow
///
/// 1. Issue the conditional decrement. The store evaluates the sufficiency
///    check and the write as a single statement, so there is no TOCTOU
///    window.
/// 2. One row affected: done.
/// 3. Zero rows affected: the cause is ambiguous, so read the committed
///    quantity without locking:
///    - no row → `NotFound`
///    - fewer units than requested → `InsufficientStock`
///    - enough units → a restock landed between the two statements; report
///      a transient conflict so the retry wrapper runs a fresh attempt.
///
/// No lock is held across statements; this strategy never queues behind
/// another deduction's transaction.
#[derive(Debug, Clone)]
pub struct ConditionalUpdateStrategy<S> {
    store: S,
}

impl<S> ConditionalUpdateStrategy<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

#[async_trait]
impl<S> DeductionStrategy for ConditionalUpdateStrategy<S>
where
    S: StockStore,
{
    fn kind(&self) -> StrategyKind {
        StrategyKind::ConditionalUpdate
    }

    #[instrument(
        skip(self, request),
        fields(
            strategy = "conditional",
            sku = %request.sku,
            quantity = request.quantity.get()
        ),
        err(level = "debug")
    )]
    async fn deduct(&self, request: &DeductionRequest) -> Result<Deduction, DeductionError> {
        let update = self
            .store
            .conditional_decrement(&request.sku, request.quantity, request.idempotency_key)
            .await?;

        match update {
            ConditionalUpdate::Applied { new_quantity } => Ok(Deduction::applied(new_quantity)),
            ConditionalUpdate::Replayed { new_quantity } => {
                debug!(new_quantity, "idempotency key already journaled");
                Ok(Deduction::replayed(new_quantity))
            }
            ConditionalUpdate::NotApplied => {
                let current = self.store.current_quantity(&request.sku).await?;
                let Some(current) = current else {
                    return Err(DeductionError::NotFound(request.sku.clone()));
                };

                let record = StockRecord::new(request.sku.clone(), current)
                    .map_err(|e| DeductionError::Fatal(StoreError::Decode(e.to_string())))?;

                match record.plan_deduction(request.quantity) {
                    Err(insufficient) => Err(insufficient.into()),
                    Ok(_) => Err(DeductionError::Transient(
                        StoreError::ConcurrentModification(format!(
                            "{} changed between conditional update and read ({} on hand)",
                            request.sku, current
                        )),
                    )),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::store::InMemoryStockStore;
    use stockguard_core::{IdempotencyKey, Sku};

    async fn strategy_with(quantity: i64) -> ConditionalUpdateStrategy<InMemoryStockStore> {
        let store = InMemoryStockStore::new(Duration::from_millis(200));
        store.put(Sku::new("X").unwrap(), quantity).await.unwrap();
        ConditionalUpdateStrategy::new(store)
    }

    #[tokio::test]
    async fn deducts_when_stock_covers_request() {
        let strategy = strategy_with(5).await;
        let request = DeductionRequest::parse("X", 3).unwrap();

        let deduction = strategy.deduct(&request).await.unwrap();
        assert_eq!(deduction, Deduction::applied(2));
    }

    #[tokio::test]
    async fn declines_without_touching_stock() {
        let strategy = strategy_with(2).await;
        let request = DeductionRequest::parse("X", 3).unwrap();

        for _ in 0..3 {
            let err = strategy.deduct(&request).await.unwrap_err();
            assert!(matches!(
                err,
                DeductionError::Insufficient(i) if i.available == 2 && i.requested == 3
            ));
        }
        let sku = Sku::new("X").unwrap();
        assert_eq!(strategy.store().current_quantity(&sku).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn unknown_sku_is_not_found() {
        let strategy = strategy_with(5).await;
        let request = DeductionRequest::parse("Y", 1).unwrap();

        let err = strategy.deduct(&request).await.unwrap_err();
        assert!(matches!(err, DeductionError::NotFound(sku) if sku.as_str() == "Y"));
    }

    #[tokio::test]
    async fn store_conflict_surfaces_as_transient() {
        let strategy = strategy_with(5).await;
        strategy.store().inject_conflicts(1);
        let request = DeductionRequest::parse("X", 1).unwrap();

        let err = strategy.deduct(&request).await.unwrap_err();
        assert!(matches!(err, DeductionError::Transient(_)));
    }

    #[tokio::test]
    async fn repeated_key_is_replayed_once_deducted() {
        let strategy = strategy_with(5).await;
        let request = DeductionRequest::parse("X", 2)
            .unwrap()
            .with_idempotency_key(IdempotencyKey::new());

        assert_eq!(strategy.deduct(&request).await.unwrap(), Deduction::applied(3));
        assert_eq!(strategy.deduct(&request).await.unwrap(), Deduction::replayed(3));
    }
}
