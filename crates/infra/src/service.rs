//! Deduction service: the one entry point callers use.
//!
//! Callers hand over a [`DeductionRequest`] and always get back a terminal
//! [`DeductionOutcome`]; which strategy ran and how many attempts it took are
//! internal.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use stockguard_inventory::{DeductionOutcome, DeductionRequest};

use crate::config::StockConfig;
use crate::retry::{RetryError, RetryPolicy, with_retry};
use crate::store::StockStore;
use crate::strategy::{
    ConditionalUpdateStrategy, DeductionError, DeductionStrategy, PessimisticLockStrategy,
    StrategyKind,
};

#[derive(Clone)]
pub struct DeductionService {
    strategy: Arc<dyn DeductionStrategy>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for DeductionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeductionService")
            .field("strategy", &self.strategy.kind())
            .field("policy", &self.policy)
            .finish()
    }
}

impl DeductionService {
    pub fn new(strategy: Arc<dyn DeductionStrategy>, policy: RetryPolicy) -> Self {
        Self { strategy, policy }
    }

    /// Build the strategy `config` selects on top of `store`.
    pub fn from_config<S>(store: S, config: &StockConfig) -> Self
    where
        S: StockStore + 'static,
    {
        let strategy: Arc<dyn DeductionStrategy> = match config.strategy {
            StrategyKind::ConditionalUpdate => Arc::new(ConditionalUpdateStrategy::new(store)),
            StrategyKind::PessimisticLock => Arc::new(PessimisticLockStrategy::new(store)),
        };
        Self::new(strategy, config.retry.clone())
    }

    pub fn strategy_kind(&self) -> StrategyKind {
        self.strategy.kind()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Deduct `request.quantity` units of `request.sku`.
    ///
    /// Transient conflicts are retried under the configured policy; every
    /// other failure is reported on first occurrence.
    #[instrument(
        skip(self, request),
        fields(
            strategy = %self.strategy.kind(),
            sku = %request.sku,
            quantity = request.quantity.get()
        )
    )]
    pub async fn deduct(&self, request: DeductionRequest) -> DeductionOutcome {
        let strategy = &self.strategy;
        let request = &request;
        let result = with_retry(&self.policy, "stock_deduction", |_attempt| async move {
            strategy.deduct(request).await
        })
        .await;

        let outcome = match result {
            Ok(deduction) => DeductionOutcome::from(deduction),
            Err(RetryError::Exhausted { attempts, .. }) => {
                DeductionOutcome::ConflictRetryExhausted { attempts }
            }
            Err(RetryError::Terminal(err)) => match err {
                DeductionError::Insufficient(declined) => DeductionOutcome::from(declined),
                DeductionError::NotFound(_) => DeductionOutcome::NotFound,
                DeductionError::Fatal(err) | DeductionError::Transient(err) => {
                    warn!(error = %err, "deduction failed");
                    DeductionOutcome::StoreError {
                        message: err.to_string(),
                    }
                }
            },
        };

        info!(
            outcome = outcome.kind(),
            new_quantity = ?outcome.new_quantity(),
            "deduction finished"
        );
        outcome
    }
}
