//! Deduction strategies.
//!
//! Both strategies implement the same capability, "atomically take N units
//! of SKU S or decline", on top of a [`StockStore`](crate::store::StockStore):
//!
//! - [`ConditionalUpdateStrategy`]: one guarded `UPDATE`, conflict detected
//!   from the affected-row count. Never holds a lock across statements.
//! - [`PessimisticLockStrategy`]: `SELECT ... FOR UPDATE`, validate, write,
//!   commit. Serializes deductions per SKU.
//!
//! Strategies make exactly one attempt. Retrying is the caller's job (see
//! [`crate::retry`]).

pub mod conditional;
pub mod pessimistic;

use core::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use stockguard_core::Sku;
use stockguard_inventory::{Deduction, DeductionRequest, InsufficientStock};

use crate::retry::Retryable;
use crate::store::StoreError;

pub use conditional::ConditionalUpdateStrategy;
pub use pessimistic::PessimisticLockStrategy;

/// Which strategy a deployment runs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrategyKind {
    /// Single guarded `UPDATE` statement.
    #[serde(rename = "conditional")]
    ConditionalUpdate,
    /// `SELECT ... FOR UPDATE` inside a transaction.
    #[serde(rename = "pessimistic")]
    PessimisticLock,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::ConditionalUpdate => "conditional",
            StrategyKind::PessimisticLock => "pessimistic",
        }
    }
}

impl core::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "conditional" | "conditional_update" | "atomic" => Ok(StrategyKind::ConditionalUpdate),
            "pessimistic" | "pessimistic_lock" | "for_update" => Ok(StrategyKind::PessimisticLock),
            other => Err(format!(
                "unknown deduction strategy '{other}' (expected 'conditional' or 'pessimistic')"
            )),
        }
    }
}

/// Why a single deduction attempt did not commit.
#[derive(Debug, Error)]
pub enum DeductionError {
    /// Business decline; never retried.
    #[error(transparent)]
    Insufficient(#[from] InsufficientStock),

    /// No stock row for the SKU; never retried.
    #[error("sku not found: {0}")]
    NotFound(Sku),

    /// Contention signal from the store; the attempt may be re-run.
    #[error("transient store conflict: {0}")]
    Transient(StoreError),

    /// Store failure retrying cannot fix.
    #[error("store failure: {0}")]
    Fatal(StoreError),
}

impl From<StoreError> for DeductionError {
    fn from(err: StoreError) -> Self {
        if err.is_transient() {
            DeductionError::Transient(err)
        } else {
            DeductionError::Fatal(err)
        }
    }
}

impl Retryable for DeductionError {
    fn is_retryable(&self) -> bool {
        matches!(self, DeductionError::Transient(_))
    }
}

/// Capability shared by both strategies.
///
/// Implementations must leave no transaction open on any exit path and must
/// not retry internally.
#[async_trait]
pub trait DeductionStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Make one attempt at deducting `request.quantity` units.
    async fn deduct(&self, request: &DeductionRequest) -> Result<Deduction, DeductionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_kind_parses_config_spellings() {
        assert_eq!("conditional".parse(), Ok(StrategyKind::ConditionalUpdate));
        assert_eq!(" Pessimistic ".parse(), Ok(StrategyKind::PessimisticLock));
        assert_eq!("for_update".parse(), Ok(StrategyKind::PessimisticLock));
        assert!("optimistic".parse::<StrategyKind>().is_err());
    }

    #[test]
    fn strategy_kind_serializes_short_names() {
        let json = serde_json::to_string(&StrategyKind::ConditionalUpdate).unwrap();
        assert_eq!(json, "\"conditional\"");
        let back: StrategyKind = serde_json::from_str("\"pessimistic\"").unwrap();
        assert_eq!(back, StrategyKind::PessimisticLock);
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        let transient = DeductionError::from(StoreError::Deadlock("d".into()));
        let fatal = DeductionError::from(StoreError::Connection("c".into()));
        let declined = DeductionError::from(InsufficientStock {
            available: 0,
            requested: 1,
        });
        let missing = DeductionError::NotFound(Sku::new("Y").unwrap());

        assert!(transient.is_retryable());
        assert!(!fatal.is_retryable());
        assert!(!declined.is_retryable());
        assert!(!missing.is_retryable());
    }
}
