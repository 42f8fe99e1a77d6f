use serde::{Deserialize, Serialize};
use thiserror::Error;

use stockguard_core::{DomainError, IdempotencyKey, Quantity, Sku};

/// Current committed state of one inventory row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockRecord {
    sku: Sku,
    quantity: i64,
}

impl StockRecord {
    /// Build a record from a row read out of the store.
    ///
    /// A negative quantity can only come from a corrupted row; it is rejected
    /// rather than silently clamped.
    pub fn new(sku: Sku, quantity: i64) -> Result<Self, DomainError> {
        if quantity < 0 {
            return Err(DomainError::validation(format!(
                "stock for {sku} is negative ({quantity})"
            )));
        }
        Ok(Self { sku, quantity })
    }

    pub fn sku(&self) -> &Sku {
        &self.sku
    }

    pub fn quantity(&self) -> i64 {
        self.quantity
    }

    pub fn can_cover(&self, requested: Quantity) -> bool {
        self.quantity >= requested.get()
    }

    /// Decide the quantity that remains after deducting `requested`.
    ///
    /// This must not mutate state; the caller writes the returned value while
    /// still holding whatever guarantees it read `self` under.
    pub fn plan_deduction(&self, requested: Quantity) -> Result<i64, InsufficientStock> {
        if !self.can_cover(requested) {
            return Err(InsufficientStock {
                available: self.quantity,
                requested: requested.get(),
            });
        }
        Ok(self.quantity - requested.get())
    }
}

/// Business decline: the row does not hold enough units.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("insufficient stock: {available} available, {requested} requested")]
pub struct InsufficientStock {
    pub available: i64,
    pub requested: i64,
}

/// A request to take `quantity` units of `sku`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeductionRequest {
    pub sku: Sku,
    pub quantity: Quantity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<IdempotencyKey>,
}

impl DeductionRequest {
    pub fn new(sku: Sku, quantity: Quantity) -> Self {
        Self {
            sku,
            quantity,
            idempotency_key: None,
        }
    }

    /// Parse raw caller input.
    pub fn parse(sku: &str, quantity: i64) -> Result<Self, DomainError> {
        Ok(Self::new(sku.parse()?, Quantity::new(quantity)?))
    }

    pub fn with_idempotency_key(mut self, key: IdempotencyKey) -> Self {
        self.idempotency_key = Some(key);
        self
    }
}

/// A committed deduction.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deduction {
    /// Quantity left on the row right after this deduction committed.
    pub new_quantity: i64,
    /// True when the idempotency key had already been journaled and nothing
    /// was deducted by this call.
    pub replayed: bool,
}

impl Deduction {
    pub fn applied(new_quantity: i64) -> Self {
        Self {
            new_quantity,
            replayed: false,
        }
    }

    pub fn replayed(new_quantity: i64) -> Self {
        Self {
            new_quantity,
            replayed: true,
        }
    }
}
