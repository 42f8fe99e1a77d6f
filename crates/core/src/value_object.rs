//! Value object trait: equality by value, not identity.
//!
//! Value objects have **no identity**; they are defined entirely by their
//! attribute values and are immutable once constructed.

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Marker trait for value objects.
///
/// The trait requires:
/// - **Clone**: value objects are cheap to copy
/// - **PartialEq**: value objects are compared by their attribute values
/// - **Debug**: value objects should be debuggable (logging, tests)
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}

/// A strictly positive number of units to deduct.
///
/// Zero and negative amounts are rejected at construction, so every
/// `Quantity` that reaches a store is a real decrement.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Quantity(i64);

impl Quantity {
    pub fn new(units: i64) -> Result<Self, DomainError> {
        if units <= 0 {
            return Err(DomainError::validation(format!(
                "quantity must be positive, got {units}"
            )));
        }
        Ok(Self(units))
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl ValueObject for Quantity {}

impl core::fmt::Display for Quantity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl TryFrom<i64> for Quantity {
    type Error = DomainError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Quantity> for i64 {
    fn from(value: Quantity) -> Self {
        value.0
    }
}
