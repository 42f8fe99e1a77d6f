//! The four terminal results a deduction caller can receive.

use serde::{Deserialize, Serialize};

use crate::stock::{Deduction, InsufficientStock};

/// Final result of one deduction request.
///
/// Every call resolves to exactly one of these; store errors never leak to
/// the caller in raw form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeductionOutcome {
    /// Stock was deducted (or an earlier deduction with the same idempotency
    /// key was found and reported again).
    Success { new_quantity: i64, replayed: bool },
    /// Declined: the row holds fewer units than requested. Stock unchanged.
    InsufficientStock { available: i64, requested: i64 },
    /// Every attempt hit a transient store conflict.
    ConflictRetryExhausted { attempts: u32 },
    /// The SKU has no stock row.
    NotFound,
    /// A non-retryable store failure.
    StoreError { message: String },
}

impl DeductionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Quantity left on the row, when the outcome reports it.
    pub fn new_quantity(&self) -> Option<i64> {
        match self {
            Self::Success { new_quantity, .. } => Some(*new_quantity),
            _ => None,
        }
    }

    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::InsufficientStock { .. } => "insufficient_stock",
            Self::ConflictRetryExhausted { .. } => "conflict_retry_exhausted",
            Self::NotFound => "not_found",
            Self::StoreError { .. } => "store_error",
        }
    }
}

impl From<Deduction> for DeductionOutcome {
    fn from(value: Deduction) -> Self {
        Self::Success {
            new_quantity: value.new_quantity,
            replayed: value.replayed,
        }
    }
}

impl From<InsufficientStock> for DeductionOutcome {
    fn from(value: InsufficientStock) -> Self {
        Self::InsufficientStock {
            available: value.available,
            requested: value.requested,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_is_tagged_for_callers() {
        let json = serde_json::to_value(DeductionOutcome::from(Deduction::applied(2))).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"outcome": "success", "new_quantity": 2, "replayed": false})
        );

        let json = serde_json::to_value(DeductionOutcome::NotFound).unwrap();
        assert_eq!(json, serde_json::json!({"outcome": "not_found"}));
    }

    #[test]
    fn only_success_reports_quantity() {
        let declined = DeductionOutcome::from(InsufficientStock {
            available: 1,
            requested: 3,
        });
        assert!(!declined.is_success());
        assert_eq!(declined.new_quantity(), None);
        assert_eq!(declined.kind(), "insufficient_stock");

        let ok = DeductionOutcome::from(Deduction::replayed(7));
        assert_eq!(ok.new_quantity(), Some(7));
    }
}
