//! Inventory deduction domain.
//!
//! This crate contains the business rules for deducting stock, implemented
//! purely as deterministic logic (no IO, no storage). The infra crate runs
//! these rules inside store transactions.

pub mod outcome;
pub mod stock;

pub use outcome::DeductionOutcome;
pub use stock::{Deduction, DeductionRequest, InsufficientStock, StockRecord};
