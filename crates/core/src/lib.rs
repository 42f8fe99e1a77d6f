//! `stockguard-core`: shared building blocks for stock deduction.
//!
//! This crate contains **pure** primitives (no IO, no storage concerns).

pub mod error;
pub mod id;
pub mod value_object;

pub use error::{DomainError, DomainResult};
pub use id::{IdempotencyKey, Sku};
pub use value_object::{Quantity, ValueObject};
