//! Transactional stock store boundary.
//!
//! This module defines the infrastructure-facing contract the deduction
//! strategies run against, plus its two implementations: Postgres for
//! production and an in-memory store for tests/dev.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::{InMemoryStockStore, InMemoryTransaction, JournalEntry};
pub use postgres::{PgStockTransaction, PostgresStockStore};
pub use r#trait::{ConditionalUpdate, ErrorClass, StockStore, StockTransaction, StoreError};
