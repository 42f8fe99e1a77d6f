//! Infrastructure layer: stock stores, deduction strategies, retry, config.
//!
//! ```text
//! caller → DeductionService → with_retry → DeductionStrategy → StockStore → Postgres / memory
//! ```

pub mod config;
pub mod retry;
pub mod service;
pub mod store;
pub mod strategy;


pub use config::{ConfigError, StockConfig};
pub use retry::{BackoffStrategy, RetryError, RetryPolicy};
pub use service::DeductionService;
pub use store::{InMemoryStockStore, PostgresStockStore, StockStore, StoreError};
pub use strategy::{
    ConditionalUpdateStrategy, DeductionError, DeductionStrategy, PessimisticLockStrategy,
    StrategyKind,
};
