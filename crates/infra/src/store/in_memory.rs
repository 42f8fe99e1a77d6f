//! In-memory stock store for tests/dev.
//!
//! Emulates the parts of a relational store the deduction strategies rely on:
//! - committed quantities readable without blocking (snapshot reads)
//! - one exclusive lock per row, waited on with a finite timeout
//! - transactions whose writes become visible only on commit and vanish when
//!   the transaction is dropped
//!
//! Transient failures can be injected to exercise retry behavior.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};

use stockguard_core::{IdempotencyKey, Quantity, Sku};

use super::r#trait::{ConditionalUpdate, StockStore, StockTransaction, StoreError};

#[derive(Debug)]
struct RowState {
    lock: Arc<RowLock<()>>,
    committed: AtomicI64,
}

type Row = Arc<RowState>;

/// A journaled deduction, keyed by its idempotency key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub sku: Sku,
    pub quantity: i64,
    pub resulting_quantity: i64,
    pub deducted_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Shared {
    rows: RwLock<HashMap<Sku, Row>>,
    journal: Mutex<HashMap<IdempotencyKey, JournalEntry>>,
    faults: Mutex<VecDeque<StoreError>>,
    lock_timeout: Duration,
}

fn poisoned(what: &str) -> StoreError {
    StoreError::Database(format!("{what} lock poisoned"))
}

impl Shared {
    fn row(&self, sku: &Sku) -> Result<Option<Row>, StoreError> {
        let rows = self.rows.read().map_err(|_| poisoned("rows"))?;
        Ok(rows.get(sku).cloned())
    }

    /// Insert a new row unless one exists; returns the existing row if so.
    fn insert_row(&self, sku: &Sku, quantity: i64) -> Result<Option<Row>, StoreError> {
        let mut rows = self.rows.write().map_err(|_| poisoned("rows"))?;
        match rows.entry(sku.clone()) {
            Entry::Occupied(existing) => Ok(Some(existing.get().clone())),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(RowState {
                    lock: Arc::new(RowLock::new(())),
                    committed: AtomicI64::new(quantity),
                }));
                Ok(None)
            }
        }
    }

    fn take_fault(&self) -> Result<Option<StoreError>, StoreError> {
        let mut faults = self.faults.lock().map_err(|_| poisoned("faults"))?;
        Ok(faults.pop_front())
    }

    fn journaled(&self, key: IdempotencyKey) -> Result<Option<JournalEntry>, StoreError> {
        let journal = self.journal.lock().map_err(|_| poisoned("journal"))?;
        Ok(journal.get(&key).cloned())
    }

    async fn lock(&self, sku: &Sku, row: &Row) -> Result<OwnedMutexGuard<()>, StoreError> {
        tokio::time::timeout(self.lock_timeout, row.lock.clone().lock_owned())
            .await
            .map_err(|_| {
                StoreError::LockTimeout(format!(
                    "row {sku} still locked after {}ms",
                    self.lock_timeout.as_millis()
                ))
            })
    }
}

/// In-memory stock store.
///
/// Cloning is cheap and clones share the same rows, like several pool
/// handles onto one database.
#[derive(Debug, Clone)]
pub struct InMemoryStockStore {
    shared: Arc<Shared>,
}

impl InMemoryStockStore {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                rows: RwLock::new(HashMap::new()),
                journal: Mutex::new(HashMap::new()),
                faults: Mutex::new(VecDeque::new()),
                lock_timeout,
            }),
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        self.shared.lock_timeout
    }

    /// Create or overwrite a stock row (onboarding / restock).
    ///
    /// Waits for the row lock like any other writer.
    pub async fn put(&self, sku: Sku, quantity: i64) -> Result<(), StoreError> {
        if quantity < 0 {
            return Err(StoreError::Constraint(format!(
                "stock for {sku} cannot be negative ({quantity})"
            )));
        }

        let row = match self.shared.row(&sku)? {
            Some(row) => row,
            // Another put may create the row between the read and the insert.
            None => match self.shared.insert_row(&sku, quantity)? {
                None => return Ok(()),
                Some(row) => row,
            },
        };

        let _guard = self.shared.lock(&sku, &row).await?;
        row.committed.store(quantity, Ordering::SeqCst);
        Ok(())
    }

    /// Queue an error to be raised by the next store operation that would
    /// touch a row (conditional decrement or locking read).
    pub fn inject_fault(&self, err: StoreError) {
        if let Ok(mut faults) = self.shared.faults.lock() {
            faults.push_back(err);
        }
    }

    /// Queue `count` serialization failures.
    pub fn inject_conflicts(&self, count: usize) {
        for n in 0..count {
            self.inject_fault(StoreError::SerializationFailure(format!(
                "injected conflict #{}",
                n + 1
            )));
        }
    }

    /// Injected faults not yet consumed.
    pub fn pending_faults(&self) -> usize {
        self.shared.faults.lock().map(|f| f.len()).unwrap_or(0)
    }

    pub fn journal_entry(&self, key: IdempotencyKey) -> Option<JournalEntry> {
        self.shared.journaled(key).ok().flatten()
    }
}

#[async_trait]
impl StockStore for InMemoryStockStore {
    type Tx = InMemoryTransaction;

    async fn conditional_decrement(
        &self,
        sku: &Sku,
        quantity: Quantity,
        key: Option<IdempotencyKey>,
    ) -> Result<ConditionalUpdate, StoreError> {
        if let Some(fault) = self.shared.take_fault()? {
            return Err(fault);
        }

        let Some(row) = self.shared.row(sku)? else {
            return Ok(match key.map(|k| self.shared.journaled(k)).transpose()?.flatten() {
                Some(entry) => ConditionalUpdate::Replayed {
                    new_quantity: entry.resulting_quantity,
                },
                None => ConditionalUpdate::NotApplied,
            });
        };

        // The whole check-and-write runs under the row lock: one statement.
        let _guard = self.shared.lock(sku, &row).await?;

        let mut journal = self.shared.journal.lock().map_err(|_| poisoned("journal"))?;
        if let Some(entry) = key.and_then(|k| journal.get(&k)) {
            return Ok(ConditionalUpdate::Replayed {
                new_quantity: entry.resulting_quantity,
            });
        }

        let current = row.committed.load(Ordering::SeqCst);
        if current < quantity.get() {
            return Ok(ConditionalUpdate::NotApplied);
        }

        let new_quantity = current - quantity.get();
        row.committed.store(new_quantity, Ordering::SeqCst);
        if let Some(key) = key {
            journal.insert(
                key,
                JournalEntry {
                    sku: sku.clone(),
                    quantity: quantity.get(),
                    resulting_quantity: new_quantity,
                    deducted_at: Utc::now(),
                },
            );
        }

        Ok(ConditionalUpdate::Applied { new_quantity })
    }

    async fn current_quantity(&self, sku: &Sku) -> Result<Option<i64>, StoreError> {
        Ok(self
            .shared
            .row(sku)?
            .map(|row| row.committed.load(Ordering::SeqCst)))
    }

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        Ok(InMemoryTransaction {
            shared: self.shared.clone(),
            held: HashMap::new(),
            writes: HashMap::new(),
            journal: Vec::new(),
        })
    }
}

/// Open in-memory transaction.
///
/// Row locks are released and buffered writes discarded when this value is
/// dropped without `commit`, which is what cancellation of an in-flight
/// deduction does.
#[derive(Debug)]
pub struct InMemoryTransaction {
    shared: Arc<Shared>,
    held: HashMap<Sku, (Row, OwnedMutexGuard<()>)>,
    writes: HashMap<Sku, i64>,
    journal: Vec<(IdempotencyKey, JournalEntry)>,
}

#[async_trait]
impl StockTransaction for InMemoryTransaction {
    async fn locking_read(&mut self, sku: &Sku) -> Result<Option<i64>, StoreError> {
        if let Some(fault) = self.shared.take_fault()? {
            return Err(fault);
        }

        if let Some((row, _)) = self.held.get(sku) {
            let own_write = self.writes.get(sku).copied();
            return Ok(Some(
                own_write.unwrap_or_else(|| row.committed.load(Ordering::SeqCst)),
            ));
        }

        let Some(row) = self.shared.row(sku)? else {
            return Ok(None);
        };
        let guard = self.shared.lock(sku, &row).await?;
        let quantity = row.committed.load(Ordering::SeqCst);
        self.held.insert(sku.clone(), (row, guard));
        Ok(Some(quantity))
    }

    async fn recorded_deduction(
        &mut self,
        key: IdempotencyKey,
    ) -> Result<Option<i64>, StoreError> {
        Ok(self.shared.journaled(key)?.map(|e| e.resulting_quantity))
    }

    async fn write(&mut self, sku: &Sku, new_quantity: i64) -> Result<(), StoreError> {
        if !self.held.contains_key(sku) {
            return Err(StoreError::Database(format!(
                "write to {sku} without holding its row lock"
            )));
        }
        if new_quantity < 0 {
            return Err(StoreError::Constraint(format!(
                "stock for {sku} cannot be negative ({new_quantity})"
            )));
        }
        self.writes.insert(sku.clone(), new_quantity);
        Ok(())
    }

    async fn record_deduction(
        &mut self,
        key: IdempotencyKey,
        sku: &Sku,
        quantity: Quantity,
        new_quantity: i64,
    ) -> Result<(), StoreError> {
        self.journal.push((
            key,
            JournalEntry {
                sku: sku.clone(),
                quantity: quantity.get(),
                resulting_quantity: new_quantity,
                deducted_at: Utc::now(),
            },
        ));
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        let mut journal = self.shared.journal.lock().map_err(|_| poisoned("journal"))?;
        if let Some((key, _)) = self.journal.iter().find(|(k, _)| journal.contains_key(k)) {
            return Err(StoreError::DuplicateDeduction(format!(
                "idempotency key {key} already journaled"
            )));
        }

        for (sku, quantity) in &self.writes {
            if let Some((row, _)) = self.held.get(sku) {
                row.committed.store(*quantity, Ordering::SeqCst);
            }
        }
        journal.extend(self.journal);
        // Row guards in `self.held` drop here, releasing the locks.
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}
