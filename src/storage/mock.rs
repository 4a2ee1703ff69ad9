//! In-memory storage for testing
//!
//! Both stores keep everything in process memory. [`MemoryCounterTable`] can
//! also be told to fail its writes: all of them, or only the ones that change
//! counter values, which leaves a staged decrement behind.

use super::engine::{
    apply_decrement, settle_rows, CounterRows, CounterTable, Loaded, LogStore, Settlement,
    StagedDecrement,
};
use crate::error::{Error, Result};
use crate::types::{GroupId, LogEntry, SlotId, TransactionId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// In-memory audit log
#[derive(Clone, Default)]
pub struct MemoryLogStore {
    entries: Arc<Mutex<Arc<Vec<LogEntry>>>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing history
    pub fn with_entries(entries: Vec<LogEntry>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(Arc::new(entries))),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Copy of the current history
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().to_vec()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn append(&self, entry: LogEntry) -> Result<()> {
        let mut entries = self.entries.lock();
        Arc::make_mut(&mut *entries).push(entry);
        Ok(())
    }

    async fn load(&self) -> Result<Loaded<Arc<Vec<LogEntry>>>> {
        Ok(Loaded::clean(Arc::clone(&self.entries.lock())))
    }
}

/// In-memory counter table
#[derive(Clone, Default)]
pub struct MemoryCounterTable {
    rows: Arc<Mutex<CounterRows>>,
    staged: Arc<Mutex<Vec<StagedDecrement>>>,
    fail_writes: Arc<AtomicBool>,
    fail_counter_writes: Arc<AtomicBool>,
}

impl MemoryCounterTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: CounterRows) -> Self {
        Self {
            rows: Arc::new(Mutex::new(rows)),
            ..Self::default()
        }
    }

    /// Convenience: one group with the given row
    pub fn with_group(group: u32, row: Vec<i64>) -> Self {
        let mut rows = CounterRows::new();
        rows.insert(GroupId(group), row);
        Self::with_rows(rows)
    }

    /// Make every following write fail after validation, staging included
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Fail only the writes that change counter values
    pub fn set_fail_counter_writes(&self, fail: bool) {
        self.fail_counter_writes.store(fail, Ordering::SeqCst);
    }

    /// Copy of one group's row
    pub fn row(&self, group: u32) -> Option<Vec<i64>> {
        self.rows.lock().get(&GroupId(group)).cloned()
    }

    /// Replace the whole table, dropping staged intents like a re-provision
    pub fn replace_rows(&self, rows: CounterRows) {
        *self.rows.lock() = rows;
        self.staged.lock().clear();
    }

    /// Copy of the staged intents
    pub fn staged_intents(&self) -> Vec<StagedDecrement> {
        self.staged.lock().clone()
    }

    fn check_write(&self, counter_write: bool) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst)
            || (counter_write && self.fail_counter_writes.load(Ordering::SeqCst))
        {
            return Err(Error::Storage("simulated counter write failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CounterTable for MemoryCounterTable {
    async fn snapshot(&self) -> Result<Loaded<CounterRows>> {
        Ok(Loaded::clean(self.rows.lock().clone()))
    }

    async fn decrement(&self, group: GroupId, slot: SlotId) -> Result<i64> {
        let mut rows = self.rows.lock();
        let mut updated = rows.clone();
        let remaining = apply_decrement(&mut updated, group, slot)?;
        self.check_write(true)?;

        *rows = updated;
        Ok(remaining)
    }

    async fn stage(&self, intent: StagedDecrement) -> Result<()> {
        self.check_write(false)?;
        let mut staged = self.staged.lock();
        staged.retain(|i| i.transaction_id != intent.transaction_id);
        staged.push(intent);
        Ok(())
    }

    async fn staged(&self) -> Result<Loaded<Vec<StagedDecrement>>> {
        Ok(Loaded::clean(self.staged.lock().clone()))
    }

    async fn settle(&self, id: &TransactionId) -> Result<Settlement> {
        let mut rows = self.rows.lock();
        let mut staged = self.staged.lock();
        let position = match staged.iter().position(|i| &i.transaction_id == id) {
            Some(position) => position,
            None => return Ok(Settlement::NotStaged),
        };

        let mut updated = rows.clone();
        let settlement = settle_rows(&mut updated, &staged[position]);
        if let Settlement::Applied { .. } = settlement {
            self.check_write(true)?;
            *rows = updated;
        }
        staged.remove(position);
        Ok(settlement)
    }

    async fn discard(&self, id: &TransactionId) -> Result<()> {
        self.check_write(false)?;
        self.staged.lock().retain(|i| &i.transaction_id != id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_log_basic_ops() -> Result<()> {
        let store = MemoryLogStore::new();
        assert!(store.is_empty());

        let entry = LogEntry::start(TransactionId::from("t1"), SlotId(1), GroupId(1));
        store.append(entry.clone()).await?;

        let loaded = store.load().await?;
        assert!(!loaded.is_degraded());
        assert_eq!(*loaded.value, vec![entry]);
        assert_eq!(store.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_snapshot_is_isolated_from_appends() -> Result<()> {
        let store = MemoryLogStore::new();
        let before = store.load().await?.value;

        store
            .append(LogEntry::start(TransactionId::from("t1"), SlotId(1), GroupId(1)))
            .await?;

        assert!(before.is_empty());
        assert_eq!(store.load().await?.value.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_memory_counter_fault_injection() -> Result<()> {
        let table = MemoryCounterTable::with_group(1, vec![1, 1]);

        table.set_fail_writes(true);
        assert!(matches!(
            table.decrement(GroupId(1), SlotId(1)).await,
            Err(Error::Storage(_))
        ));
        assert_eq!(table.row(1), Some(vec![1, 1]));

        table.set_fail_writes(false);
        assert_eq!(table.decrement(GroupId(1), SlotId(1)).await?, 0);
        assert_eq!(table.row(1), Some(vec![0, 1]));
        Ok(())
    }

    #[tokio::test]
    async fn test_memory_counter_staging() -> Result<()> {
        let table = MemoryCounterTable::with_group(1, vec![1, 1]);
        let intent = StagedDecrement {
            transaction_id: TransactionId::from("t1"),
            slot: SlotId(2),
            group: GroupId(1),
            before: 1,
        };

        table.set_fail_writes(true);
        assert!(table.stage(intent.clone()).await.is_err());
        assert!(table.staged_intents().is_empty());
        table.set_fail_writes(false);

        table.stage(intent.clone()).await?;
        table.set_fail_counter_writes(true);
        assert!(matches!(
            table.settle(&intent.transaction_id).await,
            Err(Error::Storage(_))
        ));
        assert_eq!(table.staged_intents(), vec![intent.clone()]);
        assert_eq!(table.row(1), Some(vec![1, 1]));

        table.set_fail_counter_writes(false);
        assert_eq!(
            table.settle(&intent.transaction_id).await?,
            Settlement::Applied { remaining: 0 }
        );
        assert_eq!(table.row(1), Some(vec![1, 0]));
        assert_eq!(
            table.settle(&intent.transaction_id).await?,
            Settlement::NotStaged
        );
        Ok(())
    }
}
