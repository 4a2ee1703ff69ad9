//! Allocation engine
//!
//! # Architecture
//!
//! ```text
//! FolderService
//!   ├─→ GroupLocks        one async mutex per group, held for a whole operation
//!   ├─→ TransactionIndex  transactionId → {group, folder, PENDING|COMPLETED}
//!   ├─→ LogStore          START / COMPLETE audit trail (source of truth)
//!   └─→ CounterTable      remaining capacity per folder (1 = fresh, 0 = exhausted)
//! ```
//!
//! `allocate` only appends START; capacity is debited by `complete`. The two
//! writes of a completion form a pair:
//!
//! 1. stage the decrement in the counter table, with the value it expects
//! 2. append COMPLETE to the log
//! 3. settle the staged decrement
//!
//! A crash before step 2 leaves an intent with no COMPLETE, which `reconcile`
//! drops at the next open. A crash or write failure after step 2 leaves an
//! intent backed by a COMPLETE; it is settled at open, or before the next
//! operation on that group. Settling compares the counter with the staged
//! value, so it never decrements twice.

pub mod allocator;
pub mod completion;
pub mod index;
pub mod locks;
pub mod reconcile;
pub mod status;

pub use allocator::{select_slot, Allocation, SelectionPolicy};
pub use completion::CompletionReceipt;
pub use index::{TransactionIndex, TransactionRecord, TransactionState};
pub use locks::GroupLocks;
pub use reconcile::ReconcileReport;
pub use status::{GroupStatus, StatusReport};

use crate::error::Result;
use crate::metrics;
use crate::storage::{CounterTable, LogStore, Settlement, StagedDecrement};
use crate::types::{GroupId, TransactionId};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Settle attempts right after a COMPLETE is logged
const SETTLE_ATTEMPTS: u32 = 3;

/// Tunables for the allocation engine
#[derive(Debug, Clone, Default)]
pub struct ServiceOptions {
    /// Folder count used when every folder of a group has been completed.
    /// Capped to the group's row length; `None` means the row length.
    pub total_slots: Option<usize>,
    /// Seed for folder selection (tests); random when unset
    pub rng_seed: Option<u64>,
}

/// The allocation core shared by all request handlers
pub struct FolderService {
    log: Arc<dyn LogStore>,
    counters: Arc<dyn CounterTable>,
    index: TransactionIndex,
    locks: GroupLocks,
    rng: Mutex<StdRng>,
    options: ServiceOptions,
    /// Staged decrements whose COMPLETE is logged but whose settle failed
    outstanding: DashMap<TransactionId, StagedDecrement>,
    /// What the reconcile pass at open did
    recovery: ReconcileReport,
}

impl std::fmt::Debug for FolderService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FolderService")
            .field("transactions", &self.index.len())
            .field("outstanding", &self.outstanding.len())
            .field("options", &self.options)
            .finish()
    }
}

impl FolderService {
    /// Rebuild transaction state from the log and repair interrupted completions
    pub async fn open(
        log: Arc<dyn LogStore>,
        counters: Arc<dyn CounterTable>,
        options: ServiceOptions,
    ) -> Result<Self> {
        let mut service = Self::build(log, counters, options).await?;

        let report = service.reconcile().await?;
        if !report.is_clean() {
            warn!(
                repaired = report.repaired.len(),
                discarded = report.discarded.len(),
                diverged = report.diverged.len(),
                orphaned = report.orphaned.len(),
                unsettled = report.unsettled.len(),
                "Recovered interrupted completions"
            );
        }
        service.recovery = report;

        Ok(service)
    }

    /// Read-only view of the stores: nothing is repaired or written.
    ///
    /// Staged decrements backed by a logged COMPLETE are counted as applied in
    /// [`FolderService::status`] without touching the counter table.
    pub async fn inspect(
        log: Arc<dyn LogStore>,
        counters: Arc<dyn CounterTable>,
        options: ServiceOptions,
    ) -> Result<Self> {
        let service = Self::build(log, counters, options).await?;

        let staged = service.counters.staged().await?.into_logged("staged decrements");
        for intent in staged {
            if service.index.is_completed(&intent.transaction_id, intent.group, intent.slot) {
                service
                    .outstanding
                    .insert(intent.transaction_id.clone(), intent);
            }
        }
        metrics::UNSETTLED_DECREMENTS.set(service.outstanding.len() as i64);

        Ok(service)
    }

    async fn build(
        log: Arc<dyn LogStore>,
        counters: Arc<dyn CounterTable>,
        options: ServiceOptions,
    ) -> Result<Self> {
        let history = log.load().await?;
        if let Some(warning) = &history.warning {
            warn!(%warning, "Starting with degraded audit log");
        }
        metrics::set_storage_degraded(history.is_degraded());

        let index = TransactionIndex::rebuild(&history.value);
        let counts = index.counts();
        info!(
            entries = history.value.len(),
            pending = counts.pending,
            completed = counts.completed,
            "Transaction index ready"
        );
        metrics::PENDING_TRANSACTIONS.set(counts.pending as i64);

        let rng = match options.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            log,
            counters,
            index,
            locks: GroupLocks::new(),
            rng: Mutex::new(rng),
            options,
            outstanding: DashMap::new(),
            recovery: ReconcileReport::default(),
        })
    }

    pub fn index(&self) -> &TransactionIndex {
        &self.index
    }

    pub fn options(&self) -> &ServiceOptions {
        &self.options
    }

    /// Report of the reconcile pass run by [`FolderService::open`]
    pub fn recovery(&self) -> &ReconcileReport {
        &self.recovery
    }

    /// Logged completions whose counter decrement is still owed
    pub fn unsettled(&self) -> usize {
        self.outstanding.len()
    }

    /// Groups whose lock is currently held or waited on
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    /// Settle every outstanding decrement of `group`. Caller holds the group lock.
    ///
    /// Failures are logged and the intents stay outstanding.
    async fn settle_outstanding(&self, group: GroupId) {
        let owed: Vec<TransactionId> = self
            .outstanding
            .iter()
            .filter(|intent| intent.group == group)
            .map(|intent| intent.key().clone())
            .collect();
        if owed.is_empty() {
            return;
        }

        for id in owed {
            match self.counters.settle(&id).await {
                Ok(settlement) => {
                    self.outstanding.remove(&id);
                    info!(group = %group, transaction = %id, ?settlement, "Settled deferred decrement");
                }
                Err(e) => {
                    warn!(group = %group, transaction = %id, error = %e, "Deferred decrement still unsettled");
                }
            }
        }
        metrics::UNSETTLED_DECREMENTS.set(self.outstanding.len() as i64);
    }

    /// Settle a freshly logged completion, retrying transient write failures
    async fn settle_with_retry(&self, id: &TransactionId) -> Result<Settlement> {
        let mut attempt = 1;
        loop {
            match self.counters.settle(id).await {
                Ok(settlement) => return Ok(settlement),
                Err(e) if attempt < SETTLE_ATTEMPTS => {
                    debug!(transaction = %id, attempt, error = %e, "Settle failed, retrying");
                    tokio::time::sleep(Duration::from_millis(10 * u64::from(attempt))).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// `row` with outstanding decrements of `group` counted as applied
    fn effective_row(&self, group: GroupId, mut row: Vec<i64>) -> Vec<i64> {
        for intent in self.outstanding.iter().filter(|intent| intent.group == group) {
            if let Some(value) = intent.slot.index().and_then(|i| row.get_mut(i)) {
                if *value == intent.before && intent.before > 0 {
                    *value -= 1;
                }
            }
        }
        row
    }
}
