//! Folder selection and transaction opening

use super::FolderService;
use crate::error::{Error, Result};
use crate::metrics;
use crate::types::{GroupId, LogEntry, SlotId, TransactionId};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use std::time::Instant;
use tracing::{debug, info};

/// Which rule picked the folder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Uniform over folders that were never completed
    Fresh,
    /// Uniform over the whole range once no fresh folder is left
    Fallback,
}

impl SelectionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionPolicy::Fresh => "fresh",
            SelectionPolicy::Fallback => "fallback",
        }
    }
}

/// Result of a successful allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub slot: SlotId,
    pub transaction_id: TransactionId,
    pub policy: SelectionPolicy,
}

/// Pick a folder from a counter row.
///
/// Prefers folders whose counter is exactly 1. When none is left, falls back to
/// `[1, total]`, with `total` capped to the row length. Returns `None` for an
/// empty row.
pub fn select_slot<R: Rng + ?Sized>(
    row: &[i64],
    total: Option<usize>,
    rng: &mut R,
) -> Option<(SlotId, SelectionPolicy)> {
    let fresh: Vec<usize> = row
        .iter()
        .enumerate()
        .filter(|&(_, &value)| value == 1)
        .map(|(i, _)| i)
        .collect();

    if let Some(&index) = fresh.choose(rng) {
        return Some((SlotId::from_index(index), SelectionPolicy::Fresh));
    }

    let range = total.map_or(row.len(), |t| t.min(row.len()));
    if range == 0 {
        return None;
    }
    let index = rng.gen_range(0..range);
    Some((SlotId::from_index(index), SelectionPolicy::Fallback))
}

impl FolderService {
    /// Hand out the next folder of `group` and open a transaction for it.
    ///
    /// Appends a START entry; the counter table is not touched apart from
    /// settling decrements owed by earlier completions.
    pub async fn allocate(&self, group: GroupId) -> Result<Allocation> {
        let started = Instant::now();
        let allocation = {
            let _guard = self.locks.acquire(group).await;
            self.allocate_locked(group).await?
        };

        metrics::ALLOCATIONS_TOTAL
            .with_label_values(&[allocation.policy.as_str()])
            .inc();
        metrics::PENDING_TRANSACTIONS.inc();
        metrics::observe_operation("allocate", started);

        if allocation.policy == SelectionPolicy::Fallback {
            debug!(group = %group, "No fresh folder left, used fallback range");
        }
        info!(
            group = %group,
            folder = %allocation.slot,
            transaction = %allocation.transaction_id,
            policy = allocation.policy.as_str(),
            "Folder allocated"
        );

        Ok(allocation)
    }

    async fn allocate_locked(&self, group: GroupId) -> Result<Allocation> {
        self.settle_outstanding(group).await;

        let row = self.effective_row(group, self.counters.get(group).await?);
        let (slot, policy) = {
            let mut rng = self.rng.lock();
            select_slot(&row, self.options.total_slots, &mut *rng)
        }
        .ok_or(Error::UnknownGroup(group))?;

        let transaction_id = TransactionId::generate();
        let entry = LogEntry::start(transaction_id.clone(), slot, group);
        self.log.append(entry.clone()).await?;
        self.index.record_start(&entry);

        Ok(Allocation {
            slot,
            transaction_id,
            policy,
        })
    }
}
