//! Transaction state view over the audit log
//!
//! Rebuilt from the full history at startup, then kept current as START and
//! COMPLETE entries are appended. Lookups never rescan the log.

use crate::error::{Error, RejectReason, Result};
use crate::types::{Action, GroupId, LogEntry, SlotId, TransactionId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Pending,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    pub group: GroupId,
    pub slot: SlotId,
    pub state: TransactionState,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Totals across the index
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IndexCounts {
    pub pending: usize,
    pub completed: usize,
}

#[derive(Default)]
pub struct TransactionIndex {
    records: DashMap<TransactionId, TransactionRecord>,
}

impl TransactionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replay a history in order
    pub fn rebuild(entries: &[LogEntry]) -> Self {
        let index = Self::new();
        let mut ignored = 0usize;

        for entry in entries {
            let applied = match entry.action {
                Action::Start => index.record_start(entry),
                Action::Complete => index.record_complete(entry),
            };
            if !applied {
                ignored += 1;
            }
        }

        if ignored > 0 {
            warn!(ignored, "Ignored log entries that do not fit a transaction lifecycle");
        }
        debug!(transactions = index.records.len(), "Transaction index rebuilt");
        index
    }

    /// Register a START. Returns false if the id was already known.
    pub fn record_start(&self, entry: &LogEntry) -> bool {
        if self.records.contains_key(&entry.transaction_id) {
            debug!(transaction = %entry.transaction_id, "Duplicate START ignored");
            return false;
        }

        self.records.insert(
            entry.transaction_id.clone(),
            TransactionRecord {
                group: entry.group,
                slot: entry.slot,
                state: TransactionState::Pending,
                started_at: entry.timestamp,
                completed_at: None,
            },
        );
        true
    }

    /// Register a COMPLETE. Returns false unless it closes a matching pending transaction.
    pub fn record_complete(&self, entry: &LogEntry) -> bool {
        match self.records.get_mut(&entry.transaction_id) {
            Some(mut record)
                if record.state == TransactionState::Pending
                    && record.group == entry.group
                    && record.slot == entry.slot =>
            {
                record.state = TransactionState::Completed;
                record.completed_at = Some(entry.timestamp);
                true
            }
            _ => {
                debug!(transaction = %entry.transaction_id, "COMPLETE without pending START ignored");
                false
            }
        }
    }

    /// Check that `id` is a pending transaction for exactly this group and slot
    pub fn validate_pending(
        &self,
        id: &TransactionId,
        group: GroupId,
        slot: SlotId,
    ) -> Result<TransactionRecord> {
        let reject = |reason| Error::Validation {
            transaction_id: id.clone(),
            reason,
        };

        let record = self
            .records
            .get(id)
            .map(|r| r.value().clone())
            .ok_or_else(|| reject(RejectReason::UnknownTransaction))?;

        if record.group != group {
            return Err(reject(RejectReason::GroupMismatch));
        }
        if record.slot != slot {
            return Err(reject(RejectReason::SlotMismatch));
        }
        if record.state == TransactionState::Completed {
            return Err(reject(RejectReason::AlreadyCompleted));
        }
        Ok(record)
    }

    pub fn get(&self, id: &TransactionId) -> Option<TransactionRecord> {
        self.records.get(id).map(|r| r.value().clone())
    }

    pub fn counts(&self) -> IndexCounts {
        self.records
            .iter()
            .fold(IndexCounts::default(), |mut acc, r| {
                match r.state {
                    TransactionState::Pending => acc.pending += 1,
                    TransactionState::Completed => acc.completed += 1,
                }
                acc
            })
    }

    /// Whether `id` completed for exactly this group and slot
    pub fn is_completed(&self, id: &TransactionId, group: GroupId, slot: SlotId) -> bool {
        self.records.get(id).map_or(false, |r| {
            r.state == TransactionState::Completed && r.group == group && r.slot == slot
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(id: &str, slot: u32, group: u32) -> LogEntry {
        LogEntry::start(TransactionId::from(id), SlotId(slot), GroupId(group))
    }

    fn complete(id: &str, slot: u32, group: u32) -> LogEntry {
        LogEntry::complete(TransactionId::from(id), SlotId(slot), GroupId(group))
    }

    #[test]
    fn test_rebuild_tracks_lifecycle() {
        let index = TransactionIndex::rebuild(&[
            start("a", 1, 1),
            start("b", 2, 1),
            complete("a", 1, 1),
        ]);

        assert_eq!(index.counts(), IndexCounts { pending: 1, completed: 1 });
        assert_eq!(
            index.get(&TransactionId::from("a")).map(|r| r.state),
            Some(TransactionState::Completed)
        );
        assert!(index.is_completed(&TransactionId::from("a"), GroupId(1), SlotId(1)));
        assert!(!index.is_completed(&TransactionId::from("a"), GroupId(1), SlotId(2)));
        assert!(!index.is_completed(&TransactionId::from("b"), GroupId(1), SlotId(2)));
    }

    #[test]
    fn test_rebuild_ignores_stray_entries() {
        let index = TransactionIndex::rebuild(&[
            complete("ghost", 1, 1),
            start("a", 1, 1),
            start("a", 3, 1),
            complete("a", 2, 1),
            complete("a", 1, 1),
            complete("a", 1, 1),
        ]);

        let record = index.get(&TransactionId::from("a")).unwrap();
        assert_eq!(record.slot, SlotId(1));
        assert_eq!(record.state, TransactionState::Completed);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_validate_pending_reasons() {
        let index = TransactionIndex::rebuild(&[start("a", 4, 2), start("b", 1, 2), complete("b", 1, 2)]);
        let reason = |id: &str, group: u32, slot: u32| match index.validate_pending(
            &TransactionId::from(id),
            GroupId(group),
            SlotId(slot),
        ) {
            Err(Error::Validation { reason, .. }) => Some(reason),
            _ => None,
        };

        assert!(index
            .validate_pending(&TransactionId::from("a"), GroupId(2), SlotId(4))
            .is_ok());
        assert_eq!(reason("zzz", 2, 4), Some(RejectReason::UnknownTransaction));
        assert_eq!(reason("a", 3, 4), Some(RejectReason::GroupMismatch));
        assert_eq!(reason("a", 2, 5), Some(RejectReason::SlotMismatch));
        assert_eq!(reason("b", 2, 1), Some(RejectReason::AlreadyCompleted));
    }
}
