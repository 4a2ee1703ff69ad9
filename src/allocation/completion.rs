//! Closing allocation transactions

use super::FolderService;
use crate::error::{Error, Result};
use crate::metrics;
use crate::storage::{Settlement, StagedDecrement};
use crate::types::{GroupId, LogEntry, SlotId, TransactionId};
use serde::Serialize;
use std::time::Instant;
use tracing::{error, info, warn};

/// Outcome of a successful completion
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionReceipt {
    #[serde(rename = "folderId")]
    pub slot: SlotId,
    #[serde(rename = "processId")]
    pub transaction_id: TransactionId,
    #[serde(rename = "groupId")]
    pub group: GroupId,
    /// Counter value left for the folder
    pub remaining: i64,
    /// COMPLETE is logged but the counter write is still owed
    #[serde(skip)]
    pub deferred: bool,
}

impl FolderService {
    /// Close the pending transaction `transaction_id` for `slot` in `group`.
    ///
    /// Nothing is written unless the transaction is pending for exactly this
    /// group and folder and the folder still has capacity. The decrement is
    /// staged before the COMPLETE entry is appended and settled after it, so
    /// either both take effect or neither does.
    pub async fn complete(
        &self,
        group: GroupId,
        slot: SlotId,
        transaction_id: &TransactionId,
    ) -> Result<CompletionReceipt> {
        let started = Instant::now();
        let result = {
            let _guard = self.locks.acquire(group).await;
            self.complete_locked(group, slot, transaction_id).await
        };
        let outcome = match &result {
            Ok(receipt) if receipt.deferred => "deferred",
            Ok(_) => "completed",
            Err(Error::Validation { .. }) => "rejected",
            Err(Error::ExhaustedSlot { .. }) => "exhausted",
            Err(Error::UnknownGroup(_)) | Err(Error::SlotOutOfRange { .. }) => "invalid",
            Err(_) => "failed",
        };
        metrics::COMPLETIONS_TOTAL.with_label_values(&[outcome]).inc();
        metrics::observe_operation("complete", started);

        if let Err(e) = &result {
            warn!(
                group = %group,
                folder = %slot,
                transaction = %transaction_id,
                error = %e,
                "Completion refused"
            );
        }
        result
    }

    async fn complete_locked(
        &self,
        group: GroupId,
        slot: SlotId,
        transaction_id: &TransactionId,
    ) -> Result<CompletionReceipt> {
        self.index.validate_pending(transaction_id, group, slot)?;

        self.settle_outstanding(group).await;
        if self
            .outstanding
            .iter()
            .any(|intent| intent.group == group && intent.slot == slot)
        {
            return Err(Error::Storage(format!(
                "an earlier completion of folder {} in group {} is not yet applied to the counter table",
                slot, group
            )));
        }

        let row = self.counters.get(group).await?;
        let value = slot
            .index()
            .and_then(|i| row.get(i).copied())
            .ok_or(Error::SlotOutOfRange {
                group,
                slot,
                slots: row.len(),
            })?;
        if value <= 0 {
            return Err(Error::ExhaustedSlot { group, slot });
        }

        let intent = StagedDecrement {
            transaction_id: transaction_id.clone(),
            slot,
            group,
            before: value,
        };
        self.counters.stage(intent.clone()).await?;

        // A staged intent without its COMPLETE is dropped by the next reconcile
        let entry = LogEntry::complete(transaction_id.clone(), slot, group);
        self.log.append(entry.clone()).await?;
        self.index.record_complete(&entry);
        metrics::PENDING_TRANSACTIONS.dec();

        let (remaining, deferred) = match self.settle_with_retry(transaction_id).await {
            Ok(Settlement::Applied { remaining }) | Ok(Settlement::AlreadyApplied { remaining }) => {
                (remaining, false)
            }
            Ok(settlement) => {
                warn!(
                    group = %group,
                    folder = %slot,
                    transaction = %transaction_id,
                    ?settlement,
                    "Counter changed while the completion was in flight"
                );
                (value - 1, false)
            }
            Err(e) => {
                error!(
                    group = %group,
                    folder = %slot,
                    transaction = %transaction_id,
                    error = %e,
                    "COMPLETE logged but counter update failed; decrement stays staged"
                );
                self.outstanding.insert(transaction_id.clone(), intent);
                metrics::UNSETTLED_DECREMENTS.set(self.outstanding.len() as i64);
                (value - 1, true)
            }
        };

        info!(
            group = %group,
            folder = %slot,
            transaction = %transaction_id,
            remaining,
            deferred,
            "Transaction completed"
        );

        Ok(CompletionReceipt {
            slot,
            transaction_id: transaction_id.clone(),
            group,
            remaining,
            deferred,
        })
    }
}
