//! Recovery of interrupted completions
//!
//! Works only from staged decrements: an intent whose transaction has a logged
//! COMPLETE is settled, any other intent is dropped. Counter values alone are
//! never taken as evidence, so folders with capacity above 1 and re-provisioned
//! tables are left as they are.

use super::FolderService;
use crate::error::Result;
use crate::metrics;
use crate::storage::Settlement;
use crate::types::{GroupId, SlotId, TransactionId};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Folders decremented for a logged COMPLETE
    pub repaired: Vec<(GroupId, SlotId)>,
    /// Intents dropped because their COMPLETE was never logged
    pub discarded: Vec<TransactionId>,
    /// Folders edited outside the service since the intent was staged
    pub diverged: Vec<(GroupId, SlotId)>,
    /// Completed folders the counter table does not know about
    pub orphaned: Vec<(GroupId, SlotId)>,
    /// Folders whose decrement could not be written yet
    pub unsettled: Vec<(GroupId, SlotId)>,
}

impl ReconcileReport {
    /// Nothing needed doing
    pub fn is_clean(&self) -> bool {
        self.repaired.is_empty()
            && self.discarded.is_empty()
            && self.diverged.is_empty()
            && self.orphaned.is_empty()
            && self.unsettled.is_empty()
    }
}

impl FolderService {
    /// Settle or drop every staged decrement left behind by an interrupted completion.
    ///
    /// Each intent is handled under its group's lock, so a completion in
    /// flight is never mistaken for an abandoned one.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let staged = self.counters.staged().await?;
        if let Some(warning) = &staged.warning {
            warn!(%warning, "Staged decrements unreadable, nothing to recover");
        }

        let mut report = ReconcileReport::default();
        for intent in staged.value {
            let group = intent.group;
            let slot = intent.slot;
            let id = intent.transaction_id.clone();
            let _guard = self.locks.acquire(group).await;

            if !self.index.is_completed(&id, group, slot) {
                self.counters.discard(&id).await?;
                self.outstanding.remove(&id);
                info!(group = %group, folder = %slot, transaction = %id, "Dropped decrement without COMPLETE");
                report.discarded.push(id);
                continue;
            }

            match self.counters.settle(&id).await {
                Ok(Settlement::Applied { remaining }) => {
                    warn!(group = %group, folder = %slot, remaining, "Counter repaired from audit log");
                    report.repaired.push((group, slot));
                }
                Ok(Settlement::Diverged { current }) => {
                    warn!(
                        group = %group,
                        folder = %slot,
                        expected = intent.before,
                        current,
                        "Counter changed outside the service, decrement skipped"
                    );
                    report.diverged.push((group, slot));
                }
                Ok(Settlement::Orphaned) => report.orphaned.push((group, slot)),
                Ok(Settlement::AlreadyApplied { .. }) | Ok(Settlement::NotStaged) => {}
                Err(e) => {
                    warn!(group = %group, folder = %slot, error = %e, "Decrement left unsettled");
                    self.outstanding.insert(id, intent);
                    report.unsettled.push((group, slot));
                    continue;
                }
            }
            self.outstanding.remove(&id);
        }
        metrics::UNSETTLED_DECREMENTS.set(self.outstanding.len() as i64);

        if !report.orphaned.is_empty() {
            warn!(
                orphaned = report.orphaned.len(),
                "Completed folders missing from the counter table"
            );
        }
        info!(
            repaired = report.repaired.len(),
            discarded = report.discarded.len(),
            unsettled = report.unsettled.len(),
            "Reconcile finished"
        );
        Ok(report)
    }
}
