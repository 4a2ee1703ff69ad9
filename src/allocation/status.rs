//! Per-group usage summary

use super::index::IndexCounts;
use super::FolderService;
use crate::error::Result;
use crate::types::GroupId;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupStatus {
    pub group_id: GroupId,
    pub folders: usize,
    /// Folders never completed (counter 1)
    pub fresh: usize,
    /// Folders no longer fresh
    pub used: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub groups: Vec<GroupStatus>,
    pub transactions: IndexCounts,
    /// Logged completions whose counter decrement is still owed; already
    /// reflected in `groups`
    pub unsettled: usize,
    /// Degraded-mode storage warnings currently in effect
    pub warnings: Vec<String>,
}

impl FolderService {
    /// Usage per group as it will read once owed decrements are settled.
    /// Never writes.
    pub async fn status(&self) -> Result<StatusReport> {
        let mut warnings = Vec::new();

        let log = self.log.load().await?;
        if let Some(w) = log.warning {
            warnings.push(w.to_string());
        }

        let counters = self.counters.snapshot().await?;
        if let Some(w) = &counters.warning {
            warnings.push(w.to_string());
        }

        let groups = counters
            .value
            .into_iter()
            .map(|(group_id, row)| {
                let row = self.effective_row(group_id, row);
                let fresh = row.iter().filter(|&&v| v == 1).count();
                GroupStatus {
                    group_id,
                    folders: row.len(),
                    fresh,
                    used: row.len() - fresh,
                }
            })
            .collect();

        crate::metrics::set_storage_degraded(!warnings.is_empty());

        Ok(StatusReport {
            groups,
            transactions: self.index.counts(),
            unsettled: self.unsettled(),
            warnings,
        })
    }
}
