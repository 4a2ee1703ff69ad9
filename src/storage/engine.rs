//! Storage traits

use crate::error::{Error, Result};
use crate::types::{Action, GroupId, LogEntry, SlotId, TransactionId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// Per-group counter rows, index 0 = folder 1
pub type CounterRows = BTreeMap<GroupId, Vec<i64>>;

/// A read result that may have been produced in degraded mode.
///
/// When the backing file was missing or unreadable the value is empty and
/// `warning` carries the [`Error::StorageUnavailable`] that caused it.
#[derive(Debug, Clone)]
pub struct Loaded<T> {
    pub value: T,
    pub warning: Option<Error>,
}

impl<T> Loaded<T> {
    pub fn clean(value: T) -> Self {
        Self {
            value,
            warning: None,
        }
    }

    pub fn degraded(value: T, warning: Error) -> Self {
        Self {
            value,
            warning: Some(warning),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.warning.is_some()
    }

    /// Log the warning (if any) and return the value
    pub fn into_logged(self, what: &str) -> T {
        if let Some(warning) = &self.warning {
            warn!(store = what, warning = %warning, "Serving degraded read");
        }
        self.value
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Loaded<U> {
        Loaded {
            value: f(self.value),
            warning: self.warning,
        }
    }
}

/// Match criteria for [`LogStore::query`]. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    pub transaction_id: Option<TransactionId>,
    pub group: Option<GroupId>,
    pub slot: Option<SlotId>,
    pub action: Option<Action>,
}

impl LogFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transaction(mut self, id: TransactionId) -> Self {
        self.transaction_id = Some(id);
        self
    }

    pub fn group(mut self, group: GroupId) -> Self {
        self.group = Some(group);
        self
    }

    pub fn slot(mut self, slot: SlotId) -> Self {
        self.slot = Some(slot);
        self
    }

    pub fn action(mut self, action: Action) -> Self {
        self.action = Some(action);
        self
    }

    pub fn matches(&self, entry: &LogEntry) -> bool {
        self.transaction_id
            .as_ref()
            .map_or(true, |id| *id == entry.transaction_id)
            && self.group.map_or(true, |g| g == entry.group)
            && self.slot.map_or(true, |s| s == entry.slot)
            && self.action.map_or(true, |a| a == entry.action)
    }
}

/// Lazy view over a history snapshot.
///
/// Nothing is filtered until iterated, and [`LogQuery::iter`] can be called
/// any number of times.
#[derive(Debug, Clone)]
pub struct LogQuery {
    entries: Arc<Vec<LogEntry>>,
    filter: LogFilter,
}

impl LogQuery {
    pub fn new(entries: Arc<Vec<LogEntry>>, filter: LogFilter) -> Self {
        Self { entries, filter }
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> + '_ {
        self.entries.iter().filter(move |e| self.filter.matches(e))
    }

    pub fn first(&self) -> Option<&LogEntry> {
        self.iter().next()
    }

    pub fn count(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.first().is_none()
    }
}

/// Durable append-only audit log
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Persist an entry; returns only once the write is durable
    async fn append(&self, entry: LogEntry) -> Result<()>;

    /// Full ordered history
    async fn load(&self) -> Result<Loaded<Arc<Vec<LogEntry>>>>;

    /// Entries matching `filter`, evaluated against the full history
    async fn query(&self, filter: LogFilter) -> Result<Loaded<LogQuery>> {
        Ok(self.load().await?.map(|entries| LogQuery::new(entries, filter)))
    }
}

/// A decrement owed by a completion, persisted before its COMPLETE is logged.
///
/// `before` is the counter value seen when the decrement was staged. Settling
/// compares it with the current value, so applying an intent twice is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedDecrement {
    #[serde(rename = "processId")]
    pub transaction_id: TransactionId,
    #[serde(rename = "folderId")]
    pub slot: SlotId,
    #[serde(rename = "groupId")]
    pub group: GroupId,
    pub before: i64,
}

/// What settling a staged decrement did to the table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Settlement {
    /// Counter decremented now
    Applied { remaining: i64 },
    /// Counter already held the decremented value
    AlreadyApplied { remaining: i64 },
    /// Counter was changed outside the service (edit, re-provision); left alone
    Diverged { current: i64 },
    /// Group or folder no longer in the table
    Orphaned,
    /// Nothing staged under that transaction id
    NotStaged,
}

/// Persisted remaining-capacity table
#[async_trait]
pub trait CounterTable: Send + Sync {
    /// All rows
    async fn snapshot(&self) -> Result<Loaded<CounterRows>>;

    /// Decrement one folder's counter, all-or-nothing. Returns the new value.
    ///
    /// Fails with `UnknownGroup`, `SlotOutOfRange` or `ExhaustedSlot` without
    /// touching the table.
    async fn decrement(&self, group: GroupId, slot: SlotId) -> Result<i64>;

    /// Durably record a decrement before the COMPLETE that owes it is appended.
    /// Replaces an earlier intent with the same transaction id.
    async fn stage(&self, intent: StagedDecrement) -> Result<()>;

    /// Intents not yet settled, in staging order
    async fn staged(&self) -> Result<Loaded<Vec<StagedDecrement>>>;

    /// Apply the intent staged under `id` at most once, then drop it.
    ///
    /// On error the intent stays staged.
    async fn settle(&self, id: &TransactionId) -> Result<Settlement>;

    /// Drop an intent whose COMPLETE was never written
    async fn discard(&self, id: &TransactionId) -> Result<()>;

    /// Row for one group
    async fn get(&self, group: GroupId) -> Result<Vec<i64>> {
        self.snapshot()
            .await?
            .into_logged("counters")
            .remove(&group)
            .ok_or(Error::UnknownGroup(group))
    }
}

/// Apply a decrement to in-memory rows, validating first.
pub(crate) fn apply_decrement(rows: &mut CounterRows, group: GroupId, slot: SlotId) -> Result<i64> {
    let row = rows.get_mut(&group).ok_or(Error::UnknownGroup(group))?;
    let slots = row.len();
    let value = slot
        .index()
        .and_then(|i| row.get_mut(i))
        .ok_or(Error::SlotOutOfRange { group, slot, slots })?;

    if *value <= 0 {
        return Err(Error::ExhaustedSlot { group, slot });
    }

    *value -= 1;
    Ok(*value)
}

/// Apply `intent` to in-memory rows unless it already took effect
pub(crate) fn settle_rows(rows: &mut CounterRows, intent: &StagedDecrement) -> Settlement {
    let current = match rows
        .get_mut(&intent.group)
        .and_then(|row| intent.slot.index().and_then(|i| row.get_mut(i)))
    {
        Some(value) => value,
        None => return Settlement::Orphaned,
    };

    if *current == intent.before && intent.before > 0 {
        *current -= 1;
        Settlement::Applied { remaining: *current }
    } else if *current == intent.before - 1 {
        Settlement::AlreadyApplied { remaining: *current }
    } else {
        Settlement::Diverged { current: *current }
    }
}
