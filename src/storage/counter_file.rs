//! JSON-file counter table
//!
//! ```text
//! {
//!     "1": [1, 1, 0, ...],   <- group 1, folders 1..=n
//!     "2": [1, 0, 1, ...]
//! }
//! ```
//!
//! The file is provisioned outside the service (see [`JsonCounterTable::provision`])
//! and may be edited by operators between runs, so it is read from disk on
//! every operation rather than cached. Staged decrements live next to it in
//! `<file>.staged` as a JSON array.

use super::atomic::{quarantine, write_json, Indent};
use super::engine::{
    apply_decrement, settle_rows, CounterRows, CounterTable, Loaded, Settlement, StagedDecrement,
};
use super::run_blocking;
use crate::error::{Error, Result};
use crate::types::{GroupId, SlotId, TransactionId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Counter table stored as a JSON object file
pub struct JsonCounterTable {
    inner: Arc<CounterFile>,
}

struct CounterFile {
    path: PathBuf,
    staged_path: PathBuf,
    /// Serializes read-modify-write cycles on both files
    file_lock: Mutex<()>,
}

impl JsonCounterTable {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let mut staged_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        staged_name.push(".staged");
        let staged_path = path.with_file_name(staged_name);

        Self {
            inner: Arc::new(CounterFile {
                path,
                staged_path,
                file_lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// File holding decrements staged but not yet settled
    pub fn staged_path(&self) -> &Path {
        &self.inner.staged_path
    }

    /// Write a fresh table: groups `1..=groups`, each with `slots` never-used folders.
    ///
    /// Refuses to replace an existing file unless `force` is set. Any staged
    /// decrements belong to the old table and are dropped.
    pub fn provision(&self, groups: u32, slots: usize, force: bool) -> Result<CounterRows> {
        if groups == 0 || slots == 0 {
            return Err(Error::InvalidArgument(
                "groups and folders per group must be positive".to_string(),
            ));
        }

        let file = &self.inner;
        let _guard = file.file_lock.lock();
        if file.path.exists() && !force {
            return Err(Error::InvalidArgument(format!(
                "{} already exists (use --force to overwrite)",
                file.path.display()
            )));
        }

        let rows: CounterRows = (1..=groups).map(|g| (GroupId(g), vec![1; slots])).collect();
        write_json(&file.path, &rows, Indent::Four)?;

        match std::fs::remove_file(&file.staged_path) {
            Ok(()) => warn!(path = %file.staged_path.display(), "Dropped staged decrements of the previous table"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::Storage(format!(
                    "Failed to remove {}: {}",
                    file.staged_path.display(),
                    e
                )))
            }
        }

        info!(path = %file.path.display(), groups, slots, "Provisioned counter table");
        Ok(rows)
    }
}

impl CounterFile {
    fn read_rows(&self) -> Loaded<CounterRows> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Loaded::degraded(
                    CounterRows::new(),
                    Error::StorageUnavailable(format!(
                        "counter file {} not found",
                        self.path.display()
                    )),
                );
            }
            Err(e) => {
                return Loaded::degraded(
                    CounterRows::new(),
                    Error::StorageUnavailable(format!(
                        "counter file {} unreadable: {}",
                        self.path.display(),
                        e
                    )),
                );
            }
        };

        if text.trim().is_empty() {
            return Loaded::clean(CounterRows::new());
        }

        match serde_json::from_str(&text) {
            Ok(rows) => Loaded::clean(rows),
            Err(e) => Loaded::degraded(
                CounterRows::new(),
                Error::StorageUnavailable(format!(
                    "counter file {} corrupt: {}",
                    self.path.display(),
                    e
                )),
            ),
        }
    }

    /// Rows for a write; a degraded table is never written back
    fn rows_for_write(&self) -> Result<CounterRows> {
        let loaded = self.read_rows();
        match loaded.warning {
            Some(warning) => Err(warning),
            None => Ok(loaded.value),
        }
    }

    fn read_staged(&self) -> Loaded<Vec<StagedDecrement>> {
        let text = match std::fs::read_to_string(&self.staged_path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Loaded::clean(Vec::new()),
            Err(e) => {
                return Loaded::degraded(
                    Vec::new(),
                    Error::StorageUnavailable(format!(
                        "staged decrements {} unreadable: {}",
                        self.staged_path.display(),
                        e
                    )),
                )
            }
        };

        if text.trim().is_empty() {
            return Loaded::clean(Vec::new());
        }

        match serde_json::from_str(&text) {
            Ok(intents) => Loaded::clean(intents),
            Err(e) => Loaded::degraded(
                Vec::new(),
                Error::StorageUnavailable(format!(
                    "staged decrements {} corrupt: {}",
                    self.staged_path.display(),
                    e
                )),
            ),
        }
    }

    /// Intents for a write. An unreadable file is moved aside first.
    fn staged_for_write(&self) -> Result<Vec<StagedDecrement>> {
        let loaded = self.read_staged();
        if let Some(warning) = loaded.warning {
            warn!(%warning, "Replacing unreadable staged decrements");
            if self.staged_path.exists() {
                quarantine(&self.staged_path)?;
            }
        }
        Ok(loaded.value)
    }

    fn decrement(&self, group: GroupId, slot: SlotId) -> Result<i64> {
        let _guard = self.file_lock.lock();

        // A degraded table reads as empty, so this fails with UnknownGroup
        // before anything could be written over the unreadable file.
        let mut rows = self.read_rows().into_logged("counters");
        let remaining = apply_decrement(&mut rows, group, slot)?;
        write_json(&self.path, &rows, Indent::Four)?;

        debug!(group = %group, folder = %slot, remaining, "Decremented folder counter");
        Ok(remaining)
    }

    fn stage(&self, intent: StagedDecrement) -> Result<()> {
        let _guard = self.file_lock.lock();

        let mut intents = self.staged_for_write()?;
        intents.retain(|i| i.transaction_id != intent.transaction_id);
        intents.push(intent);
        write_json(&self.staged_path, &intents, Indent::Four)
    }

    fn settle(&self, id: &TransactionId) -> Result<Settlement> {
        let _guard = self.file_lock.lock();

        let mut intents = self.staged_for_write()?;
        let position = match intents.iter().position(|i| &i.transaction_id == id) {
            Some(position) => position,
            None => return Ok(Settlement::NotStaged),
        };

        let mut rows = self.rows_for_write()?;
        let settlement = settle_rows(&mut rows, &intents[position]);
        if let Settlement::Applied { .. } = settlement {
            write_json(&self.path, &rows, Indent::Four)?;
        }

        // Once the counter write is durable, re-settling this intent is a no-op
        intents.remove(position);
        write_json(&self.staged_path, &intents, Indent::Four)?;

        debug!(transaction = %id, ?settlement, "Settled staged decrement");
        Ok(settlement)
    }

    fn discard(&self, id: &TransactionId) -> Result<()> {
        let _guard = self.file_lock.lock();

        let mut intents = self.staged_for_write()?;
        let before = intents.len();
        intents.retain(|i| &i.transaction_id != id);
        if intents.len() != before {
            write_json(&self.staged_path, &intents, Indent::Four)?;
        }
        Ok(())
    }
}

#[async_trait]
impl CounterTable for JsonCounterTable {
    async fn snapshot(&self) -> Result<Loaded<CounterRows>> {
        let file = Arc::clone(&self.inner);
        run_blocking(move || {
            let _guard = file.file_lock.lock();
            Ok(file.read_rows())
        })
        .await
    }

    async fn decrement(&self, group: GroupId, slot: SlotId) -> Result<i64> {
        let file = Arc::clone(&self.inner);
        run_blocking(move || file.decrement(group, slot)).await
    }

    async fn stage(&self, intent: StagedDecrement) -> Result<()> {
        let file = Arc::clone(&self.inner);
        run_blocking(move || file.stage(intent)).await
    }

    async fn staged(&self) -> Result<Loaded<Vec<StagedDecrement>>> {
        let file = Arc::clone(&self.inner);
        run_blocking(move || {
            let _guard = file.file_lock.lock();
            Ok(file.read_staged())
        })
        .await
    }

    async fn settle(&self, id: &TransactionId) -> Result<Settlement> {
        let file = Arc::clone(&self.inner);
        let id = id.clone();
        run_blocking(move || file.settle(&id)).await
    }

    async fn discard(&self, id: &TransactionId) -> Result<()> {
        let file = Arc::clone(&self.inner);
        let id = id.clone();
        run_blocking(move || file.discard(&id)).await
    }
}
