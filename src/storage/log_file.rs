//! JSON-file audit log
//!
//! The whole history lives in one JSON array. It is read once at open and then
//! mirrored in memory; every append rewrites the file atomically before the
//! mirror is updated, so readers only ever see durable entries.

use super::atomic::{quarantine, write_json, Indent};
use super::engine::{Loaded, LogStore};
use super::run_blocking;
use crate::error::{Error, Result};
use crate::types::LogEntry;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Audit log stored as a JSON array file
pub struct JsonLogStore {
    inner: Arc<LogFile>,
}

struct LogFile {
    path: PathBuf,
    state: Mutex<LogState>,
}

struct LogState {
    entries: Arc<Vec<LogEntry>>,
    problem: Option<Problem>,
}

/// Why the history could not be read at open
enum Problem {
    /// Nothing on disk yet; cleared by the first append
    Missing(Error),
    /// Unreadable file; it is moved aside before the first append
    Corrupt { warning: Error, quarantined: bool },
}

impl Problem {
    fn warning(&self) -> &Error {
        match self {
            Problem::Missing(w) => w,
            Problem::Corrupt { warning, .. } => warning,
        }
    }
}

impl JsonLogStore {
    /// Open the log at `path`. Never fails on a missing or corrupt file.
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let (entries, problem) = match read_history(&path) {
            Ok(entries) => {
                info!(path = %path.display(), entries = entries.len(), "Audit log loaded");
                (entries, None)
            }
            Err(ReadFailure::Missing) => {
                let warning = Error::StorageUnavailable(format!(
                    "log file {} not found, starting with empty history",
                    path.display()
                ));
                warn!(%warning, "Audit log missing");
                (Vec::new(), Some(Problem::Missing(warning)))
            }
            Err(ReadFailure::Unreadable(reason)) => {
                let warning = Error::StorageUnavailable(format!(
                    "log file {} unreadable ({}), history treated as empty",
                    path.display(),
                    reason
                ));
                error!(%warning, "Audit log corrupt");
                (
                    Vec::new(),
                    Some(Problem::Corrupt {
                        warning,
                        quarantined: false,
                    }),
                )
            }
        };

        Self {
            inner: Arc::new(LogFile {
                path,
                state: Mutex::new(LogState {
                    entries: Arc::new(entries),
                    problem,
                }),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }
}

impl LogFile {
    fn append(&self, entry: LogEntry) -> Result<()> {
        let mut state = self.state.lock();

        if let Some(Problem::Corrupt { quarantined, .. }) = &mut state.problem {
            if !*quarantined {
                quarantine(&self.path)?;
                *quarantined = true;
            }
        }

        let entries = Arc::make_mut(&mut state.entries);
        entries.push(entry);
        if let Err(e) = write_json(&self.path, entries.as_slice(), Indent::Two) {
            entries.pop();
            return Err(e);
        }

        if matches!(state.problem, Some(Problem::Missing(_))) {
            state.problem = None;
        }

        debug!(entries = state.entries.len(), "Appended audit entry");
        Ok(())
    }
}

enum ReadFailure {
    Missing,
    Unreadable(String),
}

fn read_history(path: &Path) -> std::result::Result<Vec<LogEntry>, ReadFailure> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(ReadFailure::Missing),
        Err(e) => return Err(ReadFailure::Unreadable(e.to_string())),
    };

    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    serde_json::from_str(&text).map_err(|e| ReadFailure::Unreadable(e.to_string()))
}

#[async_trait]
impl LogStore for JsonLogStore {
    async fn append(&self, entry: LogEntry) -> Result<()> {
        let file = Arc::clone(&self.inner);
        run_blocking(move || file.append(entry)).await
    }

    async fn load(&self) -> Result<Loaded<Arc<Vec<LogEntry>>>> {
        let state = self.inner.state.lock();
        let entries = state.entries.clone();
        Ok(match &state.problem {
            Some(problem) => Loaded::degraded(entries, problem.warning().clone()),
            None => Loaded::clean(entries),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::engine::LogFilter;
    use crate::types::{Action, GroupId, SlotId, TransactionId};

    fn temp_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("slotkeeper_{}_{}", name, uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_round_trip_preserves_order() -> Result<()> {
        let dir = temp_dir("log_round_trip");
        let path = dir.join("process_log.json");

        let mut written = Vec::new();
        {
            let store = JsonLogStore::open(&path);
            for i in 0..25u32 {
                let action = if i % 3 == 2 { Action::Complete } else { Action::Start };
                let entry = LogEntry::now(
                    action,
                    TransactionId::generate(),
                    SlotId(i % 7 + 1),
                    GroupId(i % 4 + 1),
                );
                store.append(entry.clone()).await?;
                written.push(entry);
            }
        }

        let reopened = JsonLogStore::open(&path);
        let loaded = reopened.load().await?;
        assert!(!loaded.is_degraded());
        assert_eq!(*loaded.value, written);

        std::fs::remove_dir_all(dir).ok();
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_file_is_degraded_until_first_append() -> Result<()> {
        let dir = temp_dir("log_missing");
        let store = JsonLogStore::open(dir.join("process_log.json"));

        let loaded = store.load().await?;
        assert!(loaded.value.is_empty());
        assert!(matches!(loaded.warning, Some(Error::StorageUnavailable(_))));

        store
            .append(LogEntry::start(TransactionId::generate(), SlotId(1), GroupId(1)))
            .await?;
        assert!(!store.load().await?.is_degraded());

        std::fs::remove_dir_all(dir).ok();
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_file_is_clean() -> Result<()> {
        let dir = temp_dir("log_empty");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("process_log.json");
        std::fs::write(&path, "  \n").unwrap();

        let loaded = JsonLogStore::open(&path).load().await?;
        assert!(loaded.value.is_empty());
        assert!(!loaded.is_degraded());

        std::fs::remove_dir_all(dir).ok();
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupt_file_is_quarantined() -> Result<()> {
        let dir = temp_dir("log_corrupt");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("process_log.json");
        std::fs::write(&path, "[{\"timestamp\": ").unwrap();

        let store = JsonLogStore::open(&path);
        let loaded = store.load().await?;
        assert!(loaded.value.is_empty());
        assert!(loaded.is_degraded());

        store
            .append(LogEntry::start(TransactionId::from("t1"), SlotId(2), GroupId(1)))
            .await?;

        // The broken history is kept next to the fresh log
        let quarantined: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".corrupt-"))
            .collect();
        assert_eq!(quarantined.len(), 1);

        // Still degraded: the old history is gone from view
        let after = store.load().await?;
        assert!(after.is_degraded());
        assert_eq!(after.value.len(), 1);

        let reopened = JsonLogStore::open(&path).load().await?;
        assert!(!reopened.is_degraded());
        assert_eq!(reopened.value.len(), 1);

        std::fs::remove_dir_all(dir).ok();
        Ok(())
    }

    #[tokio::test]
    async fn test_query_sees_appended_entries() -> Result<()> {
        let dir = temp_dir("log_query");
        let store = JsonLogStore::open(dir.join("process_log.json"));
        let id = TransactionId::from("t-42");

        store.append(LogEntry::start(id.clone(), SlotId(3), GroupId(2))).await?;
        store
            .append(LogEntry::start(TransactionId::from("other"), SlotId(3), GroupId(2)))
            .await?;
        store.append(LogEntry::complete(id.clone(), SlotId(3), GroupId(2))).await?;

        let query = store
            .query(LogFilter::new().transaction(id).action(Action::Complete))
            .await?
            .value;
        assert_eq!(query.count(), 1);

        std::fs::remove_dir_all(dir).ok();
        Ok(())
    }
}
