//! Storage layer
//!
//! # Architecture
//!
//! Two pieces of persisted state back the allocator:
//!
//! ```text
//! LogStore      (append-only)   [START t1 f4 g2] [START t2 f1 g2] [COMPLETE t1 f4 g2] ...
//! CounterTable  (rewritten)     { "1": [1, 1, 0, ...], "2": [1, 0, 1, ...] }
//!   staged      (rewritten)     [ {t1 f4 g2 before=1} ]
//! ```
//!
//! The log is the source of truth for transaction state; the counter table is
//! the mutable view of remaining capacity per folder. A completion stages its
//! decrement before COMPLETE is appended and settles it afterwards, so every
//! COMPLETE either has its decrement applied or still has it staged.
//!
//! ## Implementation
//!
//! - **JSON files** written with temp-file + fsync + rename, so a crash leaves
//!   either the old or the new document, never a torn one
//! - **Lenient reads**: a missing or corrupt file reads as empty and the
//!   problem travels with the result as a warning ([`Loaded`])
//! - **In-memory** backends for tests

pub mod atomic;
pub mod counter_file;
pub mod engine;
pub mod log_file;
pub mod mock;

pub use counter_file::JsonCounterTable;
pub use engine::{
    CounterRows, CounterTable, Loaded, LogFilter, LogQuery, LogStore, Settlement, StagedDecrement,
};
pub use log_file::JsonLogStore;
pub use mock::{MemoryCounterTable, MemoryLogStore};

use crate::error::{Error, Result};

/// Run synchronous file I/O on the blocking pool so fsync never stalls a runtime worker
pub(crate) async fn run_blocking<T, F>(task: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| Error::Storage(format!("Storage task failed: {}", e)))?
}
