// Slotkeeper - folder slot allocation service
// Hands out capacity-bounded folder slots and keeps a durable audit trail

#![warn(rust_2018_idioms)]

pub mod allocation;
pub mod config;
pub mod metrics;
pub mod server;
pub mod storage;
pub mod types;

// Re-exports for convenience
pub use allocation::{Allocation, CompletionReceipt, FolderService, ServiceOptions};
pub use storage::{CounterTable, LogStore};
pub use types::{Action, GroupId, LogEntry, SlotId, TransactionId};

/// Slotkeeper error types
pub mod error {
    use crate::types::{GroupId, SlotId, TransactionId};
    use serde::Serialize;
    use std::fmt;
    use thiserror::Error;

    /// Why a completion was refused.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    #[serde(rename_all = "snake_case")]
    pub enum RejectReason {
        /// No START entry carries this transaction id
        UnknownTransaction,
        /// The transaction was opened for another group
        GroupMismatch,
        /// The transaction was opened for another slot
        SlotMismatch,
        /// The transaction already has a COMPLETE entry
        AlreadyCompleted,
    }

    impl fmt::Display for RejectReason {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let text = match self {
                RejectReason::UnknownTransaction => "no matching START entry",
                RejectReason::GroupMismatch => "transaction belongs to another group",
                RejectReason::SlotMismatch => "transaction belongs to another folder",
                RejectReason::AlreadyCompleted => "transaction already completed",
            };
            f.write_str(text)
        }
    }

    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum Error {
        #[error("Storage unavailable: {0}")]
        StorageUnavailable(String),

        #[error("Unknown group: {0}")]
        UnknownGroup(GroupId),

        #[error("Transaction {transaction_id} rejected: {reason}")]
        Validation {
            transaction_id: TransactionId,
            reason: RejectReason,
        },

        #[error("Folder {slot} out of range for group {group} ({slots} folders)")]
        SlotOutOfRange {
            group: GroupId,
            slot: SlotId,
            slots: usize,
        },

        #[error("Folder {slot} of group {group} is exhausted")]
        ExhaustedSlot { group: GroupId, slot: SlotId },

        #[error("Storage error: {0}")]
        Storage(String),

        #[error("Serialization error: {0}")]
        Serialization(String),

        #[error("Invalid argument: {0}")]
        InvalidArgument(String),

        #[error("Configuration error: {0}")]
        Config(String),
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
