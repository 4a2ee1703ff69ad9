//! Identifiers and the audit log record
//!
//! The persisted field names (`processId`, `folderId`, `groupId`) match the
//! format clients and existing log files already use.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of a cohort of clients sharing one folder pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub u32);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for GroupId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// One-based folder (slot) number within a group's pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(pub u32);

impl SlotId {
    /// Position of this slot in a counter row, if the id is valid at all
    pub fn index(&self) -> Option<usize> {
        (self.0 as usize).checked_sub(1)
    }

    /// Slot id for a zero-based counter row position
    pub fn from_index(index: usize) -> Self {
        Self(index as u32 + 1)
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for SlotId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Opaque token correlating an allocation with its completion
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(String);

impl TransactionId {
    /// Fresh random (v4) transaction id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransactionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TransactionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Event kind recorded in the audit log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Start,
    Complete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Start => f.write_str("START"),
            Action::Complete => f.write_str("COMPLETE"),
        }
    }
}

/// One immutable audit record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    #[serde(with = "log_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "processId")]
    pub transaction_id: TransactionId,
    pub action: Action,
    #[serde(rename = "folderId")]
    pub slot: SlotId,
    #[serde(rename = "groupId")]
    pub group: GroupId,
}

impl LogEntry {
    /// Build an entry stamped with the current time (whole seconds, as persisted)
    pub fn now(
        action: Action,
        transaction_id: TransactionId,
        slot: SlotId,
        group: GroupId,
    ) -> Self {
        Self {
            timestamp: Utc::now().trunc_subsecs(0),
            transaction_id,
            action,
            slot,
            group,
        }
    }

    pub fn start(transaction_id: TransactionId, slot: SlotId, group: GroupId) -> Self {
        Self::now(Action::Start, transaction_id, slot, group)
    }

    pub fn complete(transaction_id: TransactionId, slot: SlotId, group: GroupId) -> Self {
        Self::now(Action::Complete, transaction_id, slot, group)
    }
}

/// `YYYY-MM-DD HH:MM:SS` in UTC
mod log_timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&ts.format(FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&raw, FORMAT)
            .map(|naive| naive.and_utc())
            .map_err(de::Error::custom)
    }
}

/// Accept an unsigned integer given either as a JSON number or a numeric string.
///
/// Browser clients post ids the way they read them from form fields, so `"3"`
/// and `3` must both work.
pub fn lenient_u32<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(u32),
        Text(String),
    }

    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => Ok(n),
        NumberOrString::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("expected an integer, got {:?}", s))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_entry_wire_format() {
        let json = r#"{"timestamp":"2024-03-01 12:30:05","processId":"p-1","action":"START","folderId":7,"groupId":3}"#;
        let entry: LogEntry = serde_json::from_str(json).unwrap();

        assert_eq!(entry.transaction_id.as_str(), "p-1");
        assert_eq!(entry.action, Action::Start);
        assert_eq!(entry.slot, SlotId(7));
        assert_eq!(entry.group, GroupId(3));
        assert_eq!(serde_json::to_string(&entry).unwrap(), json);
    }

    #[test]
    fn test_now_is_whole_seconds() {
        let entry = LogEntry::start(TransactionId::generate(), SlotId(1), GroupId(1));
        let json = serde_json::to_string(&entry).unwrap();
        let back: LogEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_slot_index() {
        assert_eq!(SlotId(1).index(), Some(0));
        assert_eq!(SlotId(0).index(), None);
        assert_eq!(SlotId::from_index(4), SlotId(5));
    }

    #[test]
    fn test_lenient_u32() {
        #[derive(Deserialize)]
        struct Body {
            #[serde(deserialize_with = "lenient_u32")]
            id: u32,
        }

        let a: Body = serde_json::from_str(r#"{"id": 12}"#).unwrap();
        let b: Body = serde_json::from_str(r#"{"id": " 12 "}"#).unwrap();
        assert_eq!(a.id, 12);
        assert_eq!(b.id, 12);
        assert!(serde_json::from_str::<Body>(r#"{"id": "twelve"}"#).is_err());
        assert!(serde_json::from_str::<Body>(r#"{"id": -1}"#).is_err());
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(TransactionId::generate(), TransactionId::generate());
    }
}
