//! Zapisnik Record Store - per-user fields, memory entries, and quotas
//!
//! Every piece of shared bot state lives here, keyed by the external
//! numeric user id. Handlers stay stateless; backends are swappable
//! behind the [`RecordStore`] trait (SQLite for deployment, a flat JSON
//! file for small installs and tests).

pub mod json;
pub mod quota;
pub mod sqlite;

use serde::{Deserialize, Serialize};

pub use json::JsonStore;
pub use quota::{QuotaDecision, QuotaTracker, WEEK_SECONDS};
pub use sqlite::SqliteStore;

/// External numeric user id. Stable, assigned by the messaging transport,
/// never reused for two different people.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub i64);

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        UserId(id)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Reserved field names stored as typed columns rather than free-form rows.
pub const RESERVED_FIELDS: [&str; 4] = ["name", "voice_time", "voice_counter", "beta"];

/// Scalar value of a user field.
///
/// Untagged so the JSON backend writes `"name": "Dima"` and
/// `"voice_counter": 3` instead of wrapping everything in objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Integer(i64),
    Text(String),
}

impl FieldValue {
    /// Integer view. Numeric-looking text coerces, so a counter that went
    /// through a text-typed column still reads back as a number.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(i) => Some(*i),
            FieldValue::Text(s) => s.trim().parse().ok(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            FieldValue::Integer(_) => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<i64> for FieldValue {
    fn from(i: i64) -> Self {
        FieldValue::Integer(i)
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Integer(i) => i.fmt(f),
            FieldValue::Text(s) => s.fmt(f),
        }
    }
}

/// One remembered free-form fact, addressable by its store-wide id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: i64,
    pub text: String,
}

/// Result of [`RecordStore::add_memory`]: either a fresh insert or the id
/// of the already-stored exact duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryWrite {
    Inserted(i64),
    Duplicate(i64),
}

impl MemoryWrite {
    pub fn id(&self) -> i64 {
        match self {
            MemoryWrite::Inserted(id) | MemoryWrite::Duplicate(id) => *id,
        }
    }
}

/// What to delete from a user's memory entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForgetTarget {
    Entry(i64),
    All,
}

/// Storage-layer failure. "Not found" is never an error here: absent
/// users and fields come back as `None`/empty collections so callers can
/// tell a storage outage apart from an empty record.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// Durable per-user record: reserved + free-form fields plus an ordered
/// collection of memory entries.
///
/// User records are created lazily on first write. Reads for unknown
/// users succeed with empty results. Entry ids are monotonic across the
/// whole store, not per user, and stay stable until deleted.
pub trait RecordStore: Send + Sync {
    /// Upsert a field. Field names are trimmed and lowercased. Calling
    /// twice with the same value is observably a no-op.
    fn set_field(&self, user: UserId, field: &str, value: FieldValue) -> Result<(), StoreError>;

    /// `None` when the user or the field was never set. An explicitly
    /// stored empty string is `Some(Text(""))`, not `None`.
    fn get_field(&self, user: UserId, field: &str) -> Result<Option<FieldValue>, StoreError>;

    /// Free-form fields only, sorted by name. Reserved fields are not listed.
    fn list_fields(&self, user: UserId) -> Result<Vec<(String, FieldValue)>, StoreError>;

    /// Remove one field. `Ok(false)` when it was never set. Reserved
    /// fields are cleared back to unset rather than dropped from the schema.
    fn delete_field(&self, user: UserId, field: &str) -> Result<bool, StoreError>;

    /// Store a memory entry, unless the exact same text is already stored
    /// for this user - then the existing id is returned without writing.
    fn add_memory(&self, user: UserId, text: &str) -> Result<MemoryWrite, StoreError>;

    /// All entries for the user in creation order. Empty vec for unknown users.
    fn list_memory(&self, user: UserId) -> Result<Vec<MemoryEntry>, StoreError>;

    /// Returns how many entries were removed. Deleting a non-existent id
    /// is a silent no-op (`Ok(0)`). `All` leaves the user's fields alone.
    fn delete_memory(&self, user: UserId, target: ForgetTarget) -> Result<usize, StoreError>;

    /// Drop the whole record: fields, reserved columns, memory entries.
    fn delete_user(&self, user: UserId) -> Result<(), StoreError>;
}

/// Canonical form of a field name: trimmed, lowercased.
pub fn normalize_field(name: &str) -> String {
    name.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_value_coercion() {
        assert_eq!(FieldValue::Integer(42).as_i64(), Some(42));
        assert_eq!(FieldValue::Text("42".into()).as_i64(), Some(42));
        assert_eq!(FieldValue::Text("blue".into()).as_i64(), None);
        assert_eq!(FieldValue::Text("blue".into()).as_str(), Some("blue"));
        assert_eq!(FieldValue::Integer(1).as_str(), None);
    }

    #[test]
    fn test_normalize_field() {
        assert_eq!(normalize_field("  Color "), "color");
        assert_eq!(normalize_field("NAME"), "name");
    }

    #[test]
    fn test_untagged_json_shape() {
        let v = serde_json::to_value(FieldValue::Integer(3)).unwrap();
        assert_eq!(v, serde_json::json!(3));
        let v = serde_json::to_value(FieldValue::Text("x".into())).unwrap();
        assert_eq!(v, serde_json::json!("x"));
    }
}
