//! Flat-file JSON record store
//!
//! The original storage format: one pretty-printed JSON document with a
//! per-user map keyed by the stringified id. Good enough for small
//! installs and for tests that don't want SQLite on disk. An unreadable
//! or corrupt file is treated as empty, not as a fatal error.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::{
    normalize_field, FieldValue, ForgetTarget, MemoryEntry, MemoryWrite, RecordStore, StoreError,
    UserId,
};

#[derive(Debug, Default, Serialize, Deserialize)]
struct UserDoc {
    #[serde(default)]
    fields: BTreeMap<String, FieldValue>,
    #[serde(default)]
    memory: Vec<MemoryEntry>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Doc {
    /// Last assigned entry id, monotonic across all users.
    #[serde(default)]
    next_entry_id: i64,
    #[serde(default)]
    users: BTreeMap<String, UserDoc>,
}

/// JSON-file-backed [`RecordStore`]
pub struct JsonStore {
    path: PathBuf,
    doc: Mutex<Doc>,
}

impl JsonStore {
    /// Open or create the store file
    pub fn open(path: PathBuf) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let doc = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "store file unreadable, starting empty");
                Doc::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Doc::default(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Doc>, StoreError> {
        self.doc
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))
    }

    /// Temp file + rename, so the document on disk is always either the
    /// old or the new complete state, never a torn write.
    fn persist(&self, doc: &Doc) -> Result<(), StoreError> {
        let raw = serde_json::to_string_pretty(doc)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl RecordStore for JsonStore {
    fn set_field(&self, user: UserId, field: &str, value: FieldValue) -> Result<(), StoreError> {
        let field = normalize_field(field);
        let mut doc = self.lock()?;
        doc.users
            .entry(user.0.to_string())
            .or_default()
            .fields
            .insert(field.clone(), value);
        self.persist(&doc)?;
        debug!(user = user.0, field, "field upsert");
        Ok(())
    }

    fn get_field(&self, user: UserId, field: &str) -> Result<Option<FieldValue>, StoreError> {
        let field = normalize_field(field);
        let doc = self.lock()?;
        Ok(doc
            .users
            .get(&user.0.to_string())
            .and_then(|u| u.fields.get(&field))
            .cloned())
    }

    fn list_fields(&self, user: UserId) -> Result<Vec<(String, FieldValue)>, StoreError> {
        let doc = self.lock()?;
        Ok(doc
            .users
            .get(&user.0.to_string())
            .map(|u| {
                u.fields
                    .iter()
                    .filter(|(name, _)| !crate::RESERVED_FIELDS.contains(&name.as_str()))
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn delete_field(&self, user: UserId, field: &str) -> Result<bool, StoreError> {
        let field = normalize_field(field);
        let mut doc = self.lock()?;
        let removed = doc
            .users
            .get_mut(&user.0.to_string())
            .map(|u| u.fields.remove(&field).is_some())
            .unwrap_or(false);
        if removed {
            self.persist(&doc)?;
        }
        Ok(removed)
    }

    fn add_memory(&self, user: UserId, text: &str) -> Result<MemoryWrite, StoreError> {
        let mut doc = self.lock()?;
        let key = user.0.to_string();

        if let Some(existing) = doc
            .users
            .get(&key)
            .and_then(|u| u.memory.iter().find(|e| e.text == text))
        {
            debug!(user = user.0, id = existing.id, "duplicate memory entry, not inserting");
            return Ok(MemoryWrite::Duplicate(existing.id));
        }

        doc.next_entry_id += 1;
        let id = doc.next_entry_id;
        doc.users.entry(key).or_default().memory.push(MemoryEntry {
            id,
            text: text.to_string(),
        });
        self.persist(&doc)?;
        Ok(MemoryWrite::Inserted(id))
    }

    fn list_memory(&self, user: UserId) -> Result<Vec<MemoryEntry>, StoreError> {
        let doc = self.lock()?;
        Ok(doc
            .users
            .get(&user.0.to_string())
            .map(|u| u.memory.clone())
            .unwrap_or_default())
    }

    fn delete_memory(&self, user: UserId, target: ForgetTarget) -> Result<usize, StoreError> {
        let mut doc = self.lock()?;
        let Some(u) = doc.users.get_mut(&user.0.to_string()) else {
            return Ok(0);
        };
        let before = u.memory.len();
        match target {
            ForgetTarget::Entry(id) => u.memory.retain(|e| e.id != id),
            ForgetTarget::All => u.memory.clear(),
        }
        let deleted = before - u.memory.len();
        if deleted > 0 {
            self.persist(&doc)?;
        }
        Ok(deleted)
    }

    fn delete_user(&self, user: UserId) -> Result<(), StoreError> {
        let mut doc = self.lock()?;
        if doc.users.remove(&user.0.to_string()).is_some() {
            self.persist(&doc)?;
        }
        Ok(())
    }
}
