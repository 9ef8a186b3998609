//! SQLite record store
//!
//! The deployment backend. One `users` row per person with the reserved
//! fields as typed columns, free-form fields and memory entries as child
//! rows. WAL mode, foreign keys on, everything behind one connection.

use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::{
    normalize_field, FieldValue, ForgetTarget, MemoryEntry, MemoryWrite, RecordStore, StoreError,
    UserId, RESERVED_FIELDS,
};

/// SQLite-backed [`RecordStore`]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the store database
    pub fn open(path: PathBuf) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)?;

        // WAL for better concurrent access, FK for cascade on delete_user
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                tg_id         INTEGER NOT NULL UNIQUE,
                name          TEXT,
                beta          TEXT,
                voice_time    INTEGER,
                voice_counter INTEGER
            );
            CREATE TABLE IF NOT EXISTS fields (
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                field   TEXT NOT NULL,
                value   TEXT NOT NULL,
                is_int  INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, field)
            );
            CREATE TABLE IF NOT EXISTS memory (
                id      INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                data    TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_memory_user ON memory(user_id);",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open using the default path (~/.zapisnik/store.db)
    pub fn open_default() -> Result<Self, StoreError> {
        let path = dirs::home_dir()
            .ok_or_else(|| StoreError::Unavailable("no home directory".to_string()))?
            .join(".zapisnik")
            .join("store.db");
        Self::open(path)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))
    }

    /// Lazy user creation on first write
    fn ensure_user(conn: &Connection, user: UserId) -> Result<(), StoreError> {
        conn.execute(
            "INSERT INTO users (tg_id) VALUES (?1) ON CONFLICT DO NOTHING",
            params![user.0],
        )?;
        Ok(())
    }

    /// Static UPDATE statement for a reserved column. Field names never go
    /// through string formatting into SQL.
    fn reserved_update_sql(field: &str) -> Option<&'static str> {
        match field {
            "name" => Some("UPDATE users SET name = ?1 WHERE tg_id = ?2"),
            "beta" => Some("UPDATE users SET beta = ?1 WHERE tg_id = ?2"),
            "voice_time" => Some("UPDATE users SET voice_time = ?1 WHERE tg_id = ?2"),
            "voice_counter" => Some("UPDATE users SET voice_counter = ?1 WHERE tg_id = ?2"),
            _ => None,
        }
    }

    fn reserved_select_sql(field: &str) -> Option<&'static str> {
        match field {
            "name" => Some("SELECT name FROM users WHERE tg_id = ?1"),
            "beta" => Some("SELECT beta FROM users WHERE tg_id = ?1"),
            "voice_time" => Some("SELECT voice_time FROM users WHERE tg_id = ?1"),
            "voice_counter" => Some("SELECT voice_counter FROM users WHERE tg_id = ?1"),
            _ => None,
        }
    }
}

fn to_sql_value(value: &FieldValue) -> Value {
    match value {
        FieldValue::Integer(i) => Value::Integer(*i),
        FieldValue::Text(s) => Value::Text(s.clone()),
    }
}

fn from_sql_value(value: Value) -> Option<FieldValue> {
    match value {
        Value::Null => None,
        Value::Integer(i) => Some(FieldValue::Integer(i)),
        Value::Text(s) => Some(FieldValue::Text(s)),
        Value::Real(f) => Some(FieldValue::Text(f.to_string())),
        Value::Blob(_) => None,
    }
}

impl RecordStore for SqliteStore {
    fn set_field(&self, user: UserId, field: &str, value: FieldValue) -> Result<(), StoreError> {
        let field = normalize_field(field);
        let conn = self.lock()?;
        Self::ensure_user(&conn, user)?;

        if let Some(sql) = Self::reserved_update_sql(&field) {
            conn.execute(sql, params![to_sql_value(&value), user.0])?;
        } else {
            let (text, is_int) = match &value {
                FieldValue::Integer(i) => (i.to_string(), 1i64),
                FieldValue::Text(s) => (s.clone(), 0),
            };
            conn.execute(
                "INSERT INTO fields (user_id, field, value, is_int)
                 SELECT id, ?2, ?3, ?4 FROM users WHERE tg_id = ?1
                 ON CONFLICT(user_id, field)
                 DO UPDATE SET value = excluded.value, is_int = excluded.is_int",
                params![user.0, field, text, is_int],
            )?;
        }
        debug!(user = user.0, field, "field upsert");
        Ok(())
    }

    fn get_field(&self, user: UserId, field: &str) -> Result<Option<FieldValue>, StoreError> {
        let field = normalize_field(field);
        let conn = self.lock()?;

        if let Some(sql) = Self::reserved_select_sql(&field) {
            let value: Option<Value> = conn
                .query_row(sql, params![user.0], |row| row.get(0))
                .optional()?;
            return Ok(value.and_then(from_sql_value));
        }

        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT value, is_int FROM fields
                 WHERE user_id = (SELECT id FROM users WHERE tg_id = ?1) AND field = ?2",
                params![user.0, field],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        Ok(row.map(|(text, is_int)| {
            if is_int != 0 {
                text.parse().map(FieldValue::Integer).unwrap_or(FieldValue::Text(text))
            } else {
                FieldValue::Text(text)
            }
        }))
    }

    fn list_fields(&self, user: UserId) -> Result<Vec<(String, FieldValue)>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT field, value, is_int FROM fields
             WHERE user_id = (SELECT id FROM users WHERE tg_id = ?1)
             ORDER BY field",
        )?;
        let rows = stmt.query_map(params![user.0], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut fields = Vec::new();
        for row in rows {
            let (field, text, is_int) = row?;
            let value = if is_int != 0 {
                text.parse().map(FieldValue::Integer).unwrap_or(FieldValue::Text(text))
            } else {
                FieldValue::Text(text)
            };
            fields.push((field, value));
        }
        Ok(fields)
    }

    fn delete_field(&self, user: UserId, field: &str) -> Result<bool, StoreError> {
        let field = normalize_field(field);

        if RESERVED_FIELDS.contains(&field.as_str()) {
            // Reserved columns are cleared back to NULL, and only count as
            // deleted when they held something.
            let had_value = self.get_field(user, &field)?.is_some();
            if had_value {
                let conn = self.lock()?;
                let sql = Self::reserved_update_sql(&field).unwrap_or_default();
                conn.execute(sql, params![Value::Null, user.0])?;
            }
            return Ok(had_value);
        }

        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM fields
             WHERE user_id = (SELECT id FROM users WHERE tg_id = ?1) AND field = ?2",
            params![user.0, field],
        )?;
        Ok(deleted > 0)
    }

    fn add_memory(&self, user: UserId, text: &str) -> Result<MemoryWrite, StoreError> {
        let conn = self.lock()?;

        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM memory
                 WHERE user_id = (SELECT id FROM users WHERE tg_id = ?1) AND data = ?2
                 LIMIT 1",
                params![user.0, text],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(id) = existing {
            debug!(user = user.0, id, "duplicate memory entry, not inserting");
            return Ok(MemoryWrite::Duplicate(id));
        }

        Self::ensure_user(&conn, user)?;
        conn.execute(
            "INSERT INTO memory (user_id, data)
             SELECT id, ?2 FROM users WHERE tg_id = ?1",
            params![user.0, text],
        )?;
        Ok(MemoryWrite::Inserted(conn.last_insert_rowid()))
    }

    fn list_memory(&self, user: UserId) -> Result<Vec<MemoryEntry>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT memory.id, data FROM memory
             JOIN users ON memory.user_id = users.id
             WHERE users.tg_id = ?1
             ORDER BY memory.id",
        )?;
        let rows = stmt.query_map(params![user.0], |row| {
            Ok(MemoryEntry {
                id: row.get(0)?,
                text: row.get(1)?,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    fn delete_memory(&self, user: UserId, target: ForgetTarget) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let deleted = match target {
            ForgetTarget::Entry(id) => conn.execute(
                "DELETE FROM memory
                 WHERE id = ?2 AND user_id = (SELECT id FROM users WHERE tg_id = ?1)",
                params![user.0, id],
            )?,
            ForgetTarget::All => conn.execute(
                "DELETE FROM memory
                 WHERE user_id = (SELECT id FROM users WHERE tg_id = ?1)",
                params![user.0],
            )?,
        };
        Ok(deleted)
    }

    fn delete_user(&self, user: UserId) -> Result<(), StoreError> {
        let conn = self.lock()?;
        // fields and memory rows go with it via ON DELETE CASCADE
        conn.execute("DELETE FROM users WHERE tg_id = ?1", params![user.0])?;
        Ok(())
    }
}
