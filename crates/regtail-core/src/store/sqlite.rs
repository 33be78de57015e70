//! SQLite-backed key-value storage.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;

use super::backend::KvBackend;
use crate::error::StorageError;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS progress_kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL
)";

const UPSERT: &str = "INSERT INTO progress_kv (key, value, updated_at) VALUES (?1, ?2, ?3)
    ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at";

/// Progress persisted in a single `progress_kv` table.
#[derive(Debug)]
pub struct SqliteBackend {
    conn: Connection,
}

impl SqliteBackend {
    /// Open (or create) the database at `path`. Parent directories are
    /// created as needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StorageError::Backend(format!("create {}: {e}", parent.display()))
                })?;
            }
        }
        let conn = Connection::open(path).map_err(backend_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
            .map_err(backend_err)?;
        Self::init(conn)
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory().map_err(backend_err)?)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(SCHEMA).map_err(backend_err)?;
        Ok(Self { conn })
    }
}

fn backend_err(err: rusqlite::Error) -> StorageError {
    StorageError::Backend(err.to_string())
}

fn encode(key: &str, value: &Value) -> Result<String, StorageError> {
    serde_json::to_string(value).map_err(|e| StorageError::Serialization {
        key: key.to_string(),
        details: e.to_string(),
    })
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl KvBackend for SqliteBackend {
    fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM progress_kv WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend_err)?;
        raw.map(|text| {
            serde_json::from_str(&text).map_err(|e| StorageError::Corrupt {
                key: key.to_string(),
                details: e.to_string(),
            })
        })
        .transpose()
    }

    fn set(&mut self, key: &str, value: &Value) -> Result<(), StorageError> {
        let text = encode(key, value)?;
        self.conn
            .execute(UPSERT, params![key, text, now_ms()])
            .map_err(backend_err)?;
        Ok(())
    }

    fn has(&self, key: &str) -> Result<bool, StorageError> {
        self.conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM progress_kv WHERE key = ?1)",
                params![key],
                |row| row.get(0),
            )
            .map_err(backend_err)
    }

    fn set_many(&mut self, entries: &[(&str, Value)]) -> Result<(), StorageError> {
        let encoded = entries
            .iter()
            .map(|(key, value)| encode(key, value).map(|text| (*key, text)))
            .collect::<Result<Vec<_>, _>>()?;
        let now = now_ms();
        let tx = self.conn.transaction().map_err(backend_err)?;
        {
            let mut stmt = tx.prepare_cached(UPSERT).map_err(backend_err)?;
            for (key, text) in &encoded {
                stmt.execute(params![key, text, now]).map_err(backend_err)?;
            }
        }
        tx.commit().map_err(backend_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::backend::{KEY_BLOCKS, KEY_LOW_WATER_MARK};
    use serde_json::json;

    #[test]
    fn values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("progress.db");
        {
            let mut backend = SqliteBackend::open(&path).unwrap();
            backend.set(KEY_LOW_WATER_MARK, &json!(1234)).unwrap();
            backend.set(KEY_LOW_WATER_MARK, &json!(1500)).unwrap();
        }
        let backend = SqliteBackend::open(&path).unwrap();
        assert_eq!(backend.get(KEY_LOW_WATER_MARK).unwrap(), Some(json!(1500)));
        assert!(!backend.has(KEY_BLOCKS).unwrap());
    }

    #[test]
    fn set_many_writes_all_keys() {
        let mut backend = SqliteBackend::open_in_memory().unwrap();
        backend
            .set_many(&[
                (KEY_LOW_WATER_MARK, json!(10)),
                (KEY_BLOCKS, json!([{"id": 0}])),
            ])
            .unwrap();
        assert!(backend.has(KEY_LOW_WATER_MARK).unwrap());
        assert_eq!(backend.get(KEY_BLOCKS).unwrap(), Some(json!([{"id": 0}])));
    }

    #[test]
    fn unparsable_value_is_corrupt() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend
            .conn
            .execute(
                "INSERT INTO progress_kv (key, value, updated_at) VALUES ('blocks', '{oops', 0)",
                [],
            )
            .unwrap();
        assert!(matches!(
            backend.get(KEY_BLOCKS),
            Err(StorageError::Corrupt { .. })
        ));
    }
}
