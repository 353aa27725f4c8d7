//! SQLite-backed storage for CRDT documents.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};

use super::storage::{CrdtStorage, CrdtUpdate, UpdateOrigin};
use crate::error::Result;

/// SQLite-backed CRDT storage.
///
/// Compacted states live in `documents`, incremental updates in `updates`.
/// Saving a state and dropping the updates it folds in happen in one
/// transaction.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open or create a SQLite database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    /// Create an in-memory SQLite database for testing.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                name TEXT PRIMARY KEY,
                state BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            );

            -- Updates may arrive before the document's first snapshot
            CREATE TABLE IF NOT EXISTS updates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                doc_name TEXT NOT NULL,
                data BLOB NOT NULL,
                origin TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_updates_doc_id ON updates(doc_name, id);
            "#,
        )?;
        Ok(())
    }
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage").finish_non_exhaustive()
    }
}

impl CrdtStorage for SqliteStorage {
    fn load_doc(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock().unwrap();
        let state = conn
            .query_row(
                "SELECT state FROM documents WHERE name = ?",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(state)
    }

    fn save_doc(&self, name: &str, state: &[u8]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let now = chrono::Utc::now().timestamp_millis();

        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO documents (name, state, updated_at) VALUES (?, ?, ?)",
            params![name, state, now],
        )?;
        tx.execute("DELETE FROM updates WHERE doc_name = ?", params![name])?;
        tx.commit()?;
        Ok(())
    }

    fn delete_doc(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM updates WHERE doc_name = ?", params![name])?;
        conn.execute("DELETE FROM documents WHERE name = ?", params![name])?;
        Ok(())
    }

    fn list_docs(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT name FROM documents UNION SELECT DISTINCT doc_name FROM updates ORDER BY 1",
        )?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }

    fn append_update(&self, name: &str, update: &[u8], origin: UpdateOrigin) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let now = chrono::Utc::now().timestamp_millis();
        conn.execute(
            "INSERT INTO updates (doc_name, data, origin, timestamp) VALUES (?, ?, ?, ?)",
            params![name, update, origin.as_str(), now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn get_updates_since(&self, name: &str, since_id: i64) -> Result<Vec<CrdtUpdate>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, data, origin, timestamp FROM updates
             WHERE doc_name = ? AND id > ?
             ORDER BY id ASC",
        )?;

        let rows = stmt
            .query_map(params![name, since_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(update_id, data, origin, timestamp)| {
                Ok(CrdtUpdate {
                    update_id,
                    doc_name: name.to_string(),
                    data,
                    timestamp,
                    origin: origin.parse()?,
                })
            })
            .collect()
    }

    fn get_latest_update_id(&self, name: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let id: Option<i64> = conn.query_row(
            "SELECT MAX(id) FROM updates WHERE doc_name = ?",
            params![name],
            |row| row.get(0),
        )?;
        Ok(id.unwrap_or(0))
    }

    fn compact(&self, name: &str, keep_updates: usize) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM updates WHERE doc_name = ?1 AND id NOT IN (
                SELECT id FROM updates WHERE doc_name = ?1 ORDER BY id DESC LIMIT ?2
             )",
            params![name, keep_updates as i64],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load_doc() {
        let storage = SqliteStorage::in_memory().unwrap();
        storage.save_doc("root", b"state").unwrap();
        assert_eq!(storage.load_doc("root").unwrap(), Some(b"state".to_vec()));
        assert!(storage.load_doc("missing").unwrap().is_none());
    }

    #[test]
    fn test_updates_roundtrip_origin() {
        let storage = SqliteStorage::in_memory().unwrap();
        let first = storage.append_update("root", b"u1", UpdateOrigin::Local).unwrap();
        storage.append_update("root", b"u2", UpdateOrigin::Migration).unwrap();

        let since = storage.get_updates_since("root", first).unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].data, b"u2".to_vec());
        assert_eq!(since[0].origin, UpdateOrigin::Migration);
        assert_eq!(storage.list_docs().unwrap(), vec!["root".to_string()]);
    }

    #[test]
    fn test_compact_keeps_newest() {
        let storage = SqliteStorage::in_memory().unwrap();
        for i in 0..5 {
            storage
                .append_update("root", &[i], UpdateOrigin::Local)
                .unwrap();
        }
        storage.compact("root", 2).unwrap();
        let remaining = storage.get_all_updates("root").unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[1].data, vec![4]);
        assert_eq!(
            storage.get_latest_update_id("root").unwrap(),
            remaining[1].update_id
        );
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docs.db");
        {
            let storage = SqliteStorage::open(&path).unwrap();
            storage.append_update("root", b"u", UpdateOrigin::Local).unwrap();
        }
        let storage = SqliteStorage::open(&path).unwrap();
        assert_eq!(storage.get_all_updates("root").unwrap().len(), 1);
    }
}
