//! SQLite-backed feed store.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};

use super::{FeedStore, LogRecord};
use crate::error::{EchoError, Result};
use crate::keys::PeerId;
use crate::timeframe::Timeframe;

/// SQLite-backed feed storage.
///
/// Each record is a row keyed by `(peer, seq)`. Appends run inside a
/// transaction so the next sequence number is assigned atomically.
///
/// # Thread Safety
///
/// The connection is wrapped in a `Mutex` for thread-safe access.
pub struct SqliteFeedStore {
    conn: Mutex<Connection>,
}

impl SqliteFeedStore {
    /// Open or create a feed database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory database for testing.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                peer TEXT NOT NULL,
                seq INTEGER NOT NULL,
                data BLOB NOT NULL,
                timeframe TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                PRIMARY KEY (peer, seq)
            );
            "#,
        )?;
        Ok(())
    }
}

impl FeedStore for SqliteFeedStore {
    fn append(&self, peer: &PeerId, record: LogRecord) -> Result<u64> {
        let timeframe = serde_json::to_string(&record.timeframe)?;
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let next: i64 = tx.query_row(
            "SELECT COUNT(*) FROM records WHERE peer = ?",
            params![peer.as_str()],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO records (peer, seq, data, timeframe, timestamp) VALUES (?, ?, ?, ?, ?)",
            params![peer.as_str(), next, record.data, timeframe, record.timestamp],
        )?;
        tx.commit()?;
        Ok(next as u64)
    }

    fn insert(&self, peer: &PeerId, seq: u64, record: LogRecord) -> Result<bool> {
        let timeframe = serde_json::to_string(&record.timeframe)?;
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let length: i64 = tx.query_row(
            "SELECT COUNT(*) FROM records WHERE peer = ?",
            params![peer.as_str()],
            |row| row.get(0),
        )?;
        let length = length as u64;
        if seq < length {
            log::debug!("Record {}[{}] already confirmed", peer, seq);
            return Ok(false);
        }
        if seq > length {
            return Err(EchoError::FeedGap {
                peer: peer.clone(),
                seq,
                length,
            });
        }
        tx.execute(
            "INSERT INTO records (peer, seq, data, timeframe, timestamp) VALUES (?, ?, ?, ?, ?)",
            params![peer.as_str(), seq as i64, record.data, timeframe, record.timestamp],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn read(&self, peer: &PeerId, seq: u64) -> Result<LogRecord> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(Vec<u8>, String, i64)> = conn
            .query_row(
                "SELECT data, timeframe, timestamp FROM records WHERE peer = ? AND seq = ?",
                params![peer.as_str(), seq as i64],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let (data, timeframe, timestamp) = row.ok_or_else(|| EchoError::NotFound {
            peer: peer.clone(),
            seq,
        })?;
        let timeframe: Timeframe =
            serde_json::from_str(&timeframe).map_err(|e| EchoError::CorruptRecord {
                peer: peer.clone(),
                seq,
                reason: format!("bad timeframe column: {}", e),
            })?;

        Ok(LogRecord {
            data,
            timeframe,
            timestamp,
        })
    }

    fn length(&self, peer: &PeerId) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM records WHERE peer = ?",
            params![peer.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn peers(&self) -> Result<Vec<PeerId>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT DISTINCT peer FROM records ORDER BY peer ASC")?;
        let peers = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(peers.into_iter().map(PeerId::from).collect())
    }
}

impl std::fmt::Debug for SqliteFeedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteFeedStore").finish_non_exhaustive()
    }
}
