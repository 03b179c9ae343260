//! SQLite backend
//!
//! Stores blobs in a `kv_store` table with an epoch-seconds expiry column.

use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::{Backend, BackendResult};

/// Backend over a single SQLite connection.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Opens a private in-memory database.
    pub fn in_memory() -> BackendResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Opens (or creates) a database file.
    pub fn open(path: impl AsRef<Path>) -> BackendResult<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "opening sqlite backend");
        Self::from_connection(Connection::open(path)?)
    }

    /// Wraps an existing connection, creating the table if needed.
    pub fn from_connection(conn: Connection) -> BackendResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv_store (key TEXT PRIMARY KEY, value BLOB, expire REAL);
             CREATE INDEX IF NOT EXISTS idx_kv_expire ON kv_store(expire);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn purge_expired(conn: &Connection) -> BackendResult<usize> {
        Ok(conn.execute(
            "DELETE FROM kv_store WHERE expire IS NOT NULL AND expire <= ?1",
            params![now_secs()],
        )?)
    }
}

impl Backend for SqliteBackend {
    fn set(&self, key: &str, ciphertext: Vec<u8>, ttl: Option<Duration>) -> BackendResult<()> {
        let expire = ttl.map(|ttl| now_secs() + ttl.as_secs_f64());
        self.conn.lock().execute(
            "REPLACE INTO kv_store (key, value, expire) VALUES (?1, ?2, ?3)",
            params![key, ciphertext, expire],
        )?;
        Ok(())
    }

    fn get(&self, key: &str) -> BackendResult<Option<Vec<u8>>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT value, expire FROM kv_store WHERE key = ?1",
                params![key],
                |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Option<f64>>(1)?)),
            )
            .optional()?;

        match row {
            Some((_, Some(expire))) if now_secs() >= expire => {
                conn.execute("DELETE FROM kv_store WHERE key = ?1", params![key])?;
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value)),
            None => Ok(None),
        }
    }

    fn delete(&self, key: &str) -> BackendResult<bool> {
        let conn = self.conn.lock();
        Self::purge_expired(&conn)?;
        let removed = conn.execute("DELETE FROM kv_store WHERE key = ?1", params![key])?;
        Ok(removed > 0)
    }

    fn take(&self, key: &str) -> BackendResult<Option<Vec<u8>>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "DELETE FROM kv_store WHERE key = ?1 RETURNING value",
                params![key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn exists(&self, key: &str) -> BackendResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    fn keys(&self) -> BackendResult<Vec<String>> {
        let conn = self.conn.lock();
        Self::purge_expired(&conn)?;
        let mut stmt = conn.prepare("SELECT key FROM kv_store")?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    fn items(&self) -> BackendResult<Vec<(String, Vec<u8>)>> {
        let conn = self.conn.lock();
        Self::purge_expired(&conn)?;
        let mut stmt = conn.prepare("SELECT key, value FROM kv_store")?;
        let items = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    fn len(&self) -> BackendResult<usize> {
        let conn = self.conn.lock();
        Self::purge_expired(&conn)?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM kv_store", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
