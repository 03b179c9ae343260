//! Redis backend
//!
//! Stores blobs as plain Redis strings. A TTL maps onto `SET ... PX`, so the
//! server evicts expired blobs on its own.

use std::time::Duration;

use ::redis::{Client, Connection};
use parking_lot::Mutex;
use tracing::debug;

use super::{Backend, BackendResult};

/// Backend over one synchronous Redis connection.
pub struct RedisBackend {
    conn: Mutex<Connection>,
}

impl RedisBackend {
    /// Connects to the server at `url`, e.g. `redis://127.0.0.1/0`.
    pub fn open(url: &str) -> BackendResult<Self> {
        debug!(url, "opening redis backend");
        Self::from_client(&Client::open(url)?)
    }

    pub fn from_client(client: &Client) -> BackendResult<Self> {
        Ok(Self {
            conn: Mutex::new(client.get_connection()?),
        })
    }
}

impl Backend for RedisBackend {
    fn set(&self, key: &str, ciphertext: Vec<u8>, ttl: Option<Duration>) -> BackendResult<()> {
        let mut cmd = ::redis::cmd("SET");
        cmd.arg(key).arg(ciphertext);
        if let Some(ttl) = ttl {
            // PX rejects zero
            cmd.arg("PX").arg((ttl.as_millis() as u64).max(1));
        }
        cmd.query::<()>(&mut *self.conn.lock())?;
        Ok(())
    }

    fn get(&self, key: &str) -> BackendResult<Option<Vec<u8>>> {
        Ok(::redis::cmd("GET")
            .arg(key)
            .query(&mut *self.conn.lock())?)
    }

    fn delete(&self, key: &str) -> BackendResult<bool> {
        let removed: i64 = ::redis::cmd("DEL").arg(key).query(&mut *self.conn.lock())?;
        Ok(removed > 0)
    }

    fn take(&self, key: &str) -> BackendResult<Option<Vec<u8>>> {
        let (blob,): (Option<Vec<u8>>,) = ::redis::pipe()
            .atomic()
            .cmd("GET")
            .arg(key)
            .cmd("DEL")
            .arg(key)
            .ignore()
            .query(&mut *self.conn.lock())?;
        Ok(blob)
    }

    fn exists(&self, key: &str) -> BackendResult<bool> {
        let found: i64 = ::redis::cmd("EXISTS").arg(key).query(&mut *self.conn.lock())?;
        Ok(found > 0)
    }

    fn keys(&self) -> BackendResult<Vec<String>> {
        Ok(::redis::cmd("KEYS").arg("*").query(&mut *self.conn.lock())?)
    }

    fn items(&self) -> BackendResult<Vec<(String, Vec<u8>)>> {
        let mut conn = self.conn.lock();
        let keys: Vec<String> = ::redis::cmd("KEYS").arg("*").query(&mut *conn)?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let blobs: Vec<Option<Vec<u8>>> = ::redis::cmd("MGET").arg(&keys).query(&mut *conn)?;
        // A key can expire between KEYS and MGET
        Ok(keys
            .into_iter()
            .zip(blobs)
            .filter_map(|(key, blob)| blob.map(|blob| (key, blob)))
            .collect())
    }

    fn len(&self) -> BackendResult<usize> {
        Ok(::redis::cmd("DBSIZE").query(&mut *self.conn.lock())?)
    }
}
