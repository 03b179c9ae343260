//! Backend Module
//!
//! Pluggable storage for opaque ciphertext blobs. The cache core only talks
//! to storage through the [`Backend`] trait.
//!
//! Backends may keep their own TTL bookkeeping and physically drop expired
//! data; the cache's expiry scheduler still decides when `expire` events fire.

mod entry;
mod memory;
#[cfg(feature = "redis")]
mod redis;
mod sqlite;

use std::sync::Arc;
use std::time::Duration;

use crate::error::BackendError;

use entry::StoredEntry;
pub use memory::MemoryBackend;
#[cfg(feature = "redis")]
pub use self::redis::RedisBackend;
pub use sqlite::SqliteBackend;

/// Result type returned by backends.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

// == Backend Trait ==
/// Key/value storage contract consumed by the cache core.
pub trait Backend: Send + Sync {
    /// Stores a blob, replacing any previous one. `ttl` lets the backend
    /// expire the blob on its own.
    fn set(&self, key: &str, ciphertext: Vec<u8>, ttl: Option<Duration>) -> BackendResult<()>;

    /// Returns the blob, or `None` if absent or expired by the backend.
    fn get(&self, key: &str) -> BackendResult<Option<Vec<u8>>>;

    /// Removes a blob. Returns whether it existed.
    fn delete(&self, key: &str) -> BackendResult<bool>;

    /// Removes a blob and returns it, even if the backend already counts it
    /// as expired. Used when the scheduler retires an entry.
    fn take(&self, key: &str) -> BackendResult<Option<Vec<u8>>> {
        let blob = self.get(key)?;
        self.delete(key)?;
        Ok(blob)
    }

    fn exists(&self, key: &str) -> BackendResult<bool>;

    /// Live keys; never includes entries the backend considers expired.
    fn keys(&self) -> BackendResult<Vec<String>>;

    /// Live key/blob pairs; never includes expired entries.
    fn items(&self) -> BackendResult<Vec<(String, Vec<u8>)>>;

    fn len(&self) -> BackendResult<usize> {
        Ok(self.keys()?.len())
    }
}

impl<B: Backend + ?Sized> Backend for Arc<B> {
    fn set(&self, key: &str, ciphertext: Vec<u8>, ttl: Option<Duration>) -> BackendResult<()> {
        (**self).set(key, ciphertext, ttl)
    }

    fn get(&self, key: &str) -> BackendResult<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn delete(&self, key: &str) -> BackendResult<bool> {
        (**self).delete(key)
    }

    fn take(&self, key: &str) -> BackendResult<Option<Vec<u8>>> {
        (**self).take(key)
    }

    fn exists(&self, key: &str) -> BackendResult<bool> {
        (**self).exists(key)
    }

    fn keys(&self) -> BackendResult<Vec<String>> {
        (**self).keys()
    }

    fn items(&self) -> BackendResult<Vec<(String, Vec<u8>)>> {
        (**self).items()
    }

    fn len(&self) -> BackendResult<usize> {
        (**self).len()
    }
}
