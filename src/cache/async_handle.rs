//! Async Cache Handle
//!
//! Async facade over [`LiveCache`]. Each call runs the synchronous
//! implementation on tokio's blocking pool, so both entry points share one
//! core and one set of invariants.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::cache::entry::EntryHooks;
use crate::cache::locks::LockOwner;
use crate::cache::stats::CacheStats;
use crate::cache::store::LiveCache;
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::events::{CallbackId, DispatchSnapshot, EventKind, Hook};

/// Async handle on a cache. Clones share one cache.
///
/// Tasks migrate between threads, so key locks taken through this handle
/// belong to the handle rather than a thread. Each clone is its own owner.
#[derive(Debug)]
pub struct AsyncLiveCache {
    inner: LiveCache,
    owner: LockOwner,
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CacheError::Internal(format!("cache task failed: {}", e)))?
}

impl AsyncLiveCache {
    pub fn new(config: CacheConfig) -> Result<Self> {
        LiveCache::new(config).map(Self::from)
    }

    /// The synchronous handle on the same cache.
    pub fn sync(&self) -> &LiveCache {
        &self.inner
    }

    pub async fn set<V>(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) -> Result<()>
    where
        V: Serialize + Send + 'static,
    {
        let cache = self.inner.clone();
        let key = key.into();
        blocking(move || cache.set(&key, &value, ttl)).await
    }

    pub async fn set_with_hooks<V>(
        &self,
        key: impl Into<String>,
        value: V,
        ttl: Option<Duration>,
        hooks: EntryHooks,
    ) -> Result<()>
    where
        V: Serialize + Send + 'static,
    {
        let cache = self.inner.clone();
        let key = key.into();
        blocking(move || cache.set_with_hooks(&key, &value, ttl, hooks)).await
    }

    pub async fn get<V>(&self, key: impl Into<String>) -> Result<Option<V>>
    where
        V: DeserializeOwned + Send + 'static,
    {
        let cache = self.inner.clone();
        let key = key.into();
        blocking(move || cache.get(&key)).await
    }

    pub async fn get_or<V>(&self, key: impl Into<String>, default: V) -> Result<V>
    where
        V: DeserializeOwned + Send + 'static,
    {
        Ok(self.get(key).await?.unwrap_or(default))
    }

    pub async fn delete(&self, key: impl Into<String>) -> Result<bool> {
        let cache = self.inner.clone();
        let key = key.into();
        blocking(move || cache.delete(&key)).await
    }

    pub async fn exists(&self, key: impl Into<String>) -> Result<bool> {
        let cache = self.inner.clone();
        let key = key.into();
        blocking(move || cache.exists(&key)).await
    }

    pub async fn keys(&self) -> Result<Vec<String>> {
        let cache = self.inner.clone();
        blocking(move || cache.keys()).await
    }

    pub async fn items<V>(&self) -> Result<Vec<(String, V)>>
    where
        V: DeserializeOwned + Send + 'static,
    {
        let cache = self.inner.clone();
        blocking(move || cache.items()).await
    }

    pub async fn len(&self) -> Result<usize> {
        let cache = self.inner.clone();
        blocking(move || cache.len()).await
    }

    /// Waits for the per-key lock without tying up a runtime worker.
    pub async fn lock(&self, key: impl Into<String>, timeout: Option<Duration>) -> Result<()> {
        let cache = self.inner.clone();
        let owner = self.owner;
        let key = key.into();
        blocking(move || cache.lock_as(owner, &key, timeout)).await
    }

    /// Releases one hold taken through this handle.
    pub fn unlock(&self, key: &str) -> bool {
        self.inner.unlock_as(self.owner, key)
    }

    pub fn register(
        &self,
        event: EventKind,
        hook: Hook,
        key: Option<&str>,
        timeout: Option<Duration>,
    ) -> CallbackId {
        self.inner.register(event, hook, key, timeout)
    }

    pub fn unregister(&self, id: CallbackId) -> bool {
        self.inner.unregister(id)
    }

    pub fn set_callback_enabled(&self, id: CallbackId, enabled: bool) -> bool {
        self.inner.set_callback_enabled(id, enabled)
    }

    pub fn rotate_key(&self, key: &[u8]) -> Result<()> {
        self.inner.rotate_key(key)
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        let cache = self.inner.clone();
        blocking(move || cache.stats()).await
    }

    pub fn dispatch_stats(&self) -> DispatchSnapshot {
        self.inner.dispatch_stats()
    }

    /// Stops scheduler and dispatch; joins the expiry worker off the runtime.
    pub async fn stop(&self) -> Result<()> {
        let cache = self.inner.clone();
        blocking(move || {
            cache.stop();
            Ok(())
        })
        .await
    }
}

impl Clone for AsyncLiveCache {
    fn clone(&self) -> Self {
        Self::from(self.inner.clone())
    }
}

impl From<LiveCache> for AsyncLiveCache {
    fn from(inner: LiveCache) -> Self {
        Self {
            inner,
            owner: LockOwner::unique(),
        }
    }
}
