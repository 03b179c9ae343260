//! Cache Store Module
//!
//! Main cache engine: encrypts values into the backend, keeps the expiry
//! scheduler in step with every write, and raises events for hooks.
//!
//! Every mutation of backend and scheduler state runs under one store-wide
//! lock, so a `set` racing with the expiry of the same key always wins.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::backend::{Backend, MemoryBackend};
use crate::cache::entry::EntryHooks;
use crate::cache::locks::{KeyGuard, KeyLockTable, LockOwner};
use crate::cache::stats::{CacheCounters, CacheStats};
use crate::codec::Codec;
use crate::config::{AccessPolicy, CacheConfig, Operation};
use crate::crypto::Keyring;
use crate::error::{CacheError, Result};
use crate::events::{
    CallbackId, DispatchSnapshot, DispatcherOptions, EventDispatcher, EventKind, Hook,
};
use crate::sandbox::Sandbox;
use crate::tasks::{Expiry, ExpiryScheduler};

// == Store Lock ==
/// Store-wide mutation lock; a no-op when the caller guarantees
/// single-threaded use.
enum StoreLock {
    Exclusive(Mutex<()>),
    Disabled,
}

impl StoreLock {
    fn new(enabled: bool) -> Self {
        if enabled {
            StoreLock::Exclusive(Mutex::new(()))
        } else {
            StoreLock::Disabled
        }
    }

    fn acquire(&self) -> Option<MutexGuard<'_, ()>> {
        match self {
            StoreLock::Exclusive(lock) => Some(lock.lock()),
            StoreLock::Disabled => None,
        }
    }
}

// == Cache Core ==
/// State shared by every handle on one cache.
struct CacheCore {
    backend: Arc<dyn Backend>,
    keyring: RwLock<Keyring>,
    codec: Codec,
    default_ttl: Option<Duration>,
    store_lock: StoreLock,
    scheduler: ExpiryScheduler,
    dispatcher: EventDispatcher,
    key_locks: KeyLockTable,
    /// Callback ids registered through `set_with_hooks`, per key
    entry_hooks: Mutex<HashMap<String, Vec<CallbackId>>>,
    counters: CacheCounters,
    access_policy: Option<AccessPolicy>,
    sandbox: Sandbox,
    stopped: AtomicBool,
}

impl CacheCore {
    fn authorize(&self, op: Operation, key: &str) -> Result<()> {
        match &self.access_policy {
            Some(policy) if !policy(op, key) => {
                warn!(op = op.as_str(), key, "operation denied by access policy");
                Err(CacheError::PermissionDenied {
                    op: op.as_str(),
                    key: key.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Decrypts a stored blob and decodes it for a hook payload.
    fn event_value(&self, blob: &[u8]) -> Option<Value> {
        let plaintext = self.keyring.read().decrypt(blob).ok()?;
        self.codec.decode(&plaintext).ok()
    }

    /// Unregisters the hooks bound to the current entry of `key`.
    fn drop_entry_hooks(&self, key: &str) {
        let ids = self.entry_hooks.lock().remove(key);
        for id in ids.into_iter().flatten() {
            self.dispatcher.unregister(id);
        }
    }

    fn bind_entry_hooks(&self, key: &str, hooks: EntryHooks) {
        let mut ids = Vec::new();
        if let Some(hook) = hooks.on_access {
            ids.push(self.dispatcher.register(EventKind::Get, hook, Some(key), None));
        }
        if let Some(hook) = hooks.on_expire {
            ids.push(self.dispatcher.register(EventKind::Expire, hook, Some(key), None));
        }
        if !ids.is_empty() {
            self.entry_hooks.lock().insert(key.to_string(), ids);
        }
    }

    // == Store ==
    fn store(
        &self,
        key: &str,
        ciphertext: Vec<u8>,
        ttl: Option<Duration>,
        payload: Option<Value>,
        hooks: Option<EntryHooks>,
    ) -> Result<()> {
        let ttl = ttl.or(self.default_ttl);
        let _guard = self.store_lock.acquire();

        // A failed write leaves the scheduler untouched
        self.backend.set(key, ciphertext, ttl)?;
        match ttl {
            Some(ttl) => {
                self.scheduler.schedule(key, Instant::now() + ttl);
            }
            None => {
                self.scheduler.cancel(key);
            }
        }

        self.drop_entry_hooks(key);
        if let Some(hooks) = hooks {
            self.bind_entry_hooks(key, hooks);
        }

        self.counters.record_set();
        self.dispatcher.trigger(EventKind::Set, key, payload);
        Ok(())
    }

    // == Self Heal ==
    /// Deletes an entry that failed authentication, unless a concurrent
    /// `set` already replaced it.
    fn discard_unreadable(&self, key: &str, blob: &[u8]) -> Result<()> {
        let _guard = self.store_lock.acquire();
        if self.backend.get(key)?.as_deref() != Some(blob) {
            return Ok(());
        }
        self.backend.delete(key)?;
        self.scheduler.cancel(key);
        self.drop_entry_hooks(key);
        self.counters.record_auth_failure();
        warn!(key, "entry failed authentication and was removed");
        Ok(())
    }

    // == Expire ==
    /// Runs on the scheduler thread for every due node.
    fn handle_expiry(&self, expiry: Expiry) {
        let key = expiry.key.as_str();
        let _guard = self.store_lock.acquire();
        if !self.scheduler.retire(key, expiry.generation) {
            // Superseded between firing and taking the store lock
            return;
        }

        // A backend that evicts on its own TTL may have dropped the data already
        let payload = match self.backend.take(key) {
            Ok(Some(blob)) if self.dispatcher.has_listeners(EventKind::Expire, key) => {
                self.event_value(&blob)
            }
            Ok(_) => None,
            Err(err) => {
                warn!(key, error = %err, "failed to remove expired entry");
                None
            }
        };

        self.counters.record_expiration();
        debug!(key, "entry expired");
        self.dispatcher.trigger(EventKind::Expire, key, payload);
        self.drop_entry_hooks(key);
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.scheduler.stop();
        self.dispatcher.stop();
        info!("cache stopped");
    }
}

impl Drop for CacheCore {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Serializes a value for hook payloads; hooks see JSON whatever the codec.
fn json_payload<V: Serialize + ?Sized>(key: &str, value: &V) -> Option<Value> {
    match serde_json::to_value(value) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(key, error = %err, "value has no JSON form, event sent without payload");
            None
        }
    }
}

// == Live Cache ==
/// Thread-safe encrypted cache handle. Clones share one cache.
#[derive(Clone)]
pub struct LiveCache {
    core: Arc<CacheCore>,
}

impl LiveCache {
    // == Constructor ==
    /// Creates a cache over an in-memory backend.
    pub fn new(config: CacheConfig) -> Result<Self> {
        Self::with_backend(config, MemoryBackend::new())
    }

    /// Creates a cache over the given backend.
    ///
    /// # Arguments
    /// * `config` - Validated before anything is started
    /// * `backend` - Storage for the encrypted blobs
    ///
    /// # Returns
    /// `Configuration` on invalid parameters or bad key material.
    pub fn with_backend<B: Backend + 'static>(config: CacheConfig, backend: B) -> Result<Self> {
        config.validate()?;
        let keyring = if config.encryption_keys.is_empty() {
            Keyring::generate()?
        } else {
            Keyring::new(&config.encryption_keys)?
        };

        let sandbox = Sandbox::detect(config.isolation, config.memory_limit);
        let dispatcher = EventDispatcher::new(DispatcherOptions {
            workers: config.dispatch_workers,
            default_timeout: config.hook_timeout,
            sandbox,
            sandbox_hooks: config.sandbox_hooks,
        })?;

        let core = Arc::new(CacheCore {
            backend: Arc::new(backend),
            keyring: RwLock::new(keyring),
            codec: config.codec,
            default_ttl: config.default_ttl,
            store_lock: StoreLock::new(config.prevent_race_condition),
            scheduler: ExpiryScheduler::new(),
            dispatcher,
            key_locks: KeyLockTable::new(),
            entry_hooks: Mutex::new(HashMap::new()),
            counters: CacheCounters::default(),
            access_policy: config.access_policy,
            sandbox,
            stopped: AtomicBool::new(false),
        });

        // The worker must not keep the core alive
        let weak: Weak<CacheCore> = Arc::downgrade(&core);
        core.scheduler.start(Box::new(move |expiry| {
            if let Some(core) = weak.upgrade() {
                core.handle_expiry(expiry);
            }
        }))?;

        info!(codec = %config.codec, sandbox = %sandbox, "cache started");
        Ok(Self { core })
    }

    // == Set ==
    /// Stores a value, replacing any previous entry for `key`.
    ///
    /// # Arguments
    /// * `key` - The key to store
    /// * `value` - Any serializable value
    /// * `ttl` - Time to live; falls back to the configured default. With
    ///   neither, a pending expiry from an earlier `set` is cleared.
    pub fn set<V: Serialize + ?Sized>(&self, key: &str, value: &V, ttl: Option<Duration>) -> Result<()> {
        self.set_entry(key, value, ttl, None)
    }

    /// Stores a value with hooks bound to this entry only.
    pub fn set_with_hooks<V: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &V,
        ttl: Option<Duration>,
        hooks: EntryHooks,
    ) -> Result<()> {
        self.set_entry(key, value, ttl, Some(hooks))
    }

    fn set_entry<V: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &V,
        ttl: Option<Duration>,
        hooks: Option<EntryHooks>,
    ) -> Result<()> {
        let core = &self.core;
        core.authorize(Operation::Set, key)?;

        let plaintext = core.codec.encode(value)?;
        let ciphertext = core.keyring.read().encrypt(&plaintext)?;
        let payload = if core.dispatcher.has_listeners(EventKind::Set, key) {
            json_payload(key, value)
        } else {
            None
        };

        core.store(key, ciphertext, ttl, payload, hooks)
    }

    // == Get ==
    /// Retrieves a value by key.
    ///
    /// An entry that fails authentication (foreign or corrupted data) is
    /// deleted and reported as absent.
    pub fn get<V: DeserializeOwned>(&self, key: &str) -> Result<Option<V>> {
        let core = &self.core;
        core.authorize(Operation::Get, key)?;

        let blob = match core.backend.get(key)? {
            Some(blob) => blob,
            None => {
                core.counters.record_miss();
                return Ok(None);
            }
        };

        let decrypted = core.keyring.read().decrypt(&blob);
        let plaintext = match decrypted {
            Ok(plaintext) => plaintext,
            Err(CacheError::AuthFailure) => {
                core.discard_unreadable(key, &blob)?;
                core.counters.record_miss();
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        let value = core.codec.decode(&plaintext)?;
        core.counters.record_hit();
        if core.dispatcher.has_listeners(EventKind::Get, key) {
            let payload = core.codec.decode::<Value>(&plaintext).ok();
            core.dispatcher.trigger(EventKind::Get, key, payload);
        }
        Ok(Some(value))
    }

    /// Retrieves a value, or `default` when absent.
    pub fn get_or<V: DeserializeOwned>(&self, key: &str, default: V) -> Result<V> {
        Ok(self.get(key)?.unwrap_or(default))
    }

    // == Delete ==
    /// Removes an entry by key.
    ///
    /// # Returns
    /// `false` for a missing key; no event is raised in that case.
    pub fn delete(&self, key: &str) -> Result<bool> {
        let core = &self.core;
        core.authorize(Operation::Delete, key)?;

        let _guard = core.store_lock.acquire();
        let blob = match core.backend.get(key)? {
            Some(blob) => blob,
            None => return Ok(false),
        };
        let payload = if core.dispatcher.has_listeners(EventKind::Delete, key) {
            core.event_value(&blob)
        } else {
            None
        };

        let removed = core.backend.delete(key)?;
        core.scheduler.cancel(key);
        if removed {
            core.counters.record_delete();
            core.dispatcher.trigger(EventKind::Delete, key, payload);
        }
        core.drop_entry_hooks(key);
        Ok(removed)
    }

    // == Queries ==
    pub fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.core.backend.exists(key)?)
    }

    /// Same as [`exists`](Self::exists).
    pub fn contains(&self, key: &str) -> Result<bool> {
        self.exists(key)
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        Ok(self.core.backend.keys()?)
    }

    /// Decrypted live entries. Entries that cannot be decrypted or decoded
    /// as `V` are skipped.
    pub fn items<V: DeserializeOwned>(&self) -> Result<Vec<(String, V)>> {
        let core = &self.core;
        let keyring = core.keyring.read();
        let items = core
            .backend
            .items()?
            .into_iter()
            .filter_map(|(key, blob)| {
                let value = keyring
                    .decrypt(&blob)
                    .and_then(|plaintext| core.codec.decode(&plaintext));
                match value {
                    Ok(value) => Some((key, value)),
                    Err(err) => {
                        debug!(key = %key, error = %err, "skipping unreadable entry");
                        None
                    }
                }
            })
            .collect();
        Ok(items)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.core.backend.len()?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// True while `key` has a pending expiry.
    pub fn has_pending_expiry(&self, key: &str) -> bool {
        self.core.scheduler.is_scheduled(key)
    }

    // == Key Locks ==
    /// Acquires the per-key lock for the calling thread, waiting at most
    /// `timeout`. Reentrant: a thread may lock a key it already holds.
    ///
    /// Independent of the internal locking of `set`/`get`/`delete`.
    pub fn lock(&self, key: &str, timeout: Option<Duration>) -> Result<()> {
        self.core.key_locks.lock(key, timeout)
    }

    /// Releases one hold of the per-key lock. Returns false if the calling
    /// thread does not hold it.
    pub fn unlock(&self, key: &str) -> bool {
        self.core.key_locks.unlock(key)
    }

    pub(crate) fn lock_as(&self, owner: LockOwner, key: &str, timeout: Option<Duration>) -> Result<()> {
        self.core.key_locks.lock_as(owner, key, timeout)
    }

    pub(crate) fn unlock_as(&self, owner: LockOwner, key: &str) -> bool {
        self.core.key_locks.unlock_as(owner, key)
    }

    /// Acquires the per-key lock for the lifetime of the returned guard.
    pub fn lock_guard(&self, key: &str, timeout: Option<Duration>) -> Result<KeyGuard<'_>> {
        self.core.key_locks.guard(key, timeout)
    }

    // == Hooks ==
    /// Registers a hook for `event` on `key`, or on every key when `None`.
    ///
    /// `timeout` overrides the configured hook timeout.
    pub fn register(
        &self,
        event: EventKind,
        hook: Hook,
        key: Option<&str>,
        timeout: Option<Duration>,
    ) -> CallbackId {
        self.core.dispatcher.register(event, hook, key, timeout)
    }

    pub fn unregister(&self, id: CallbackId) -> bool {
        self.core.dispatcher.unregister(id)
    }

    /// Enables or disables a hook without unregistering it.
    pub fn set_callback_enabled(&self, id: CallbackId, enabled: bool) -> bool {
        self.core.dispatcher.set_enabled(id, enabled)
    }

    // == Keys ==
    /// Adds a new encryption key and makes it current. Existing entries stay
    /// readable through the older keys.
    pub fn rotate_key(&self, key: &[u8]) -> Result<()> {
        let mut keyring = self.core.keyring.write();
        keyring.rotate(key)?;
        info!(keys = keyring.len(), "encryption key rotated");
        Ok(())
    }

    /// Drops all but the newest `keep` keys. Returns how many were removed.
    pub fn prune_keys(&self, keep: usize) -> usize {
        let removed = self.core.keyring.write().prune(keep);
        if removed > 0 {
            info!(removed, "old encryption keys pruned");
        }
        removed
    }

    pub fn key_count(&self) -> usize {
        self.core.keyring.read().len()
    }

    // == Stats ==
    pub fn stats(&self) -> Result<CacheStats> {
        let total = self.core.backend.len()?;
        Ok(self.core.counters.snapshot(total))
    }

    /// Hook outcome counters, including sandbox timeouts.
    pub fn dispatch_stats(&self) -> DispatchSnapshot {
        self.core.dispatcher.stats()
    }

    pub fn sandbox(&self) -> Sandbox {
        self.core.sandbox
    }

    // == Stop ==
    /// Stops the expiry scheduler and hook dispatch.
    ///
    /// Store operations keep working afterwards, without expiry or events.
    /// Idempotent; also runs when the last handle is dropped.
    pub fn stop(&self) {
        self.core.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.core.stopped.load(Ordering::Acquire)
    }
}

impl fmt::Debug for LiveCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveCache")
            .field("codec", &self.core.codec)
            .field("sandbox", &self.core.sandbox)
            .field("keys", &self.key_count())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
