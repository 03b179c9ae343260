//! Key-Lock Table
//!
//! Per-key mutual exclusion for caller-composed critical sections such as
//! read-modify-write. Never taken internally by `set`/`get`/`delete`.
//!
//! Locks are reentrant and owned: the owner may acquire a key it already
//! holds, and must release it as many times as it acquired it. A release
//! from anyone else is ignored.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::error::{CacheError, Result};

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

// == Lock Owner ==
/// Identity a key lock is held under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockOwner {
    /// The calling OS thread; used by the synchronous API
    Thread(ThreadId),
    /// A handle-scoped identity, for callers that hop between threads
    Handle(u64),
}

impl LockOwner {
    pub fn current_thread() -> Self {
        LockOwner::Thread(thread::current().id())
    }

    /// A fresh identity no other owner shares.
    pub fn unique() -> Self {
        LockOwner::Handle(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug)]
struct Hold {
    owner: LockOwner,
    depth: usize,
}

/// Takes `key` for `owner` if it is free or already theirs.
fn try_acquire(held: &mut HashMap<String, Hold>, key: &str, owner: LockOwner) -> bool {
    match held.get_mut(key) {
        Some(hold) if hold.owner == owner => {
            hold.depth += 1;
            true
        }
        Some(_) => false,
        None => {
            held.insert(key.to_string(), Hold { owner, depth: 1 });
            true
        }
    }
}

// == Key Lock Table ==
/// Held keys with their owner and hold depth; waiters park on one condvar.
#[derive(Debug, Default)]
pub struct KeyLockTable {
    held: Mutex<HashMap<String, Hold>>,
    released: Condvar,
}

impl KeyLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    // == Lock ==
    /// Acquires `key` for the calling thread, waiting at most `timeout`
    /// (forever when `None`).
    ///
    /// # Returns
    /// `LockTimeout` if another owner still held the key at the deadline.
    pub fn lock(&self, key: &str, timeout: Option<Duration>) -> Result<()> {
        self.lock_as(LockOwner::current_thread(), key, timeout)
    }

    /// Acquires `key` for an explicit owner.
    pub fn lock_as(&self, owner: LockOwner, key: &str, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut held = self.held.lock();
        loop {
            if try_acquire(&mut held, key, owner) {
                return Ok(());
            }
            match deadline {
                Some(deadline) => {
                    if self.released.wait_until(&mut held, deadline).timed_out() {
                        if try_acquire(&mut held, key, owner) {
                            return Ok(());
                        }
                        warn!(key, "lock acquisition timed out");
                        return Err(CacheError::LockTimeout(key.to_string()));
                    }
                }
                None => self.released.wait(&mut held),
            }
        }
    }

    // == Unlock ==
    /// Releases one hold of `key` by the calling thread.
    ///
    /// Returns false if the calling thread does not hold it.
    pub fn unlock(&self, key: &str) -> bool {
        self.unlock_as(LockOwner::current_thread(), key)
    }

    pub fn unlock_as(&self, owner: LockOwner, key: &str) -> bool {
        let mut held = self.held.lock();
        match held.get_mut(key) {
            Some(hold) if hold.owner == owner => {
                hold.depth -= 1;
                if hold.depth == 0 {
                    held.remove(key);
                    self.released.notify_all();
                }
                true
            }
            Some(_) => {
                debug!(key, ?owner, "release by non-owner ignored");
                false
            }
            None => false,
        }
    }

    /// Acquires `key` for the calling thread and returns a guard that
    /// releases it on drop.
    pub fn guard(&self, key: &str, timeout: Option<Duration>) -> Result<KeyGuard<'_>> {
        let owner = LockOwner::current_thread();
        self.lock_as(owner, key, timeout)?;
        Ok(KeyGuard {
            table: self,
            owner,
            key: key.to_string(),
        })
    }
}

// == Key Guard ==
/// Holds one acquisition of a per-key lock until dropped.
#[derive(Debug)]
pub struct KeyGuard<'a> {
    table: &'a KeyLockTable,
    owner: LockOwner,
    key: String,
}

impl KeyGuard<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.table.unlock_as(self.owner, &self.key);
    }
}
