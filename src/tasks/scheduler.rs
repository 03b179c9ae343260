//! Expiry Scheduler
//!
//! Background worker that tracks `(expire_at, key)` nodes in a min-heap and
//! hands each due key to the cache's expiry handler.
//!
//! Cancellation is lazy: every `schedule` bumps the key's generation and
//! `cancel` forgets it, so superseded or cancelled nodes are discarded when
//! they surface at the top of the heap.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info};

use crate::error::{CacheError, Result};

/// A due key handed to the expiry handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expiry {
    pub key: String,
    /// Generation of the node that fired; see [`ExpiryScheduler::retire`]
    pub generation: u64,
}

/// Callback invoked by the worker, without the scheduler lock held.
pub type ExpiryHandler = Box<dyn Fn(Expiry) + Send + Sync>;

// == Heap Node ==
#[derive(Debug)]
struct HeapNode {
    expire_at: Instant,
    /// Insertion order, breaks ties between equal deadlines
    seq: u64,
    key: String,
    generation: u64,
}

impl PartialEq for HeapNode {
    fn eq(&self, other: &Self) -> bool {
        self.expire_at == other.expire_at && self.seq == other.seq
    }
}

impl Eq for HeapNode {}

impl PartialOrd for HeapNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapNode {
    // Reversed so BinaryHeap pops the earliest deadline first
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .expire_at
            .cmp(&self.expire_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
struct SchedulerState {
    heap: BinaryHeap<HeapNode>,
    /// Live generation per key; absent means cancelled or never scheduled
    live: HashMap<String, u64>,
    next_seq: u64,
    next_generation: u64,
    stopped: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<SchedulerState>,
    wakeup: Condvar,
}

// == Expiry Scheduler ==
/// Single background worker firing key expirations in deadline order.
#[derive(Debug, Default)]
pub struct ExpiryScheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: Mutex<Option<ThreadId>>,
}

impl ExpiryScheduler {
    /// Creates an idle scheduler; call [`start`](Self::start) to spawn the worker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns the worker thread.
    ///
    /// # Arguments
    /// * `handler` - Called for every node that is still live when due
    pub fn start(&self, handler: ExpiryHandler) -> Result<()> {
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("livecache-expiry".to_string())
            .spawn(move || run_worker(shared, handler))
            .map_err(|e| CacheError::Configuration(format!("failed to spawn expiry worker: {}", e)))?;

        *self.worker_id.lock() = Some(handle.thread().id());
        *self.worker.lock() = Some(handle);
        info!("expiry scheduler started");
        Ok(())
    }

    // == Schedule ==
    /// Schedules `key` to expire at `expire_at`, superseding any pending node.
    ///
    /// Returns the generation of the new node.
    pub fn schedule(&self, key: &str, expire_at: Instant) -> u64 {
        let mut state = self.shared.state.lock();
        state.next_generation += 1;
        state.next_seq += 1;
        let generation = state.next_generation;
        let seq = state.next_seq;

        let earliest = state
            .heap
            .peek()
            .map_or(true, |top| expire_at < top.expire_at);

        state.live.insert(key.to_string(), generation);
        state.heap.push(HeapNode {
            expire_at,
            seq,
            key: key.to_string(),
            generation,
        });

        if earliest {
            self.shared.wakeup.notify_one();
        }
        debug!(key, generation, "expiry scheduled");
        generation
    }

    // == Cancel ==
    /// Invalidates the pending node for `key`. Returns whether one existed.
    pub fn cancel(&self, key: &str) -> bool {
        let mut state = self.shared.state.lock();
        let cancelled = state.live.remove(key).is_some();
        if cancelled {
            self.shared.wakeup.notify_one();
            debug!(key, "expiry cancelled");
        }
        cancelled
    }

    // == Retire ==
    /// Consumes a fired node if it still governs `key`.
    ///
    /// The expiry handler calls this under the cache's store lock, so a
    /// `set` or `delete` racing with the firing wins.
    pub fn retire(&self, key: &str, generation: u64) -> bool {
        let mut state = self.shared.state.lock();
        if state.live.get(key) == Some(&generation) {
            state.live.remove(key);
            true
        } else {
            false
        }
    }

    /// True if `key` has a live pending expiry.
    pub fn is_scheduled(&self, key: &str) -> bool {
        self.shared.state.lock().live.contains_key(key)
    }

    // == Stop ==
    /// Signals the worker to exit and waits for it. No expiry fires afterwards.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            self.shared.wakeup.notify_all();
        }

        let handle = self.worker.lock().take();
        let on_worker = *self.worker_id.lock() == Some(thread::current().id());
        if let Some(handle) = handle {
            // Joining from the worker itself would deadlock
            if !on_worker && handle.join().is_err() {
                error!("expiry worker panicked");
            }
        }
        info!("expiry scheduler stopped");
    }
}

impl Drop for ExpiryScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(shared: Arc<Shared>, handler: ExpiryHandler) {
    let mut state = shared.state.lock();
    loop {
        if state.stopped {
            return;
        }

        let deadline = match state.heap.peek().map(|top| top.expire_at) {
            None => {
                shared.wakeup.wait(&mut state);
                continue;
            }
            Some(deadline) => deadline,
        };
        if deadline > Instant::now() {
            // Woken early by a new earliest node or stop: re-evaluate
            shared.wakeup.wait_until(&mut state, deadline);
            continue;
        }

        let node = match state.heap.pop() {
            Some(node) => node,
            None => continue,
        };
        if state.live.get(&node.key) != Some(&node.generation) {
            // Superseded or cancelled
            continue;
        }

        let expiry = Expiry {
            key: node.key,
            generation: node.generation,
        };
        MutexGuard::unlocked(&mut state, || {
            if panic::catch_unwind(AssertUnwindSafe(|| handler(expiry))).is_err() {
                error!("expiry handler panicked");
            }
        });
    }
}
