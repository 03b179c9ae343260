//! Event Dispatcher
//!
//! Routes triggered events to their enabled hooks, off the caller's thread.
//!
//! Events are queued to one of `workers` shards picked by key hash. A shard
//! never waits on hooks: it chains each event behind the previous event of
//! the same key, so one key's events run in trigger order while a slow hook
//! holds back nothing but later events on its own key.
//!
//! Every hook of an event runs as its own task: blocking hooks go through
//! the sandbox on tokio's blocking pool, gated by a semaphore; async hooks
//! run on the runtime under a deadline.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::hook::{CallbackEntry, CallbackId, EventKind, Hook};
use super::registry::{CallbackRegistry, Scope};
use super::stats::{DispatchSnapshot, DispatchStats};
use crate::error::{CacheError, Result, SandboxError};
use crate::sandbox::{self, Sandbox};

/// One triggered event with the hooks gathered for it.
struct EventJob {
    event: EventKind,
    key: String,
    value: Option<Value>,
    entries: Vec<Arc<CallbackEntry>>,
}

/// State shared by the shard tasks.
struct DispatchContext {
    sandbox: Sandbox,
    sandbox_hooks: bool,
    permits: Arc<Semaphore>,
    stats: DispatchStats,
}

/// Dispatcher settings, taken from the cache configuration.
#[derive(Debug, Clone, Copy)]
pub struct DispatcherOptions {
    pub workers: usize,
    pub default_timeout: Duration,
    pub sandbox: Sandbox,
    pub sandbox_hooks: bool,
}

// == Event Dispatcher ==
pub struct EventDispatcher {
    registry: CallbackRegistry,
    shards: Vec<mpsc::UnboundedSender<EventJob>>,
    runtime: Mutex<Option<Runtime>>,
    context: Arc<DispatchContext>,
    default_timeout: Duration,
    stopped: AtomicBool,
}

impl EventDispatcher {
    // == Constructor ==
    /// Starts the dispatch runtime and its shard tasks.
    pub fn new(options: DispatcherOptions) -> Result<Self> {
        let workers = options.workers.max(1);
        let runtime = Builder::new_multi_thread()
            .worker_threads(workers)
            .thread_name("livecache-hook")
            .enable_all()
            .build()
            .map_err(|e| {
                CacheError::Configuration(format!("failed to start dispatch runtime: {}", e))
            })?;

        let context = Arc::new(DispatchContext {
            sandbox: options.sandbox,
            sandbox_hooks: options.sandbox_hooks,
            permits: Arc::new(Semaphore::new(workers)),
            stats: DispatchStats::new(),
        });

        let shards = (0..workers)
            .map(|_| {
                let (tx, rx) = mpsc::unbounded_channel();
                runtime.spawn(run_shard(rx, context.clone()));
                tx
            })
            .collect();

        info!(workers, sandbox = %options.sandbox, "event dispatcher started");
        Ok(Self {
            registry: CallbackRegistry::new(),
            shards,
            runtime: Mutex::new(Some(runtime)),
            context,
            default_timeout: options.default_timeout,
            stopped: AtomicBool::new(false),
        })
    }

    // == Registration ==
    /// Registers a hook for `event`, scoped to `key` or global when `None`.
    ///
    /// `timeout` falls back to the configured hook timeout.
    pub fn register(
        &self,
        event: EventKind,
        hook: Hook,
        key: Option<&str>,
        timeout: Option<Duration>,
    ) -> CallbackId {
        let entry = CallbackEntry::new(hook, timeout.unwrap_or(self.default_timeout));
        let id = self
            .registry
            .insert(event, Scope::from_key(key), entry);
        debug!(callback = %id, %event, key = key.unwrap_or("*"), "hook registered");
        id
    }

    pub fn unregister(&self, id: CallbackId) -> bool {
        self.registry.remove(id)
    }

    pub fn set_enabled(&self, id: CallbackId, enabled: bool) -> bool {
        self.registry.set_enabled(id, enabled)
    }

    /// True if triggering `event` on `key` would run at least one hook.
    pub fn has_listeners(&self, event: EventKind, key: &str) -> bool {
        !self.is_stopped() && !self.registry.gather(event, key).is_empty()
    }

    // == Trigger ==
    /// Queues `event` for every enabled hook scoped to `key` or global.
    ///
    /// Never blocks on hook execution. A no-op after [`stop`](Self::stop).
    pub fn trigger(&self, event: EventKind, key: &str, value: Option<Value>) {
        if self.is_stopped() {
            return;
        }
        let entries = self.registry.gather(event, key);
        if entries.is_empty() {
            return;
        }

        let shard = shard_for(key, self.shards.len());
        let job = EventJob {
            event,
            key: key.to_string(),
            value,
            entries,
        };
        if self.shards[shard].send(job).is_err() {
            debug!(%event, key, "dispatch shard closed, event dropped");
        }
    }

    pub fn stats(&self) -> DispatchSnapshot {
        self.context.stats.snapshot()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    // == Stop ==
    /// Shuts the runtime down without waiting for in-flight hooks.
    ///
    /// Abandoned sandbox threads keep running until their hook returns.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
        info!("event dispatcher stopped");
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn shard_for(key: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

async fn run_shard(mut rx: mpsc::UnboundedReceiver<EventJob>, context: Arc<DispatchContext>) {
    // Last queued event per key; the next event on that key waits for it
    let mut tails: HashMap<String, JoinHandle<()>> = HashMap::new();
    while let Some(job) = rx.recv().await {
        tails.retain(|_, tail| !tail.is_finished());
        let previous = tails.remove(&job.key);
        let key = job.key.clone();
        tails.insert(key, tokio::spawn(run_job(context.clone(), job, previous)));
    }
}

/// Runs every hook of `job` once the previous event on its key is done.
async fn run_job(context: Arc<DispatchContext>, job: EventJob, previous: Option<JoinHandle<()>>) {
    if let Some(previous) = previous {
        let _ = previous.await;
    }
    let runs: Vec<_> = job
        .entries
        .into_iter()
        .map(|entry| {
            tokio::spawn(run_entry(
                context.clone(),
                entry,
                job.event,
                job.key.clone(),
                job.value.clone(),
            ))
        })
        .collect();
    for run in runs {
        let _ = run.await;
    }
}

async fn run_entry(
    context: Arc<DispatchContext>,
    entry: Arc<CallbackEntry>,
    event: EventKind,
    key: String,
    value: Option<Value>,
) {
    // Disabled between trigger and execution
    if !entry.is_enabled() {
        return;
    }
    context.stats.record_dispatched();

    let outcome = match &entry.hook {
        Hook::Async(hook) => {
            let fut = hook(key.clone(), value);
            if context.sandbox_hooks {
                sandbox::run_async(fut, entry.timeout).await
            } else {
                fut.await.map_err(SandboxError::Failure)
            }
        }
        Hook::Blocking(hook) => {
            let permit = match context.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let hook = hook.clone();
            let hook_key = key.clone();
            let sandbox = context.sandbox;
            let sandboxed = context.sandbox_hooks;
            let timeout = entry.timeout;

            let joined = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                if sandboxed {
                    sandbox.run(move || hook(&hook_key, value.as_ref()), timeout)
                } else {
                    hook(&hook_key, value.as_ref()).map_err(SandboxError::Failure)
                }
            })
            .await;
            joined.unwrap_or_else(|e| Err(SandboxError::Failure(anyhow!("hook worker aborted: {}", e))))
        }
    };

    match outcome {
        Ok(()) => context.stats.record_success(),
        Err(SandboxError::Timeout(limit)) => {
            context.stats.record_timeout();
            warn!(callback = %entry.id, %event, key = %key, ?limit, "hook timed out");
        }
        Err(err) => {
            context.stats.record_failure();
            warn!(callback = %entry.id, %event, key = %key, error = %err, "hook failed");
        }
    }
}
