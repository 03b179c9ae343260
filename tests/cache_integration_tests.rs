//! Integration Tests for the Cache
//!
//! Exercises the public API end to end: storage, expiry, hooks under both
//! isolation strategies, key rotation, key locks and the SQLite backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, sleep};
use std::time::{Duration, Instant};

use livecache::backend::BackendResult;
use livecache::{
    AsyncLiveCache, Backend, BackendError, CacheConfig, CacheError, Codec, EntryHooks, EventKind,
    Hook, IsolationMode, Keyring, LiveCache, MemoryBackend, Operation, SqliteBackend,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// == Helper Functions ==

fn thread_config() -> CacheConfig {
    CacheConfig::new()
        .isolation(IsolationMode::Thread)
        .dispatch_workers(4)
}

fn create_test_cache() -> LiveCache {
    LiveCache::new(thread_config()).unwrap()
}

/// Polls until `completed` hook runs have reached an outcome.
fn wait_for_hooks(cache: &LiveCache, completed: u64, limit: Duration) {
    let deadline = Instant::now() + limit;
    while cache.dispatch_stats().completed() < completed && Instant::now() < deadline {
        sleep(Duration::from_millis(10));
    }
}

fn counting_hook(counter: Arc<AtomicUsize>) -> Hook {
    Hook::blocking(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Profile {
    name: String,
    visits: u32,
}

// == Basic Scenarios ==

#[test]
fn test_set_get_delete_roundtrip() {
    let cache = create_test_cache();

    cache.set("foo", &123, None).unwrap();
    assert_eq!(cache.get::<i32>("foo").unwrap(), Some(123));

    assert!(cache.delete("foo").unwrap());
    assert_eq!(cache.get::<i32>("foo").unwrap(), None);
}

#[test]
fn test_delete_missing_key_is_not_an_error() {
    let cache = create_test_cache();
    let deletes = Arc::new(AtomicUsize::new(0));
    cache.register(EventKind::Delete, counting_hook(deletes.clone()), None, None);

    assert!(!cache.delete("ghost").unwrap());
    sleep(Duration::from_millis(100));
    assert_eq!(deletes.load(Ordering::SeqCst), 0);
}

#[test]
fn test_ttl_expiry_fires_exactly_once() {
    let cache = create_test_cache();
    let expired = Arc::new(Mutex::new(Vec::new()));
    let sink = expired.clone();
    cache.register(
        EventKind::Expire,
        Hook::blocking(move |key, value| {
            sink.lock().unwrap().push((key.to_string(), value.cloned()));
            Ok(())
        }),
        Some("temp"),
        None,
    );

    cache.set("temp", "x", Some(Duration::from_secs(1))).unwrap();
    assert_eq!(cache.get::<String>("temp").unwrap().as_deref(), Some("x"));

    sleep(Duration::from_millis(1500));
    assert_eq!(cache.get::<String>("temp").unwrap(), None);

    wait_for_hooks(&cache, 1, Duration::from_secs(2));
    sleep(Duration::from_millis(100));
    let expired = expired.lock().unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0], ("temp".to_string(), Some(Value::from("x"))));
}

#[test]
fn test_structured_values_reach_hooks_as_json() {
    let cache = LiveCache::new(thread_config().codec(Codec::MsgPack)).unwrap();
    let seen = Arc::new(Mutex::new(None));
    let sink = seen.clone();
    cache.register(
        EventKind::Set,
        Hook::blocking(move |_, value| {
            *sink.lock().unwrap() = value.cloned();
            Ok(())
        }),
        Some("user:1"),
        None,
    );

    let profile = Profile {
        name: "ada".to_string(),
        visits: 3,
    };
    cache.set("user:1", &profile, None).unwrap();
    assert_eq!(cache.get::<Profile>("user:1").unwrap(), Some(profile));

    wait_for_hooks(&cache, 1, Duration::from_secs(2));
    assert_eq!(
        *seen.lock().unwrap(),
        Some(serde_json::json!({"name": "ada", "visits": 3}))
    );
}

// == Hook Isolation ==

/// A hook sleeping past its deadline must not delay `get` or its sibling.
/// Outcomes are read from the dispatch stats, since a process-isolated
/// hook's side effects stay in the child.
fn assert_slow_hook_is_contained(cache: &LiveCache) {
    cache.register(
        EventKind::Get,
        Hook::blocking(|_, _| {
            thread::sleep(Duration::from_secs(3));
            Ok(())
        }),
        Some("slow"),
        Some(Duration::from_secs(1)),
    );
    cache.register(EventKind::Get, Hook::blocking(|_, _| Ok(())), None, None);

    cache.set("slow", "value", None).unwrap();
    let start = Instant::now();
    assert_eq!(cache.get::<String>("slow").unwrap().as_deref(), Some("value"));
    assert!(start.elapsed() < Duration::from_millis(500));

    wait_for_hooks(cache, 2, Duration::from_secs(3));
    let stats = cache.dispatch_stats();
    assert_eq!(stats.timed_out, 1);
    assert_eq!(stats.succeeded, 1);
}

#[test]
fn test_slow_hook_times_out_under_thread_isolation() {
    let cache = create_test_cache();
    assert!(!cache.sandbox().is_process_isolated());
    assert_slow_hook_is_contained(&cache);
}

#[cfg(unix)]
#[test]
fn test_slow_hook_is_killed_under_process_isolation() {
    let cache = LiveCache::new(CacheConfig::new().isolation(IsolationMode::Process)).unwrap();
    assert!(cache.sandbox().is_process_isolated());
    assert_slow_hook_is_contained(&cache);
}

#[test]
fn test_failing_hook_does_not_fail_operation() {
    let cache = create_test_cache();
    cache.register(
        EventKind::Set,
        Hook::blocking(|_, _| anyhow::bail!("hook exploded")),
        None,
        None,
    );
    cache.register(
        EventKind::Set,
        Hook::blocking(|_, _| panic!("hook panicked")),
        None,
        None,
    );

    cache.set("k", &1, None).unwrap();
    wait_for_hooks(&cache, 2, Duration::from_secs(2));
    assert_eq!(cache.dispatch_stats().failed, 2);
    assert_eq!(cache.get::<i32>("k").unwrap(), Some(1));
}

#[test]
fn test_disable_and_reenable_hook() {
    let cache = create_test_cache();
    let calls = Arc::new(AtomicUsize::new(0));
    let id = cache.register(EventKind::Set, counting_hook(calls.clone()), Some("k"), None);

    assert!(cache.set_callback_enabled(id, false));
    cache.set("k", &1, None).unwrap();
    sleep(Duration::from_millis(150));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    assert!(cache.set_callback_enabled(id, true));
    cache.set("k", &2, None).unwrap();
    wait_for_hooks(&cache, 1, Duration::from_secs(2));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert!(cache.unregister(id));
    assert!(!cache.set_callback_enabled(id, true));
}

#[test]
fn test_async_hook_runs_off_caller() {
    let cache = create_test_cache();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    cache.register(
        EventKind::Set,
        Hook::asynchronous(move |_, _| {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }),
        None,
        None,
    );

    let start = Instant::now();
    cache.set("a", &1, None).unwrap();
    assert!(start.elapsed() < Duration::from_millis(50));

    wait_for_hooks(&cache, 1, Duration::from_secs(2));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_events_on_one_key_arrive_in_call_order() {
    let cache = create_test_cache();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let record = move |key: &str, _: Option<&Value>| -> anyhow::Result<()> {
        sink.lock().unwrap().push(key.to_string());
        Ok(())
    };
    for event in [EventKind::Set, EventKind::Get, EventKind::Delete] {
        let record = record.clone();
        let kind = event.as_str();
        cache.register(
            event,
            Hook::blocking(move |key, value| record(&format!("{}:{}", kind, key), value)),
            Some("k"),
            None,
        );
    }

    cache.set("k", &1, None).unwrap();
    cache.get::<i32>("k").unwrap();
    cache.delete("k").unwrap();

    wait_for_hooks(&cache, 3, Duration::from_secs(2));
    assert_eq!(*seen.lock().unwrap(), vec!["set:k", "get:k", "delete:k"]);
}

// == Entry Hooks ==

#[test]
fn test_entry_hooks_fire_for_their_entry() {
    let cache = create_test_cache();
    let accessed = Arc::new(AtomicUsize::new(0));
    let expired = Arc::new(AtomicUsize::new(0));

    cache
        .set_with_hooks(
            "session",
            "token",
            Some(Duration::from_millis(300)),
            EntryHooks::new()
                .on_access(counting_hook(accessed.clone()))
                .on_expire(counting_hook(expired.clone())),
        )
        .unwrap();

    cache.get::<String>("session").unwrap();
    sleep(Duration::from_millis(500));
    wait_for_hooks(&cache, 2, Duration::from_secs(2));

    assert_eq!(accessed.load(Ordering::SeqCst), 1);
    assert_eq!(expired.load(Ordering::SeqCst), 1);

    // The expired entry's hooks are gone with it
    cache.set("session", "next", None).unwrap();
    cache.get::<String>("session").unwrap();
    sleep(Duration::from_millis(150));
    assert_eq!(accessed.load(Ordering::SeqCst), 1);
}

// == Encryption ==

#[test]
fn test_key_rotation_keeps_old_entries_readable() {
    let k1 = Keyring::generate_key().unwrap();
    let k2 = Keyring::generate_key().unwrap();
    let backend = Arc::new(MemoryBackend::new());
    let cache = LiveCache::with_backend(thread_config().encryption_key(k1.to_vec()), backend.clone())
        .unwrap();

    cache.set("before", "k1 data", None).unwrap();
    cache.rotate_key(&k2).unwrap();
    cache.set("after", "k2 data", None).unwrap();

    assert_eq!(cache.get::<String>("before").unwrap().as_deref(), Some("k1 data"));

    // New writes are sealed with K2 only
    let blob = livecache::Backend::get(&*backend, "after").unwrap().unwrap();
    assert!(Keyring::new(&[k2]).unwrap().decrypt(&blob).is_ok());
    assert!(Keyring::new(&[k1]).unwrap().decrypt(&blob).is_err());
}

#[test]
fn test_values_are_not_stored_in_plaintext() {
    let backend = Arc::new(MemoryBackend::new());
    let cache = LiveCache::with_backend(thread_config(), backend.clone()).unwrap();
    cache.set("card", "4111-1111-1111-1111", None).unwrap();

    let blob = livecache::Backend::get(&*backend, "card").unwrap().unwrap();
    let needle = b"4111-1111";
    assert!(!blob.windows(needle.len()).any(|w| w == needle));
}

#[test]
fn test_corrupted_entry_is_treated_as_absent() {
    let backend = Arc::new(MemoryBackend::new());
    let cache = LiveCache::with_backend(thread_config(), backend.clone()).unwrap();
    cache.set("k", "v", None).unwrap();

    let mut blob = livecache::Backend::get(&*backend, "k").unwrap().unwrap();
    let last = blob.len() - 1;
    blob[last] ^= 0x01;
    livecache::Backend::set(&*backend, "k", blob, None).unwrap();

    assert_eq!(cache.get_or("k", "default".to_string()).unwrap(), "default");
    assert!(!cache.exists("k").unwrap());
}

// == Key Locks ==

#[test]
fn test_read_modify_write_under_key_lock() {
    let cache = create_test_cache();
    cache.set("counter", &0u32, None).unwrap();

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let cache = cache.clone();
            thread::spawn(move || {
                for _ in 0..25 {
                    let _guard = cache.lock_guard("counter", Some(Duration::from_secs(5))).unwrap();
                    let current = cache.get::<u32>("counter").unwrap().unwrap_or(0);
                    cache.set("counter", &(current + 1), None).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(cache.get::<u32>("counter").unwrap(), Some(100));
}

/// Attempts `key` from another thread, releasing it again on success.
fn lock_from_other_thread(cache: &LiveCache, key: &'static str) -> livecache::Result<()> {
    let cache = cache.clone();
    thread::spawn(move || {
        cache.lock(key, Some(Duration::from_millis(50)))?;
        cache.unlock(key);
        Ok(())
    })
    .join()
    .unwrap()
}

#[test]
fn test_lock_timeout_is_reported() {
    let cache = create_test_cache();
    cache.lock("job", None).unwrap();

    let result = lock_from_other_thread(&cache, "job");
    assert!(matches!(result, Err(CacheError::LockTimeout(_))));

    assert!(cache.unlock("job"));
    assert!(lock_from_other_thread(&cache, "job").is_ok());
}

#[test]
fn test_key_lock_is_reentrant_and_owned() {
    let cache = create_test_cache();
    cache.lock("k", None).unwrap();
    cache.lock("k", Some(Duration::from_millis(200))).unwrap();

    let intruder = cache.clone();
    assert!(!thread::spawn(move || intruder.unlock("k")).join().unwrap());

    assert!(cache.unlock("k"));
    assert!(lock_from_other_thread(&cache, "k").is_err());
    assert!(cache.unlock("k"));
    assert!(lock_from_other_thread(&cache, "k").is_ok());
}

// == Backends and Policy ==

#[test]
fn test_sqlite_backend_end_to_end() {
    let cache = LiveCache::with_backend(thread_config(), SqliteBackend::in_memory().unwrap()).unwrap();

    cache.set("a", "alpha", None).unwrap();
    cache.set("b", "beta", Some(Duration::from_millis(100))).unwrap();
    assert_eq!(cache.len().unwrap(), 2);

    sleep(Duration::from_millis(300));
    assert_eq!(cache.keys().unwrap(), vec!["a".to_string()]);
    assert_eq!(
        cache.items::<String>().unwrap(),
        vec![("a".to_string(), "alpha".to_string())]
    );
}

/// Backend that refuses every write, as if its connection were gone.
struct UnavailableBackend;

impl Backend for UnavailableBackend {
    fn set(&self, _key: &str, _ciphertext: Vec<u8>, _ttl: Option<Duration>) -> BackendResult<()> {
        Err(BackendError::Unavailable("connection refused".to_string()))
    }

    fn get(&self, _key: &str) -> BackendResult<Option<Vec<u8>>> {
        Ok(None)
    }

    fn delete(&self, _key: &str) -> BackendResult<bool> {
        Ok(false)
    }

    fn exists(&self, _key: &str) -> BackendResult<bool> {
        Ok(false)
    }

    fn keys(&self) -> BackendResult<Vec<String>> {
        Ok(Vec::new())
    }

    fn items(&self) -> BackendResult<Vec<(String, Vec<u8>)>> {
        Ok(Vec::new())
    }
}

#[test]
fn test_failed_write_schedules_nothing() {
    let cache = LiveCache::with_backend(thread_config(), UnavailableBackend).unwrap();
    let sets = Arc::new(AtomicUsize::new(0));
    cache.register(EventKind::Set, counting_hook(sets.clone()), None, None);

    let result = cache.set("k", "v", Some(Duration::from_millis(100)));
    assert!(matches!(
        result,
        Err(CacheError::Backend(BackendError::Unavailable(_)))
    ));
    assert!(!cache.has_pending_expiry("k"));

    sleep(Duration::from_millis(200));
    assert_eq!(sets.load(Ordering::SeqCst), 0);
    let stats = cache.stats().unwrap();
    assert_eq!(stats.sets, 0);
    assert_eq!(stats.expirations, 0);
}

#[test]
fn test_access_policy_denies_before_touching_state() {
    let cache = LiveCache::new(
        thread_config().access_policy(|op, key| op != Operation::Delete || !key.starts_with("keep:")),
    )
    .unwrap();

    cache.set("keep:1", "v", None).unwrap();
    let denied = cache.delete("keep:1");
    assert!(matches!(denied, Err(CacheError::PermissionDenied { op: "delete", .. })));
    assert!(cache.exists("keep:1").unwrap());
}

#[test]
fn test_invalid_configuration_is_rejected() {
    let zero_workers = LiveCache::new(CacheConfig::new().dispatch_workers(0));
    assert!(matches!(zero_workers, Err(CacheError::Configuration(_))));

    let bad_key = LiveCache::new(CacheConfig::new().encryption_key(vec![0u8; 7]));
    assert!(matches!(bad_key, Err(CacheError::Configuration(_))));
}

// == Async Facade ==

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_async_facade_scenarios() {
    let cache = AsyncLiveCache::new(thread_config()).unwrap();

    cache.set("foo", 123, None).await.unwrap();
    assert_eq!(cache.get::<i32>("foo").await.unwrap(), Some(123));

    cache.set("temp", "x", Some(Duration::from_millis(200))).await.unwrap();
    assert_eq!(cache.get::<String>("temp").await.unwrap().as_deref(), Some("x"));
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(cache.get::<String>("temp").await.unwrap(), None);

    cache.lock("foo", None).await.unwrap();
    assert!(matches!(
        cache.clone().lock("foo", Some(Duration::from_millis(20))).await,
        Err(CacheError::LockTimeout(_))
    ));
    assert!(cache.unlock("foo"));

    cache.stop().await.unwrap();
    assert!(cache.sync().is_stopped());
}
