//! Hook definitions
//!
//! Event kinds, callback identifiers and the two handler shapes (blocking
//! and async) that can be registered with the dispatcher.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::error::CacheError;

// == Event Kind ==
/// Cache event a hook can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Set,
    Get,
    Delete,
    Expire,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::Set,
        EventKind::Get,
        EventKind::Delete,
        EventKind::Expire,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Set => "set",
            EventKind::Get => "get",
            EventKind::Delete => "delete",
            EventKind::Expire => "expire",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, CacheError> {
        match s {
            "set" => Ok(EventKind::Set),
            "get" => Ok(EventKind::Get),
            "delete" => Ok(EventKind::Delete),
            "expire" => Ok(EventKind::Expire),
            other => Err(CacheError::Configuration(format!("invalid event: {}", other))),
        }
    }
}

// == Callback Id ==
/// Opaque identifier returned at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

impl CallbackId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        CallbackId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cb-{}", self.0)
    }
}

// == Hook ==
/// Boxed future returned by async hooks.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

pub type BlockingFn = Arc<dyn Fn(&str, Option<&Value>) -> anyhow::Result<()> + Send + Sync>;
pub type AsyncFn = Arc<dyn Fn(String, Option<Value>) -> BoxFuture<anyhow::Result<()>> + Send + Sync>;

/// A hook handler. The value is `None` when the event has no payload, e.g.
/// an expiry whose data the backend had already dropped.
#[derive(Clone)]
pub enum Hook {
    /// Runs on a dispatch worker inside the sandbox
    Blocking(BlockingFn),
    /// Runs on the dispatcher's async runtime under a deadline
    Async(AsyncFn),
}

impl Hook {
    /// Wraps a blocking `(key, value)` handler.
    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn(&str, Option<&Value>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Hook::Blocking(Arc::new(f))
    }

    /// Wraps a blocking handler that only needs the key (expire-only style).
    pub fn key_only<F>(f: F) -> Self
    where
        F: Fn(&str) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Hook::Blocking(Arc::new(move |key: &str, _: Option<&Value>| f(key)))
    }

    /// Wraps an async `(key, value)` handler.
    pub fn asynchronous<F, Fut>(f: F) -> Self
    where
        F: Fn(String, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Hook::Async(Arc::new(move |key, value| Box::pin(f(key, value))))
    }

    pub fn is_async(&self) -> bool {
        matches!(self, Hook::Async(_))
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hook::Blocking(_) => f.write_str("Hook::Blocking"),
            Hook::Async(_) => f.write_str("Hook::Async"),
        }
    }
}

// == Callback Entry ==
/// One registered hook.
#[derive(Debug)]
pub struct CallbackEntry {
    pub id: CallbackId,
    pub hook: Hook,
    pub timeout: Duration,
    enabled: AtomicBool,
}

impl CallbackEntry {
    pub fn new(hook: Hook, timeout: Duration) -> Self {
        Self {
            id: CallbackId::next(),
            hook,
            timeout,
            enabled: AtomicBool::new(true),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_async(&self) -> bool {
        self.hook.is_async()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_parse() {
        for kind in EventKind::ALL {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
        assert!("update".parse::<EventKind>().is_err());
    }

    #[test]
    fn test_callback_ids_are_unique() {
        let a = CallbackId::next();
        let b = CallbackId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn test_key_only_hook_ignores_value() {
        let hook = Hook::key_only(|key| {
            anyhow::ensure!(key == "temp", "unexpected key {}", key);
            Ok(())
        });
        match hook {
            Hook::Blocking(f) => {
                assert!(f("temp", Some(&Value::Null)).is_ok());
                assert!(f("other", None).is_err());
            }
            Hook::Async(_) => panic!("expected blocking hook"),
        }
    }

    #[test]
    fn test_entry_toggle() {
        let entry = CallbackEntry::new(
            Hook::asynchronous(|_, _| async { Ok(()) }),
            Duration::from_secs(1),
        );
        assert!(entry.is_enabled());
        assert!(entry.is_async());
        entry.set_enabled(false);
        assert!(!entry.is_enabled());
    }
}
