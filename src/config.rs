//! Configuration Module
//!
//! Handles loading and managing cache configuration, either from environment
//! variables or through builder methods.

use std::env;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::codec::Codec;
use crate::error::{CacheError, Result};
use crate::sandbox::IsolationMode;

// == Access Control ==
/// Cache operation checked by an [`AccessPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Set,
    Get,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Set => "set",
            Operation::Get => "get",
            Operation::Delete => "delete",
        }
    }
}

/// Caller-supplied predicate deciding whether an operation on a key is allowed.
pub type AccessPolicy = Arc<dyn Fn(Operation, &str) -> bool + Send + Sync>;

/// Cache configuration parameters.
///
/// All values have sensible defaults and can be overridden from the
/// environment or with the builder methods.
#[derive(Clone)]
pub struct CacheConfig {
    /// TTL applied by `set` when the caller passes none
    pub default_ttl: Option<Duration>,
    /// Deadline for each hook run unless the registration overrides it
    pub hook_timeout: Duration,
    /// Number of hooks allowed to run at once
    pub dispatch_workers: usize,
    /// Serialization format of stored values
    pub codec: Codec,
    /// Requested hook isolation strategy
    pub isolation: IsolationMode,
    /// Address-space headroom in bytes for process-isolated hooks
    pub memory_limit: Option<u64>,
    /// Run hooks inside the sandbox (deadline + isolation)
    pub sandbox_hooks: bool,
    /// Serialize mutations behind the store-wide lock
    pub prevent_race_condition: bool,
    /// AES-GCM keys, oldest first; empty generates one random key
    pub encryption_keys: Vec<Vec<u8>>,
    /// Optional access-control predicate
    pub access_policy: Option<AccessPolicy>,
}

impl CacheConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new CacheConfig by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `LIVECACHE_DEFAULT_TTL` - Default TTL in seconds, 0 disables (default: none)
    /// - `LIVECACHE_HOOK_TIMEOUT_MS` - Hook deadline in milliseconds (default: 2000)
    /// - `LIVECACHE_DISPATCH_WORKERS` - Concurrent hook runs (default: 8)
    /// - `LIVECACHE_CODEC` - `json` or `msgpack` (default: json)
    /// - `LIVECACHE_ISOLATION` - `auto`, `process` or `thread` (default: auto)
    /// - `LIVECACHE_HOOK_MEMORY_MB` - Memory headroom for process isolation (default: none)
    ///
    /// Unparseable numbers fall back to their defaults; unknown codec or
    /// isolation names are configuration errors.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(secs) = env_number::<u64>("LIVECACHE_DEFAULT_TTL") {
            config = config.default_ttl(Duration::from_secs(secs));
        }
        if let Some(ms) = env_number::<u64>("LIVECACHE_HOOK_TIMEOUT_MS") {
            config.hook_timeout = Duration::from_millis(ms);
        }
        if let Some(workers) = env_number::<usize>("LIVECACHE_DISPATCH_WORKERS") {
            config.dispatch_workers = workers;
        }
        if let Ok(name) = env::var("LIVECACHE_CODEC") {
            config.codec = name.parse()?;
        }
        if let Ok(name) = env::var("LIVECACHE_ISOLATION") {
            config.isolation = name.parse()?;
        }
        if let Some(mb) = env_number::<u64>("LIVECACHE_HOOK_MEMORY_MB") {
            config.memory_limit = Some(mb.saturating_mul(1024 * 1024));
        }

        config.validate()?;
        Ok(config)
    }

    /// Sets the default TTL. `Duration::ZERO` disables it.
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = if ttl.is_zero() { None } else { Some(ttl) };
        self
    }

    pub fn hook_timeout(mut self, timeout: Duration) -> Self {
        self.hook_timeout = timeout;
        self
    }

    pub fn dispatch_workers(mut self, workers: usize) -> Self {
        self.dispatch_workers = workers;
        self
    }

    pub fn codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    pub fn isolation(mut self, mode: IsolationMode) -> Self {
        self.isolation = mode;
        self
    }

    pub fn memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    pub fn sandbox_hooks(mut self, enabled: bool) -> Self {
        self.sandbox_hooks = enabled;
        self
    }

    pub fn prevent_race_condition(mut self, enabled: bool) -> Self {
        self.prevent_race_condition = enabled;
        self
    }

    /// Appends an encryption key; the last key added becomes current.
    pub fn encryption_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.encryption_keys.push(key.into());
        self
    }

    pub fn access_policy<F>(mut self, policy: F) -> Self
    where
        F: Fn(Operation, &str) -> bool + Send + Sync + 'static,
    {
        self.access_policy = Some(Arc::new(policy));
        self
    }

    // == Validate ==
    /// Checks construction parameters that cannot be fixed up silently.
    ///
    /// Key lengths are checked when the keyring is built.
    pub fn validate(&self) -> Result<()> {
        if self.dispatch_workers == 0 {
            return Err(CacheError::Configuration(
                "dispatch_workers must be at least 1".to_string(),
            ));
        }
        if self.hook_timeout.is_zero() {
            return Err(CacheError::Configuration(
                "hook_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: None,
            hook_timeout: Duration::from_secs(2),
            dispatch_workers: 8,
            codec: Codec::Json,
            isolation: IsolationMode::Auto,
            memory_limit: None,
            sandbox_hooks: true,
            prevent_race_condition: true,
            encryption_keys: Vec::new(),
            access_policy: None,
        }
    }
}

impl fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheConfig")
            .field("default_ttl", &self.default_ttl)
            .field("hook_timeout", &self.hook_timeout)
            .field("dispatch_workers", &self.dispatch_workers)
            .field("codec", &self.codec)
            .field("isolation", &self.isolation)
            .field("memory_limit", &self.memory_limit)
            .field("sandbox_hooks", &self.sandbox_hooks)
            .field("prevent_race_condition", &self.prevent_race_condition)
            .field("encryption_keys", &self.encryption_keys.len())
            .field("access_policy", &self.access_policy.is_some())
            .finish()
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}
