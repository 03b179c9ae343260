//! Error types for the cache
//!
//! Provides unified error handling using thiserror.

use std::time::Duration;

use thiserror::Error;

// == Sandbox Error ==
/// Failure of a single sandboxed hook run.
///
/// Never surfaced to the caller of `set`/`get`/`delete`; the dispatcher logs
/// it and counts it in [`DispatchStats`](crate::events::DispatchStats).
#[derive(Error, Debug)]
pub enum SandboxError {
    /// The hook did not finish within its deadline
    #[error("hook exceeded timeout of {0:?}")]
    Timeout(Duration),

    /// The hook itself returned an error or panicked
    #[error("hook failed: {0}")]
    Failure(#[source] anyhow::Error),

    /// The isolation primitive (process or thread) could not be started
    #[error("failed to start sandbox: {0}")]
    Spawn(String),
}

// == Backend Error ==
/// Failure reported by a storage backend.
#[derive(Error, Debug)]
pub enum BackendError {
    /// Backend cannot serve the request (connection lost, poisoned state, ...)
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// SQLite driver error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Redis client error
    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

// == Cache Error Enum ==
/// Unified error type for the cache.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Ciphertext could not be authenticated under any key in the keyring
    #[error("authentication failed: ciphertext rejected by every key")]
    AuthFailure,

    /// Encryption could not be performed (RNG or sealing failure)
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// A per-key lock was not acquired within the requested timeout
    #[error("timed out waiting for lock on key: {0}")]
    LockTimeout(String),

    /// A sandboxed hook failed (only returned from direct sandbox use)
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    /// The storage backend failed
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Invalid construction parameters
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Value could not be encoded or decoded by the configured codec
    #[error("codec error: {0}")]
    Codec(String),

    /// The access policy refused the operation
    #[error("operation '{op}' denied for key: {key}")]
    PermissionDenied { op: &'static str, key: String },

    /// Internal failure (e.g. a blocking task panicked)
    #[error("internal error: {0}")]
    Internal(String),
}

// == Result Type Alias ==
/// Convenience Result type for the cache.
pub type Result<T> = std::result::Result<T, CacheError>;
