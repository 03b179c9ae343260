//! Livecache - an in-process encrypted cache with expiring entries
//!
//! Values are serialized, sealed with AES-GCM and stored in a pluggable
//! backend. Entries expire on a background scheduler, and hooks observe
//! sets, reads, deletes and expirations from a sandbox that bounds their
//! run time (and, with process isolation, their memory).

pub mod backend;
pub mod cache;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod sandbox;
pub mod tasks;

pub use backend::{Backend, MemoryBackend, SqliteBackend};
#[cfg(feature = "redis")]
pub use backend::RedisBackend;
pub use cache::{AsyncLiveCache, CacheStats, EntryHooks, KeyGuard, LiveCache};
pub use codec::Codec;
pub use config::{AccessPolicy, CacheConfig, Operation};
pub use crypto::Keyring;
pub use error::{BackendError, CacheError, Result, SandboxError};
pub use events::{CallbackId, DispatchSnapshot, EventKind, Hook};
pub use sandbox::{IsolationMode, Sandbox};
