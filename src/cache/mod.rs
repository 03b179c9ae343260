//! Cache Module
//!
//! The encrypted cache core and its sync and async handles.

mod async_handle;
mod entry;
mod locks;
mod stats;
mod store;


// Re-export public types
pub use async_handle::AsyncLiveCache;
pub use entry::EntryHooks;
pub use locks::{KeyGuard, KeyLockTable, LockOwner};
pub use stats::CacheStats;
pub use store::LiveCache;
