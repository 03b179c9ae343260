//! Events Module
//!
//! Hook registration and off-thread dispatch of cache events.

mod dispatcher;
mod hook;
mod registry;
mod stats;

pub use dispatcher::{DispatcherOptions, EventDispatcher};
pub use hook::{AsyncFn, BlockingFn, BoxFuture, CallbackEntry, CallbackId, EventKind, Hook};
pub use registry::{CallbackRegistry, Scope};
pub use stats::{DispatchSnapshot, DispatchStats};
