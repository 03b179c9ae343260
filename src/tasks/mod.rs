//! Background Tasks Module
//!
//! Contains the workers that run beside the cache.
//!
//! # Tasks
//! - Expiry scheduler: fires key expirations at their deadline

mod scheduler;

pub use scheduler::{Expiry, ExpiryHandler, ExpiryScheduler};
