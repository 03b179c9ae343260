//! Stored Entry Module
//!
//! Defines the structure for individual stored blobs with TTL support.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

// == Stored Entry ==
/// A ciphertext blob plus its expiry marker.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    /// Encrypted payload (`nonce || ciphertext`)
    pub ciphertext: Vec<u8>,
    /// Expiration timestamp (Unix milliseconds), None = no expiration
    pub expires_at: Option<u64>,
}

impl StoredEntry {
    // == Constructor ==
    /// Creates a new stored entry with optional TTL.
    pub fn new(ciphertext: Vec<u8>, ttl: Option<Duration>) -> Self {
        let expires_at = ttl.map(|ttl| current_timestamp_ms().saturating_add(ttl.as_millis() as u64));
        Self {
            ciphertext,
            expires_at,
        }
    }

    // == Is Expired ==
    /// Checks if the entry has expired.
    ///
    /// An entry is logically dead once the current time is greater than or
    /// equal to its expiration time.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(current_timestamp_ms())
    }

    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        match self.expires_at {
            Some(expires) => now_ms >= expires,
            None => false,
        }
    }
}

// == Utility Functions ==
/// Returns current Unix timestamp in milliseconds.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
