//! Per-Entry Hooks
//!
//! Hooks attached to a single `set`, living exactly as long as that entry.

use crate::events::Hook;

// == Entry Hooks ==
/// Hooks bound to one entry at `set` time.
///
/// Registered as key-scoped `get` / `expire` callbacks. A later `set` on the
/// same key replaces them; `delete` and expiry remove them after their event
/// has been raised.
#[derive(Debug, Clone, Default)]
pub struct EntryHooks {
    /// Runs on every successful `get` of the entry
    pub on_access: Option<Hook>,
    /// Runs once when the entry's TTL elapses
    pub on_expire: Option<Hook>,
}

impl EntryHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_access(mut self, hook: Hook) -> Self {
        self.on_access = Some(hook);
        self
    }

    pub fn on_expire(mut self, hook: Hook) -> Self {
        self.on_expire = Some(hook);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.on_access.is_none() && self.on_expire.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        assert!(EntryHooks::new().is_empty());

        let hooks = EntryHooks::new().on_expire(Hook::key_only(|_| Ok(())));
        assert!(!hooks.is_empty());
        assert!(hooks.on_access.is_none());
        assert!(hooks.on_expire.is_some());
    }
}
