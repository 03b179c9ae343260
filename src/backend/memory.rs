//! In-memory backend
//!
//! HashMap storage with a per-key expiry marker. Expired entries are purged
//! lazily when read, listed or checked.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;

use super::entry::current_timestamp_ms;
use super::{Backend, BackendResult, StoredEntry};

/// Process-local backend; the default for a new cache.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, StoredEntry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes every expired entry. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = current_timestamp_ms();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired_at(now));
        before - entries.len()
    }
}

impl Backend for MemoryBackend {
    fn set(&self, key: &str, ciphertext: Vec<u8>, ttl: Option<Duration>) -> BackendResult<()> {
        self.entries
            .lock()
            .insert(key.to_string(), StoredEntry::new(ciphertext, ttl));
        Ok(())
    }

    fn get(&self, key: &str) -> BackendResult<Option<Vec<u8>>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_expired() => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.ciphertext.clone())),
            None => Ok(None),
        }
    }

    fn delete(&self, key: &str) -> BackendResult<bool> {
        let removed = self.entries.lock().remove(key);
        Ok(matches!(removed, Some(entry) if !entry.is_expired()))
    }

    fn take(&self, key: &str) -> BackendResult<Option<Vec<u8>>> {
        Ok(self.entries.lock().remove(key).map(|entry| entry.ciphertext))
    }

    fn exists(&self, key: &str) -> BackendResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    fn keys(&self) -> BackendResult<Vec<String>> {
        self.purge_expired();
        Ok(self.entries.lock().keys().cloned().collect())
    }

    fn items(&self) -> BackendResult<Vec<(String, Vec<u8>)>> {
        self.purge_expired();
        Ok(self
            .entries
            .lock()
            .iter()
            .map(|(k, e)| (k.clone(), e.ciphertext.clone()))
            .collect())
    }

    fn len(&self) -> BackendResult<usize> {
        self.purge_expired();
        Ok(self.entries.lock().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_set_get_delete() {
        let backend = MemoryBackend::new();
        backend.set("k", vec![1, 2], None).unwrap();

        assert_eq!(backend.get("k").unwrap(), Some(vec![1, 2]));
        assert!(backend.exists("k").unwrap());
        assert!(backend.delete("k").unwrap());
        assert!(!backend.delete("k").unwrap());
        assert_eq!(backend.get("k").unwrap(), None);
    }

    #[test]
    fn test_overwrite_replaces_ttl() {
        let backend = MemoryBackend::new();
        backend.set("k", vec![1], Some(Duration::from_millis(50))).unwrap();
        backend.set("k", vec![2], None).unwrap();

        sleep(Duration::from_millis(100));
        assert_eq!(backend.get("k").unwrap(), Some(vec![2]));
    }

    #[test]
    fn test_expired_entries_are_hidden() {
        let backend = MemoryBackend::new();
        backend.set("short", vec![1], Some(Duration::from_millis(50))).unwrap();
        backend.set("long", vec![2], Some(Duration::from_secs(60))).unwrap();

        sleep(Duration::from_millis(100));

        assert_eq!(backend.keys().unwrap(), vec!["long".to_string()]);
        assert_eq!(backend.items().unwrap(), vec![("long".to_string(), vec![2])]);
        assert!(!backend.exists("short").unwrap());
        assert_eq!(backend.len().unwrap(), 1);
    }

    #[test]
    fn test_take_returns_blob_past_its_deadline() {
        let backend = MemoryBackend::new();
        backend.set("k", vec![4, 2], Some(Duration::from_millis(20))).unwrap();

        sleep(Duration::from_millis(60));
        assert_eq!(backend.take("k").unwrap(), Some(vec![4, 2]));
        assert_eq!(backend.take("k").unwrap(), None);
        assert!(!backend.exists("k").unwrap());
    }
}
