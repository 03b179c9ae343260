//! Callback registry
//!
//! Hooks indexed by event kind, then by scope (one key, or global).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::hook::{CallbackEntry, CallbackId, EventKind};

/// Hook scope: a single key, or every key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Key(String),
    Global,
}

impl Scope {
    pub fn from_key(key: Option<&str>) -> Self {
        match key {
            Some(key) => Scope::Key(key.to_string()),
            None => Scope::Global,
        }
    }
}

type ScopeMap = HashMap<Scope, Vec<Arc<CallbackEntry>>>;

#[derive(Debug, Default)]
pub struct CallbackRegistry {
    by_event: RwLock<HashMap<EventKind, ScopeMap>>,
    /// Reverse index for unregister / enable lookups
    locations: RwLock<HashMap<CallbackId, (EventKind, Scope)>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, event: EventKind, scope: Scope, entry: CallbackEntry) -> CallbackId {
        let id = entry.id;
        let mut by_event = self.by_event.write();
        by_event
            .entry(event)
            .or_default()
            .entry(scope.clone())
            .or_default()
            .push(Arc::new(entry));
        self.locations.write().insert(id, (event, scope));
        id
    }

    /// Removes a hook. Returns whether it was registered.
    pub fn remove(&self, id: CallbackId) -> bool {
        let mut by_event = self.by_event.write();
        let (event, scope) = match self.locations.write().remove(&id) {
            Some(location) => location,
            None => return false,
        };
        if let Some(scopes) = by_event.get_mut(&event) {
            if let Some(entries) = scopes.get_mut(&scope) {
                entries.retain(|e| e.id != id);
                if entries.is_empty() {
                    scopes.remove(&scope);
                }
            }
        }
        true
    }

    /// Toggles a hook without unregistering it. Returns whether it exists.
    pub fn set_enabled(&self, id: CallbackId, enabled: bool) -> bool {
        match self.find(id) {
            Some(entry) => {
                entry.set_enabled(enabled);
                true
            }
            None => false,
        }
    }

    pub fn find(&self, id: CallbackId) -> Option<Arc<CallbackEntry>> {
        let (event, scope) = self.locations.read().get(&id).cloned()?;
        self.by_event
            .read()
            .get(&event)
            .and_then(|scopes| scopes.get(&scope))
            .and_then(|entries| entries.iter().find(|e| e.id == id).cloned())
    }

    /// Enabled hooks for `event` scoped to `key`, followed by global ones.
    pub fn gather(&self, event: EventKind, key: &str) -> Vec<Arc<CallbackEntry>> {
        let by_event = self.by_event.read();
        let scopes = match by_event.get(&event) {
            Some(scopes) => scopes,
            None => return Vec::new(),
        };
        let keyed = scopes.get(&Scope::Key(key.to_string()));
        let global = scopes.get(&Scope::Global);
        keyed
            .into_iter()
            .chain(global)
            .flatten()
            .filter(|e| e.is_enabled())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.locations.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
