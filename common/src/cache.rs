//! Lock-guarded keyed store used for all process-wide protocol maps
//! (challenge table, pending keys, publish rate limiting).
//!
//! Injected wherever shared mutable state is needed so a deployment spanning
//! multiple instances can swap in a distributed cache behind the same
//! surface.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

struct Entry<V> {
    value: V,
    expires_at: Option<DateTime<Utc>>,
}

pub struct GuardedMap<V> {
    entries: Mutex<HashMap<String, Entry<V>>>,
}

impl<V: Clone> GuardedMap<V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Insert or replace. A `ttl` of `None` keeps the entry until deleted.
    pub fn put(&self, key: &str, value: V, ttl: Option<Duration>) {
        let expires_at = ttl.map(|t| Utc::now() + t);
        self.entries
            .lock()
            .insert(key.to_string(), Entry { value, expires_at });
    }

    /// Fetch a live entry, lazily evicting it when expired.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock();
        let expired = match entries.get(key) {
            Some(entry) => match entry.expires_at {
                Some(expires_at) => Utc::now() > expires_at,
                None => false,
            },
            None => return None,
        };
        if expired {
            entries.remove(key);
            return None;
        }
        entries.get(key).map(|entry| entry.value.clone())
    }

    /// Fetch without expiry filtering. Callers that need to distinguish
    /// "expired" from "never existed" peek first and delete themselves.
    pub fn peek(&self, key: &str) -> Option<V> {
        self.entries.lock().get(key).map(|e| e.value.clone())
    }

    pub fn delete(&self, key: &str) -> Option<V> {
        self.entries.lock().remove(key).map(|e| e.value)
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| match e.expires_at {
            Some(expires_at) => now <= expires_at,
            None => true,
        });
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone> Default for GuardedMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete() {
        let map: GuardedMap<String> = GuardedMap::new();
        map.put("a", "one".to_string(), None);
        assert_eq!(map.get("a").as_deref(), Some("one"));
        assert_eq!(map.delete("a").as_deref(), Some("one"));
        assert!(map.get("a").is_none());
    }

    #[test]
    fn expired_entries_are_evicted_on_get() {
        let map: GuardedMap<u32> = GuardedMap::new();
        map.put("k", 7, Some(Duration::seconds(-1)));
        assert!(map.get("k").is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn peek_returns_expired_entries() {
        let map: GuardedMap<u32> = GuardedMap::new();
        map.put("k", 7, Some(Duration::seconds(-1)));
        assert_eq!(map.peek("k"), Some(7));
    }

    #[test]
    fn sweep_removes_only_expired() {
        let map: GuardedMap<u32> = GuardedMap::new();
        map.put("stale", 1, Some(Duration::seconds(-5)));
        map.put("fresh", 2, Some(Duration::seconds(300)));
        map.put("pinned", 3, None);
        assert_eq!(map.sweep(), 1);
        assert_eq!(map.len(), 2);
    }
}
