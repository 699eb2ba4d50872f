//! Reusable TTL-bounded cache (whatsmeow-style retry/call/placeholder caches,
//! generalized per the single-cache redesign flag).
//!
//! Eviction happens lazily on access plus an explicit `sweep()` the owning
//! actor can call on a timer; there is no background thread here (callers
//! already run on a tokio runtime and can spawn their own sweeper).

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// A TTL-bounded map. Not internally synchronized; wrap in a `Mutex`/`RwLock`
/// when shared across tasks (the receiver pipeline owns one exclusively, per
/// spec, so no locking is imposed here).
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: HashMap<K, Entry<V>>,
}

impl<K: Eq + Hash + Clone, V> TtlCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Insert or replace a value, resetting its TTL.
    pub fn insert(&mut self, key: K, value: V) {
        self.entries.insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Get a value, evicting it first if expired.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.evict_if_expired(key);
        self.entries.get(key).map(|e| &e.value)
    }

    /// Get a mutable value, evicting it first if expired.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.evict_if_expired(key);
        self.entries.get_mut(key).map(|e| &mut e.value)
    }

    /// Remove a key unconditionally, returning its value if present and unexpired.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.evict_if_expired(key);
        self.entries.remove(key).map(|e| e.value)
    }

    pub fn contains(&mut self, key: &K) -> bool {
        self.get(key).is_some()
    }

    fn evict_if_expired(&mut self, key: &K) {
        let expired = self
            .entries
            .get(key)
            .map(|e| Instant::now() >= e.expires_at)
            .unwrap_or(false);
        if expired {
            self.entries.remove(key);
        }
    }

    /// Sweep all expired entries (call on a timer from the owning actor).
    pub fn sweep(&mut self) {
        let now = Instant::now();
        self.entries.retain(|_, e| e.expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn insert_and_get() {
        let mut c = TtlCache::new(Duration::from_secs(60));
        c.insert("a", 1);
        assert_eq!(c.get(&"a"), Some(&1));
    }

    #[test]
    fn expires_after_ttl() {
        let mut c = TtlCache::new(Duration::from_millis(10));
        c.insert("a", 1);
        sleep(Duration::from_millis(30));
        assert_eq!(c.get(&"a"), None);
    }

    #[test]
    fn sweep_removes_expired_only() {
        let mut c = TtlCache::new(Duration::from_millis(10));
        c.insert("a", 1);
        sleep(Duration::from_millis(30));
        c.insert("b", 2);
        c.sweep();
        assert_eq!(c.len(), 1);
        assert_eq!(c.get(&"b"), Some(&2));
    }

    #[test]
    fn remove_returns_value() {
        let mut c = TtlCache::new(Duration::from_secs(60));
        c.insert("a", 1);
        assert_eq!(c.remove(&"a"), Some(1));
        assert_eq!(c.get(&"a"), None);
    }
}
