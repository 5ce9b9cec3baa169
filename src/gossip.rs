//! Gossip deduplication.
//!
//! A TTL-indexed set of gossip ids. An id presented twice within the TTL is
//! suppressed, which bounds flood-relay to one delivery per node per id.
//! Garbage collection is opportunistic: every query sweeps expired entries,
//! so the map never outgrows the set of ids seen in one TTL window.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default suppression window for repeated gossip ids.
pub const DEFAULT_SEEN_TTL: Duration = Duration::from_secs(30);

pub struct SeenCache {
    ttl: Duration,
    items: Mutex<HashMap<String, Instant>>,
}

impl SeenCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            items: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true if `id` was seen within the TTL. Otherwise records it
    /// and returns false. Empty ids are always treated as seen so malformed
    /// gossip cannot bypass dedup.
    pub fn seen(&self, id: &str) -> bool {
        if id.is_empty() {
            return true;
        }

        let now = Instant::now();
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());

        items.retain(|_, t| now.duration_since(*t) <= self.ttl);

        if items.contains_key(id) {
            return true;
        }
        items.insert(id.to_string(), now);
        false
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }
}

impl Default for SeenCache {
    fn default() -> Self {
        Self::new(DEFAULT_SEEN_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sighting_records_second_suppresses() {
        let cache = SeenCache::default();
        assert!(!cache.seen("msg-1"));
        assert!(cache.seen("msg-1"));
        assert!(!cache.seen("msg-2"));
        assert!(cache.seen("msg-2"));
    }

    #[test]
    fn empty_id_is_always_seen() {
        let cache = SeenCache::default();
        assert!(cache.seen(""));
        assert!(cache.seen(""));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = SeenCache::new(Duration::from_millis(30));
        assert!(!cache.seen("msg"));
        assert!(cache.seen("msg"));
        std::thread::sleep(Duration::from_millis(60));
        // Expired: the id reads as fresh again and the stale row is gone.
        assert!(!cache.seen("msg"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn gc_prunes_unrelated_expired_entries() {
        let cache = SeenCache::new(Duration::from_millis(30));
        for i in 0..50 {
            cache.seen(&format!("old-{i}"));
        }
        std::thread::sleep(Duration::from_millis(60));
        cache.seen("fresh");
        assert_eq!(cache.len(), 1);
    }
}
