use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;
use serde_json::Value;

/// Opaque cache for derived query results. A miss is always safe: callers
/// fall back to the store.
pub trait QueryCache: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;

    fn set(&self, key: &str, value: Value, ttl: Duration);

    /// Drops every entry whose key starts with `prefix`.
    fn invalidate(&self, prefix: &str);
}

struct Entry {
    value: Value,
    expires_at: Instant,
}

/// In-process LRU with per-entry expiry.
pub struct LruQueryCache {
    entries: Mutex<LruCache<String, Entry>>,
}

impl LruQueryCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, LruCache<String, Entry>> {
        // A panic mid-insert leaves at worst a stale entry behind.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl QueryCache for LruQueryCache {
    fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    fn set(&self, key: &str, value: Value, ttl: Duration) {
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries().put(key.to_string(), entry);
    }

    fn invalidate(&self, prefix: &str) {
        let mut entries = self.entries();
        let stale: Vec<String> = entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            entries.pop(&key);
        }
    }
}

/// Conversation listings cached per instance.
///
/// Keys carry a per-instance write counter. A listing read before a write but
/// stored after it lands under an outdated key and is never served.
pub(crate) struct ConversationCache {
    cache: Arc<dyn QueryCache>,
    generations: Mutex<HashMap<String, u64>>,
    ttl: Duration,
}

impl ConversationCache {
    pub(crate) fn new(cache: Arc<dyn QueryCache>, ttl: Duration) -> Self {
        Self {
            cache,
            generations: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn generations(&self) -> std::sync::MutexGuard<'_, HashMap<String, u64>> {
        self.generations.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Key for the listing as of now. Take it before reading the store.
    pub(crate) fn key(&self, instance_id: &str) -> String {
        let generation = self.generations().get(instance_id).copied().unwrap_or(0);
        format!("conversations:{instance_id}:{generation}")
    }

    pub(crate) fn get(&self, key: &str) -> Option<Value> {
        self.cache.get(key)
    }

    pub(crate) fn store(&self, key: &str, value: Value) {
        self.cache.set(key, value, self.ttl);
    }

    /// Call after every write that can change an instance's listing.
    pub(crate) fn invalidate(&self, instance_id: &str) {
        *self.generations().entry(instance_id.to_string()).or_insert(0) += 1;
        self.cache.invalidate(&format!("conversations:{instance_id}:"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn expired_entries_miss() {
        let cache = LruQueryCache::new(4);
        cache.set("a", json!(1), Duration::from_secs(60));
        cache.set("b", json!(2), Duration::ZERO);

        assert_eq!(cache.get("a"), Some(json!(1)));
        assert_eq!(cache.get("b"), None);
    }

    #[test]
    fn invalidate_matches_prefix() {
        let cache = LruQueryCache::new(4);
        cache.set("conversations:i1", json!([]), Duration::from_secs(60));
        cache.set("conversations:i2", json!([]), Duration::from_secs(60));
        cache.invalidate("conversations:i1");

        assert_eq!(cache.get("conversations:i1"), None);
        assert!(cache.get("conversations:i2").is_some());
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = LruQueryCache::new(2);
        let ttl = Duration::from_secs(60);
        cache.set("a", json!(1), ttl);
        cache.set("b", json!(2), ttl);
        cache.get("a");
        cache.set("c", json!(3), ttl);

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
    }

    #[test]
    fn listing_read_before_a_write_is_never_served() {
        let conversations = ConversationCache::new(
            Arc::new(LruQueryCache::new(8)),
            Duration::from_secs(60),
        );

        let before_write = conversations.key("i1");
        conversations.invalidate("i1");
        conversations.store(&before_write, json!(["stale"]));

        let current = conversations.key("i1");
        assert_ne!(current, before_write);
        assert_eq!(conversations.get(&current), None);

        conversations.store(&current, json!(["fresh"]));
        assert_eq!(conversations.get(&conversations.key("i1")), Some(json!(["fresh"])));
    }

    #[test]
    fn invalidation_is_per_instance() {
        let conversations = ConversationCache::new(
            Arc::new(LruQueryCache::new(8)),
            Duration::from_secs(60),
        );
        let other = conversations.key("i10");
        conversations.store(&other, json!([]));

        conversations.invalidate("i1");
        assert_eq!(conversations.key("i10"), other);
        assert!(conversations.get(&other).is_some());
    }
}
