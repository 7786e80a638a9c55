//! Bounded LRU of materialized temp tables keyed by canonical query text.
//!
//! The cache only does bookkeeping. Whoever calls `insert`, `trim` or `clear` receives the
//! names of tables that left the cache and must drop them before releasing the connection.
//! Pinned tables may hold the cache above capacity; `trim` brings it back once they unpin.

use std::collections::HashMap;

use lru::LruCache;
use parking_lot::Mutex;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheHit {
    pub table_name: String,
    pub hit_count: u64,
    /// True on exactly the lookup where `hit_count` reaches the index threshold.
    pub needs_index: bool,
}

#[derive(Debug)]
struct CacheEntry {
    table_name: String,
    hits: u64,
}

#[derive(Debug)]
struct CacheState {
    entries: LruCache<String, CacheEntry>,
    pins: HashMap<String, usize>,
}

impl CacheState {
    fn is_pinned(&self, table_name: &str) -> bool {
        self.pins.get(table_name).is_some_and(|count| *count > 0)
    }

    /// Evicts least recently used unpinned entries, never `keep`, until the cache fits.
    fn trim(&mut self, capacity: usize, keep: Option<&str>) -> Vec<String> {
        let mut evicted = Vec::new();
        while self.entries.len() > capacity {
            let victim = self
                .entries
                .iter()
                .rev()
                .find(|(key, entry)| {
                    keep != Some(key.as_str()) && !self.is_pinned(&entry.table_name)
                })
                .map(|(key, _)| key.clone());
            let Some(key) = victim else {
                break;
            };
            if let Some(entry) = self.entries.pop(&key) {
                evicted.push(entry.table_name);
            }
        }
        evicted
    }
}

#[derive(Debug)]
pub struct TemporaryResultCache {
    state: Mutex<CacheState>,
    capacity: usize,
    index_after_hits: u64,
}

impl TemporaryResultCache {
    pub fn new(capacity: usize, index_after_hits: u64) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: LruCache::unbounded(),
                pins: HashMap::new(),
            }),
            capacity: capacity.max(1),
            index_after_hits,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn index_after_hits(&self) -> u64 {
        self.index_after_hits
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().entries.contains(key)
    }

    /// Table for `key` without counting a hit or touching recency.
    pub fn peek(&self, key: &str) -> Option<String> {
        self.state
            .lock()
            .entries
            .peek(key)
            .map(|entry| entry.table_name.clone())
    }

    pub fn lookup(&self, key: &str) -> Option<CacheHit> {
        let mut state = self.state.lock();
        let entry = state.entries.get_mut(key)?;
        entry.hits += 1;
        Some(CacheHit {
            table_name: entry.table_name.clone(),
            hit_count: entry.hits,
            needs_index: entry.hits == self.index_after_hits,
        })
    }

    /// Registers a freshly materialized table and returns the tables evicted to make room.
    ///
    /// Registering a key twice is a caller bug: debug builds assert, release builds keep the
    /// existing entry and evict nothing.
    pub fn insert(&self, key: impl Into<String>, table_name: impl Into<String>) -> Vec<String> {
        let key = key.into();
        let table_name = table_name.into();
        let mut state = self.state.lock();
        if let Some(existing) = state.entries.peek(&key) {
            debug_assert!(false, "cache key {key} registered twice");
            log::error!(
                "pointcloud cache: key {key} already maps to {}, ignoring {table_name}",
                existing.table_name
            );
            return Vec::new();
        }
        state.entries.push(
            key.clone(),
            CacheEntry {
                table_name,
                hits: 0,
            },
        );
        let evicted = state.trim(self.capacity, Some(&key));
        for table in &evicted {
            log::debug!("pointcloud cache: evicting {table}");
        }
        evicted
    }

    /// Evicts unpinned entries until the cache is back within capacity.
    pub fn trim(&self) -> Vec<String> {
        let evicted = self.state.lock().trim(self.capacity, None);
        for table in &evicted {
            log::debug!("pointcloud cache: trimming {table}");
        }
        evicted
    }

    /// Empties the cache, returning every table it tracked.
    pub fn clear(&self) -> Vec<String> {
        let mut state = self.state.lock();
        state.pins.clear();
        let mut drained = Vec::with_capacity(state.entries.len());
        while let Some((_, entry)) = state.entries.pop_lru() {
            drained.push(entry.table_name);
        }
        drained
    }

    pub fn table_names(&self) -> Vec<String> {
        self.state
            .lock()
            .entries
            .iter()
            .map(|(_, entry)| entry.table_name.clone())
            .collect()
    }

    /// Shields `table_name` from eviction until the returned guard drops.
    pub fn pin(&self, table_name: &str) -> CachePin<'_> {
        *self
            .state
            .lock()
            .pins
            .entry(table_name.to_string())
            .or_insert(0) += 1;
        CachePin {
            cache: self,
            table_name: table_name.to_string(),
        }
    }

    fn unpin(&self, table_name: &str) {
        let mut state = self.state.lock();
        if let Some(count) = state.pins.get_mut(table_name) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.pins.remove(table_name);
            }
        }
    }
}

#[must_use = "the table is only pinned while the guard is alive"]
pub struct CachePin<'a> {
    cache: &'a TemporaryResultCache,
    table_name: String,
}

impl Drop for CachePin<'_> {
    fn drop(&mut self) {
        self.cache.unpin(&self.table_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_counts_hits_and_flags_the_index_threshold_once() {
        let cache = TemporaryResultCache::new(8, 3);
        cache.insert("q", "Temp_q_Table");
        let flags: Vec<bool> = (0..5)
            .map(|_| cache.lookup("q").expect("hit").needs_index)
            .collect();
        assert_eq!(flags, vec![false, false, true, false, false]);
        assert_eq!(cache.lookup("q").expect("hit").hit_count, 6);
        assert!(cache.lookup("missing").is_none());
    }

    #[test]
    fn insert_past_capacity_evicts_least_recently_used() {
        let cache = TemporaryResultCache::new(2, 3);
        assert!(cache.insert("a", "ta").is_empty());
        assert!(cache.insert("b", "tb").is_empty());
        cache.lookup("a");
        assert_eq!(cache.insert("c", "tc"), vec!["tb".to_string()]);
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn every_evicted_table_is_reported_once() {
        let cache = TemporaryResultCache::new(3, 3);
        let mut evicted = Vec::new();
        for i in 0..10 {
            evicted.extend(cache.insert(format!("k{i}"), format!("t{i}")));
            assert!(cache.len() <= 3);
        }
        assert_eq!(evicted, (0..7).map(|i| format!("t{i}")).collect::<Vec<_>>());
        let mut remaining = cache.clear();
        remaining.sort();
        assert_eq!(remaining, vec!["t7", "t8", "t9"]);
        assert!(cache.is_empty());
    }

    #[test]
    fn pinned_tables_are_skipped_by_eviction() {
        let cache = TemporaryResultCache::new(1, 3);
        cache.insert("a", "ta");
        let pin = cache.pin("ta");
        assert!(cache.insert("b", "tb").is_empty());
        assert_eq!(cache.len(), 2);
        drop(pin);
        assert_eq!(cache.insert("c", "tc"), vec!["ta".to_string(), "tb".to_string()]);
        assert_eq!(cache.table_names(), vec!["tc".to_string()]);
    }

    #[test]
    fn trim_restores_capacity_once_pins_release() {
        let cache = TemporaryResultCache::new(1, 3);
        cache.insert("a", "ta");
        let first = cache.pin("ta");
        cache.insert("b", "tb");
        let second = cache.pin("tb");
        assert!(cache.insert("c", "tc").is_empty());
        assert_eq!(cache.len(), 3);
        assert!(cache.trim().is_empty());

        drop(first);
        drop(second);
        assert_eq!(cache.trim(), vec!["ta".to_string(), "tb".to_string()]);
        assert_eq!(cache.len(), 1);
        assert!(cache.trim().is_empty());
    }

    #[test]
    fn peek_does_not_promote() {
        let cache = TemporaryResultCache::new(2, 3);
        cache.insert("a", "ta");
        cache.insert("b", "tb");
        assert_eq!(cache.peek("a").as_deref(), Some("ta"));
        assert_eq!(cache.insert("c", "tc"), vec!["ta".to_string()]);
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn duplicate_insert_keeps_the_first_entry() {
        let cache = TemporaryResultCache::new(2, 3);
        cache.insert("a", "ta");
        assert!(cache.insert("a", "other").is_empty());
        assert_eq!(cache.peek("a").as_deref(), Some("ta"));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "registered twice")]
    fn duplicate_insert_asserts_in_debug_builds() {
        let cache = TemporaryResultCache::new(2, 3);
        cache.insert("a", "ta");
        cache.insert("a", "other");
    }
}
