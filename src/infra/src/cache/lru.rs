// Copyright 2024 Quiver Labs Inc.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use std::time::{Duration, Instant};

use config::utils::hash::Fnv64a;
use hashlink::LruCache;
use parking_lot::Mutex;

struct Entry<V> {
    value: V,
    bytes: usize,
    expires_at: Option<Instant>,
}

struct Bucket<V> {
    data: LruCache<String, Entry<V>>,
    cur_bytes: usize,
}

impl<V> Bucket<V> {
    fn new() -> Self {
        Bucket {
            data: LruCache::new_unbounded(),
            cur_bytes: 0,
        }
    }
}

/// Count-, byte- and TTL-bound LRU cache with fine-grained bucket locking.
/// Expired entries are dropped lazily on access and by [`Cache::sweep`].
pub struct Cache<V: Clone> {
    name: &'static str,
    buckets: Vec<Mutex<Bucket<V>>>,
    max_entries_per_bucket: usize,
    max_bytes_per_bucket: usize,
    ttl: Option<Duration>,
}

impl<V: Clone> Cache<V> {
    pub fn new(
        name: &'static str,
        max_entries: usize,
        max_bytes: usize,
        ttl: Duration,
        bucket_num: usize,
    ) -> Self {
        let bucket_num = bucket_num.max(1);
        let mut buckets = Vec::with_capacity(bucket_num);
        for _ in 0..bucket_num {
            buckets.push(Mutex::new(Bucket::new()));
        }
        Cache {
            name,
            buckets,
            max_entries_per_bucket: (max_entries / bucket_num).max(1),
            max_bytes_per_bucket: (max_bytes / bucket_num).max(1),
            ttl: (!ttl.is_zero()).then_some(ttl),
        }
    }

    fn bucket_idx(&self, key: &str) -> usize {
        (Fnv64a::new().sum64(key) % self.buckets.len() as u64) as usize
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut bucket = self.buckets[self.bucket_idx(key)].lock();
        let expired = match bucket.data.get(key) {
            None => return None,
            Some(entry) => entry
                .expires_at
                .is_some_and(|deadline| Instant::now() >= deadline),
        };
        if expired {
            if let Some(entry) = bucket.data.remove(key) {
                bucket.cur_bytes -= entry.bytes;
            }
            return None;
        }
        bucket.data.get(key).map(|entry| entry.value.clone())
    }

    pub fn insert(&self, key: String, value: V, bytes: usize) {
        let expires_at = self.ttl.map(|ttl| Instant::now() + ttl);
        let mut bucket = self.buckets[self.bucket_idx(&key)].lock();
        if let Some(old) = bucket.data.remove(&key) {
            bucket.cur_bytes -= old.bytes;
        }
        bucket.cur_bytes += bytes;
        bucket.data.insert(
            key,
            Entry {
                value,
                bytes,
                expires_at,
            },
        );
        // evict from the cold end until back under both bounds
        while bucket.data.len() > self.max_entries_per_bucket
            || bucket.cur_bytes > self.max_bytes_per_bucket
        {
            match bucket.data.remove_lru() {
                Some((_, entry)) => bucket.cur_bytes -= entry.bytes,
                None => break,
            }
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        let mut bucket = self.buckets[self.bucket_idx(key)].lock();
        match bucket.data.remove(key) {
            Some(entry) => {
                bucket.cur_bytes -= entry.bytes;
                true
            }
            None => false,
        }
    }

    /// Drop every entry whose key fails the predicate. Used for version-tag
    /// invalidation, e.g. all keys of one index.
    pub fn retain<F: Fn(&str) -> bool>(&self, keep: F) {
        for bucket in &self.buckets {
            let mut bucket = bucket.lock();
            let doomed: Vec<String> = bucket
                .data
                .iter()
                .filter(|(k, _)| !keep(k))
                .map(|(k, _)| k.clone())
                .collect();
            for key in doomed {
                if let Some(entry) = bucket.data.remove(&key) {
                    bucket.cur_bytes -= entry.bytes;
                }
            }
        }
    }

    /// Periodic sweep of expired entries.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut swept = 0;
        for bucket in &self.buckets {
            let mut bucket = bucket.lock();
            let doomed: Vec<String> = bucket
                .data
                .iter()
                .filter(|(_, e)| e.expires_at.is_some_and(|d| now >= d))
                .map(|(k, _)| k.clone())
                .collect();
            for key in doomed {
                if let Some(entry) = bucket.data.remove(&key) {
                    bucket.cur_bytes -= entry.bytes;
                    swept += 1;
                }
            }
        }
        if swept > 0 {
            log::debug!("[CACHE:{}] swept {} expired entries", self.name, swept);
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        let bucket = self.buckets[self.bucket_idx(key)].lock();
        bucket.data.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().data.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        for bucket in &self.buckets {
            let mut bucket = bucket.lock();
            bucket.data.clear();
            bucket.cur_bytes = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(max_entries: usize, max_bytes: usize, ttl_ms: u64) -> Cache<String> {
        Cache::new(
            "test",
            max_entries,
            max_bytes,
            Duration::from_millis(ttl_ms),
            1,
        )
    }

    #[test]
    fn test_insert_get() {
        let c = cache(10, 1024, 0);
        c.insert("a".to_string(), "1".to_string(), 1);
        assert_eq!(c.get("a"), Some("1".to_string()));
        assert_eq!(c.get("b"), None);
    }

    #[test]
    fn test_count_bound_evicts_lru() {
        let c = cache(2, 1024, 0);
        c.insert("a".to_string(), "1".to_string(), 1);
        c.insert("b".to_string(), "2".to_string(), 1);
        // touch a so b is the cold one
        assert!(c.get("a").is_some());
        c.insert("c".to_string(), "3".to_string(), 1);
        assert_eq!(c.len(), 2);
        assert!(c.get("b").is_none());
        assert!(c.get("a").is_some());
        assert!(c.get("c").is_some());
    }

    #[test]
    fn test_byte_bound() {
        let c = cache(100, 10, 0);
        c.insert("a".to_string(), "1".to_string(), 6);
        c.insert("b".to_string(), "2".to_string(), 6);
        assert_eq!(c.len(), 1);
        assert!(c.get("b").is_some());
    }

    #[test]
    fn test_ttl_expiry() {
        let c = cache(10, 1024, 1);
        c.insert("a".to_string(), "1".to_string(), 1);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(c.get("a"), None);
    }

    #[test]
    fn test_sweep() {
        let c = cache(10, 1024, 1);
        c.insert("a".to_string(), "1".to_string(), 1);
        c.insert("b".to_string(), "2".to_string(), 1);
        std::thread::sleep(Duration::from_millis(5));
        c.sweep();
        assert_eq!(c.len(), 0);
    }

    #[test]
    fn test_retain() {
        let c = cache(10, 1024, 0);
        c.insert("logs/a".to_string(), "1".to_string(), 1);
        c.insert("logs/b".to_string(), "2".to_string(), 1);
        c.insert("metrics/a".to_string(), "3".to_string(), 1);
        c.retain(|k| !k.starts_with("logs/"));
        assert_eq!(c.len(), 1);
        assert!(c.get("metrics/a").is_some());
    }

    #[test]
    fn test_replace_updates_bytes() {
        let c = cache(10, 10, 0);
        c.insert("a".to_string(), "1".to_string(), 8);
        c.insert("a".to_string(), "2".to_string(), 4);
        c.insert("b".to_string(), "3".to_string(), 4);
        assert_eq!(c.len(), 2);
        assert_eq!(c.get("a"), Some("2".to_string()));
    }
}
