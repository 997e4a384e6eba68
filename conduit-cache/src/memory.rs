//! In-process tier. Entries carry an absolute expiry checked against the
//! local monotonic clock; capacity overflow selects a victim by the
//! region's eviction policy at write time.

use crate::region::EvictionPolicy;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: serde_json::Value,
    expires_at: Instant,
    size_bytes: usize,
    inserted_seq: u64,
    last_access_seq: u64,
    access_count: u64,
}

#[derive(Default)]
struct RegionStore {
    entries: HashMap<String, MemoryEntry>,
    seq: u64,
}

impl RegionStore {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn victim(&self, policy: EvictionPolicy) -> Option<String> {
        let candidates = self.entries.iter();
        let key = match policy {
            EvictionPolicy::Lru => candidates
                .min_by_key(|(_, e)| e.last_access_seq)
                .map(|(k, _)| k.clone()),
            EvictionPolicy::Lfu => candidates
                .min_by_key(|(_, e)| (e.access_count, e.last_access_seq))
                .map(|(k, _)| k.clone()),
            EvictionPolicy::Fifo => candidates
                .min_by_key(|(_, e)| e.inserted_seq)
                .map(|(k, _)| k.clone()),
            EvictionPolicy::None => None,
        };
        key
    }
}

/// Shared memory tier holding one store per region.
#[derive(Default)]
pub struct MemoryTier {
    regions: DashMap<String, Arc<Mutex<RegionStore>>>,
}

impl MemoryTier {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self, region: &str) -> Arc<Mutex<RegionStore>> {
        self.regions
            .entry(region.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(RegionStore::default())))
            .clone()
    }

    /// Returns the live value, dropping it if expired.
    pub fn get(&self, region: &str, key: &str) -> Option<serde_json::Value> {
        let store = self.store(region);
        let mut store = store.lock();
        let seq = store.next_seq();
        match store.entries.get_mut(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                entry.last_access_seq = seq;
                entry.access_count += 1;
                Some(entry.value.clone())
            }
            Some(_) => {
                store.entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Write with absolute expiry. Returns false when the region is full
    /// and the policy refuses to evict.
    pub fn set(
        &self,
        region: &str,
        key: &str,
        value: serde_json::Value,
        ttl: Duration,
        max_entries: Option<usize>,
        policy: EvictionPolicy,
    ) -> bool {
        let size_bytes = serde_json::to_vec(&value).map(|v| v.len()).unwrap_or(0);
        let store = self.store(region);
        let mut store = store.lock();

        if let Some(max) = max_entries {
            if !store.entries.contains_key(key) && store.entries.len() >= max {
                match store.victim(policy) {
                    Some(victim) => {
                        store.entries.remove(&victim);
                    }
                    None => return false,
                }
            }
        }

        let seq = store.next_seq();
        store.entries.insert(
            key.to_string(),
            MemoryEntry {
                value,
                expires_at: Instant::now() + ttl,
                size_bytes,
                inserted_seq: seq,
                last_access_seq: seq,
                access_count: 0,
            },
        );
        true
    }

    pub fn remove(&self, region: &str, key: &str) -> bool {
        let store = self.store(region);
        let removed = store.lock().entries.remove(key).is_some();
        removed
    }

    pub fn clear_region(&self, region: &str) {
        let store = self.store(region);
        store.lock().entries.clear();
    }

    pub fn len(&self, region: &str) -> usize {
        let store = self.store(region);
        let len = store.lock().entries.len();
        len
    }

    pub fn memory_usage_bytes(&self, region: &str) -> usize {
        let store = self.store(region);
        let bytes = store.lock().entries.values().map(|e| e.size_bytes).sum();
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_get_roundtrip_within_ttl() {
        let tier = MemoryTier::new();
        tier.set("r", "k", json!(42), Duration::from_secs(60), None, EvictionPolicy::Lru);
        assert_eq!(tier.get("r", "k"), Some(json!(42)));
    }

    #[test]
    fn expired_entry_is_a_miss() {
        let tier = MemoryTier::new();
        tier.set("r", "k", json!(1), Duration::ZERO, None, EvictionPolicy::Lru);
        assert_eq!(tier.get("r", "k"), None);
        assert_eq!(tier.len("r"), 0);
    }

    #[test]
    fn lru_evicts_least_recently_used() {
        let tier = MemoryTier::new();
        for k in ["a", "b", "c"] {
            tier.set("r", k, json!(k), Duration::from_secs(60), Some(3), EvictionPolicy::Lru);
        }
        // Touch a and b so c becomes the LRU victim.
        tier.get("r", "a");
        tier.get("r", "b");
        tier.set("r", "d", json!("d"), Duration::from_secs(60), Some(3), EvictionPolicy::Lru);

        assert!(tier.get("r", "c").is_none());
        assert!(tier.get("r", "a").is_some());
        assert!(tier.get("r", "d").is_some());
    }

    #[test]
    fn lfu_evicts_least_frequently_used() {
        let tier = MemoryTier::new();
        for k in ["a", "b"] {
            tier.set("r", k, json!(k), Duration::from_secs(60), Some(2), EvictionPolicy::Lfu);
        }
        tier.get("r", "a");
        tier.get("r", "a");
        tier.get("r", "b");
        tier.set("r", "c", json!("c"), Duration::from_secs(60), Some(2), EvictionPolicy::Lfu);

        assert!(tier.get("r", "b").is_none());
        assert!(tier.get("r", "a").is_some());
    }

    #[test]
    fn fifo_evicts_oldest_insert() {
        let tier = MemoryTier::new();
        for k in ["first", "second"] {
            tier.set("r", k, json!(k), Duration::from_secs(60), Some(2), EvictionPolicy::Fifo);
        }
        tier.get("r", "first");
        tier.set("r", "third", json!(3), Duration::from_secs(60), Some(2), EvictionPolicy::Fifo);

        assert!(tier.get("r", "first").is_none());
        assert!(tier.get("r", "second").is_some());
    }

    #[test]
    fn policy_none_rejects_overflow() {
        let tier = MemoryTier::new();
        assert!(tier.set("r", "a", json!(1), Duration::from_secs(60), Some(1), EvictionPolicy::None));
        assert!(!tier.set("r", "b", json!(2), Duration::from_secs(60), Some(1), EvictionPolicy::None));
        assert!(tier.get("r", "a").is_some());
    }

    #[test]
    fn overwrite_does_not_evict() {
        let tier = MemoryTier::new();
        tier.set("r", "a", json!(1), Duration::from_secs(60), Some(1), EvictionPolicy::Lru);
        assert!(tier.set("r", "a", json!(2), Duration::from_secs(60), Some(1), EvictionPolicy::Lru));
        assert_eq!(tier.get("r", "a"), Some(json!(2)));
    }
}
