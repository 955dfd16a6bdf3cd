use schnellru::{ByLength, LruMap};
use std::sync::{Mutex, PoisonError};

/// First four bytes of call data as lower-case hex, when the input is long enough to carry one.
pub fn function_selector(input: &[u8]) -> Option<String> {
    input.get(..4).map(hex::encode)
}

struct Estimate {
    gas: String,
    stored_at: u64,
}

/// Gas estimates keyed by `(contract, selector)`. Entries expire after the TTL, are evicted
/// early when an injection shows the estimate was too small, and the least recently used
/// entry goes once `max_entries` is reached.
pub struct GasEstimateCache {
    entries: Mutex<LruMap<(String, String), Estimate, ByLength>>,
    ttl_ms: u64,
}

impl GasEstimateCache {
    pub fn new(ttl_ms: u64, max_entries: u32) -> Self {
        Self {
            entries: Mutex::new(LruMap::new(ByLength::new(max_entries))),
            ttl_ms,
        }
    }

    fn key(to: &str, selector: &str) -> (String, String) {
        (
            to.to_lowercase(),
            selector.trim_start_matches("0x").to_lowercase(),
        )
    }

    pub fn get_at(&self, to: &str, selector: &str, now_ms: u64) -> Option<String> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let key = Self::key(to, selector);
        let fresh = entries
            .get(&key)
            .map(|e| (now_ms.saturating_sub(e.stored_at) < self.ttl_ms).then(|| e.gas.clone()))?;
        if fresh.is_none() {
            entries.remove(&key);
        }
        fresh
    }

    pub fn get(&self, to: &str, selector: &str) -> Option<String> {
        self.get_at(to, selector, crate::now_millis())
    }

    pub fn insert_at(&self, to: &str, selector: &str, gas: String, now_ms: u64) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(Self::key(to, selector), Estimate { gas, stored_at: now_ms });
    }

    /// Drop every expired entry, returning how many went.
    pub fn purge_expired_at(&self, now_ms: u64) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let stale: Vec<(String, String)> = entries
            .iter()
            .filter(|(_, e)| now_ms.saturating_sub(e.stored_at) >= self.ttl_ms)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            entries.remove(key);
        }
        stale.len()
    }

    pub fn insert(&self, to: &str, selector: &str, gas: String) {
        self.insert_at(to, selector, gas, crate::now_millis())
    }

    pub fn invalidate(&self, to: &str, selector: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&Self::key(to, selector))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_needs_four_bytes() {
        assert_eq!(function_selector(&[0xa9, 0x05, 0x9c, 0xbb, 0x00]), Some("a9059cbb".to_string()));
        assert_eq!(function_selector(&[0xa9, 0x05]), None);
    }

    #[test]
    fn keys_are_case_insensitive() {
        let cache = GasEstimateCache::new(1_000, 16);
        cache.insert_at("0xAbC", "0xA9059CBB", "0x5208".to_string(), 0);
        assert_eq!(cache.get_at("0xabc", "a9059cbb", 10), Some("0x5208".to_string()));
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = GasEstimateCache::new(1_000, 16);
        cache.insert_at("0xabc", "a9059cbb", "0x5208".to_string(), 0);
        assert!(cache.get_at("0xabc", "a9059cbb", 999).is_some());
        assert!(cache.get_at("0xabc", "a9059cbb", 1_000).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn invalidate_evicts() {
        let cache = GasEstimateCache::new(1_000, 16);
        cache.insert_at("0xabc", "a9059cbb", "0x5208".to_string(), 0);
        assert!(cache.invalidate("0xABC", "a9059cbb"));
        assert!(!cache.invalidate("0xabc", "a9059cbb"));
    }

    #[test]
    fn least_recently_used_goes_at_capacity() {
        let cache = GasEstimateCache::new(60_000, 2);
        cache.insert_at("0xaaa", "a9059cbb", "0x1".to_string(), 0);
        cache.insert_at("0xbbb", "a9059cbb", "0x2".to_string(), 0);
        assert!(cache.get_at("0xaaa", "a9059cbb", 1).is_some());

        for i in 0..100 {
            cache.insert_at(&format!("0x{:040x}", i), "095ea7b3", "0x3".to_string(), 2);
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.get_at("0xaaa", "a9059cbb", 3).is_none());
    }

    #[test]
    fn purge_drops_only_expired_entries() {
        let cache = GasEstimateCache::new(1_000, 16);
        cache.insert_at("0xaaa", "a9059cbb", "0x1".to_string(), 0);
        cache.insert_at("0xbbb", "a9059cbb", "0x2".to_string(), 900);
        assert_eq!(cache.purge_expired_at(1_000), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get_at("0xbbb", "a9059cbb", 1_000).is_some());
    }
}
