//! Bounded, time-windowed duplicate suppression.
//!
//! Pruning is amortized into `check`; there is no background timer.

use crate::config::DedupeConfig;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Stamp {
    seen_at: Instant,
    seq: u64,
}

#[derive(Debug)]
pub struct DedupeCache {
    ttl: Duration,
    max_size: usize,
    entries: HashMap<String, Stamp>,
    // Recency index: oldest first. Mirrors `entries` one-to-one.
    order: BTreeMap<(Instant, u64), String>,
    next_seq: u64,
}

impl DedupeCache {
    /// A zero `ttl` disables expiry; only the size cap bounds the cache.
    pub fn new(ttl: Duration, max_size: usize) -> Self {
        Self {
            ttl,
            max_size,
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
        }
    }

    pub fn from_config(cfg: &DedupeConfig) -> Self {
        Self::new(Duration::from_millis(cfg.ttl_ms), cfg.max_size)
    }

    /// Returns `true` when `key` was already seen inside the TTL window.
    pub fn check(&mut self, key: &str) -> bool {
        self.check_at(key, Instant::now())
    }

    pub fn check_at(&mut self, key: &str, now: Instant) -> bool {
        if key.is_empty() {
            return false;
        }
        let duplicate = self
            .entries
            .get(key)
            .is_some_and(|stamp| !self.is_expired(stamp.seen_at, now));
        self.touch(key, now);
        if !duplicate {
            self.prune(now);
        }
        duplicate
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    fn is_expired(&self, seen_at: Instant, now: Instant) -> bool {
        !self.ttl.is_zero() && now.saturating_duration_since(seen_at) >= self.ttl
    }

    fn touch(&mut self, key: &str, now: Instant) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        let stamp = Stamp { seen_at: now, seq };
        if let Some(previous) = self.entries.insert(key.to_string(), stamp) {
            self.order.remove(&(previous.seen_at, previous.seq));
        }
        self.order.insert((now, seq), key.to_string());
    }

    fn prune(&mut self, now: Instant) {
        if !self.ttl.is_zero() {
            while let Some((&(seen_at, seq), _)) = self.order.first_key_value() {
                if !self.is_expired(seen_at, now) {
                    break;
                }
                if let Some(key) = self.order.remove(&(seen_at, seq)) {
                    self.entries.remove(&key);
                }
            }
        }
        if self.max_size == 0 {
            self.clear();
            return;
        }
        while self.entries.len() > self.max_size {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::DedupeCache;
    use std::time::Duration;
    use tokio::time::Instant;

    #[test]
    fn first_check_records_and_second_is_duplicate() {
        let mut cache = DedupeCache::new(Duration::from_secs(60), 100);
        let now = Instant::now();
        assert!(!cache.check_at("signal:dm:1", now));
        assert!(cache.check_at("signal:dm:1", now + Duration::from_secs(1)));
        assert!(!cache.check_at("signal:dm:2", now + Duration::from_secs(1)));
    }

    #[test]
    fn empty_key_is_never_a_duplicate() {
        let mut cache = DedupeCache::new(Duration::from_secs(60), 100);
        assert!(!cache.check(""));
        assert!(!cache.check(""));
        assert!(cache.is_empty());
    }

    #[test]
    fn key_expires_after_ttl_without_intervening_check() {
        let mut cache = DedupeCache::new(Duration::from_millis(500), 100);
        let start = Instant::now();
        assert!(!cache.check_at("k", start));
        assert!(cache.check_at("k", start + Duration::from_millis(499)));
        // The duplicate hit above refreshed the timestamp.
        assert!(cache.check_at("k", start + Duration::from_millis(998)));
        assert!(!cache.check_at("k", start + Duration::from_millis(1_498)));
    }

    #[test]
    fn expired_entries_are_pruned_on_insert() {
        let mut cache = DedupeCache::new(Duration::from_millis(100), 100);
        let start = Instant::now();
        for idx in 0..10 {
            cache.check_at(&format!("old-{idx}"), start);
        }
        assert_eq!(cache.len(), 10);
        cache.check_at("fresh", start + Duration::from_millis(150));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn size_never_exceeds_cap_and_oldest_go_first() {
        let mut cache = DedupeCache::new(Duration::from_secs(3600), 3);
        let start = Instant::now();
        for idx in 0..50u64 {
            cache.check_at(&format!("k{idx}"), start + Duration::from_millis(idx));
            assert!(cache.len() <= 3);
        }
        let later = start + Duration::from_millis(100);
        assert!(cache.check_at("k49", later));
        assert!(cache.check_at("k48", later));
        assert!(!cache.check_at("k0", later));
    }

    #[test]
    fn touched_entry_survives_eviction_over_untouched_ones() {
        let mut cache = DedupeCache::new(Duration::from_secs(3600), 2);
        let start = Instant::now();
        cache.check_at("a", start);
        cache.check_at("b", start + Duration::from_millis(1));
        assert!(cache.check_at("a", start + Duration::from_millis(2)));
        cache.check_at("c", start + Duration::from_millis(3));
        assert!(cache.check_at("a", start + Duration::from_millis(4)));
        assert!(!cache.check_at("b", start + Duration::from_millis(5)));
    }

    #[test]
    fn zero_cap_keeps_nothing_and_zero_ttl_never_expires() {
        let mut capless = DedupeCache::new(Duration::from_secs(60), 0);
        assert!(!capless.check("x"));
        assert!(!capless.check("x"));
        assert!(capless.is_empty());

        let mut forever = DedupeCache::new(Duration::ZERO, 10);
        let start = Instant::now();
        assert!(!forever.check_at("x", start));
        assert!(forever.check_at("x", start + Duration::from_secs(86_400)));
    }
}
