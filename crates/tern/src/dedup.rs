use crate::lru::{CacheStats, TtlCache};
use crate::relay::RelayUrl;
use crate::EventId;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Sizing/aging knobs for the duplicate gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupConfig {
    pub capacity: usize,
    pub ttl: Duration,
    /// Track per-relay seen sets in addition to the global one. Costs
    /// memory, buys per-relay delivery stats and replay detection.
    pub per_relay: bool,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            ttl: Duration::from_secs(60 * 60),
            per_relay: false,
        }
    }
}

impl DedupConfig {
    pub fn high_volume() -> Self {
        Self {
            capacity: 50_000,
            ttl: Duration::from_secs(30 * 60),
            per_relay: true,
        }
    }

    pub fn low_memory() -> Self {
        Self {
            capacity: 1_000,
            ttl: Duration::from_secs(10 * 60),
            per_relay: false,
        }
    }
}

/// Monotonic counters; snapshot with [`Deduplicator::stats`].
#[derive(Debug, Default)]
struct Counters {
    total_checks: AtomicU64,
    duplicates: AtomicU64,
    unique: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupStats {
    pub total_checks: u64,
    pub duplicates: u64,
    pub unique: u64,
    pub cache: CacheStats,
}

/// The at-most-once gate: an event id passes exactly one `process` call
/// per TTL window, no matter how many relays deliver it.
pub struct Deduplicator {
    config: DedupConfig,
    global: TtlCache<EventId, ()>,
    per_relay: Option<TtlCache<(RelayUrl, EventId), ()>>,
    counters: Counters,
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DedupConfig::default())
    }
}

impl Deduplicator {
    pub fn new(config: DedupConfig) -> Self {
        let per_relay = config
            .per_relay
            .then(|| TtlCache::new(config.capacity, Some(config.ttl)));
        Self {
            global: TtlCache::new(config.capacity, Some(config.ttl)),
            per_relay,
            config,
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// Read-only check. Never raises; unknown relays just miss.
    pub fn is_duplicate(&self, event_id: &EventId, relay: Option<&RelayUrl>) -> bool {
        if self.global.contains(event_id) {
            return true;
        }
        match (&self.per_relay, relay) {
            (Some(cache), Some(relay)) => cache.contains(&(relay.clone(), *event_id)),
            _ => false,
        }
    }

    pub fn mark_seen(&self, event_id: &EventId, relay: Option<&RelayUrl>) {
        self.global.set(*event_id, (), None);
        if let (Some(cache), Some(relay)) = (&self.per_relay, relay) {
            cache.set((relay.clone(), *event_id), (), None);
        }
    }

    /// The composite gate: returns true iff the event is new, marking it
    /// seen as a side effect.
    pub fn process(&self, event_id: &EventId, relay: Option<&RelayUrl>) -> bool {
        self.counters.total_checks.fetch_add(1, Ordering::Relaxed);

        if self.is_duplicate(event_id, relay) {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            // per-relay sets still learn that this relay delivered it
            if let (Some(cache), Some(relay)) = (&self.per_relay, relay) {
                cache.set((relay.clone(), *event_id), (), None);
            }
            return false;
        }

        self.mark_seen(event_id, relay);
        self.counters.unique.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn clear(&self) {
        self.global.clear();
        if let Some(cache) = &self.per_relay {
            cache.clear();
        }
    }

    pub fn cleanup_expired(&self) {
        self.global.cleanup_expired();
        if let Some(cache) = &self.per_relay {
            cache.cleanup_expired();
        }
    }

    pub fn stats(&self) -> DedupStats {
        DedupStats {
            total_checks: self.counters.total_checks.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            unique: self.counters.unique.load(Ordering::Relaxed),
            cache: self.global.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> EventId {
        EventId::new([byte; 32])
    }

    fn relay(name: &str) -> RelayUrl {
        RelayUrl::parse(name).expect("relay url")
    }

    #[test]
    fn first_sighting_is_unique_then_duplicate() {
        let dedup = Deduplicator::default();
        assert!(dedup.process(&id(1), None));
        assert!(!dedup.process(&id(1), None));

        let stats = dedup.stats();
        assert_eq!(stats.total_checks, 2);
        assert_eq!(stats.unique, 1);
        assert_eq!(stats.duplicates, 1);
    }

    #[test]
    fn same_event_from_n_relays_passes_once() {
        let dedup = Deduplicator::new(DedupConfig::high_volume());
        let relays: Vec<RelayUrl> = (0..5)
            .map(|i| relay(&format!("wss://relay{i}.example.com")))
            .collect();

        let mut delivered = 0;
        for r in &relays {
            if dedup.process(&id(7), Some(r)) {
                delivered += 1;
            }
        }

        assert_eq!(delivered, 1);
        assert_eq!(dedup.stats().duplicates, relays.len() as u64 - 1);
    }

    #[test]
    fn is_duplicate_does_not_mutate() {
        let dedup = Deduplicator::default();
        assert!(!dedup.is_duplicate(&id(3), None));
        assert!(!dedup.is_duplicate(&id(3), None), "checking twice is free");
        assert!(dedup.process(&id(3), None));
    }

    #[test]
    fn clear_forgets_everything() {
        let dedup = Deduplicator::default();
        dedup.process(&id(9), None);
        dedup.clear();
        assert!(dedup.process(&id(9), None), "cleared ids are new again");
    }

    #[test]
    fn presets_have_expected_shape() {
        assert!(DedupConfig::high_volume().per_relay);
        assert!(!DedupConfig::low_memory().per_relay);
        assert!(DedupConfig::low_memory().capacity < DedupConfig::default().capacity);
    }
}
