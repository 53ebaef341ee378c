use hashbrown::HashMap;
use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Snapshot of cache counters. All monotonic.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

struct Slot<V> {
    value: V,
    stamp: u64,
    expires_at: Option<Instant>,
}

struct Inner<K, V> {
    map: HashMap<K, Slot<V>>,
    /// Recency queue of (key, stamp). Stale stamps are skipped lazily when
    /// evicting, so promotion is O(1).
    order: VecDeque<(K, u64)>,
    tick: u64,
    stats: CacheStats,
}

/// Capacity- and age-bounded key→value map. `get`/`set` are linearizable:
/// the whole structure sits behind one mutex.
pub struct TtlCache<K, V> {
    inner: Mutex<Inner<K, V>>,
    capacity: usize,
    default_ttl: Option<Duration>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize, default_ttl: Option<Duration>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: HashMap::with_capacity(capacity.min(4096)),
                order: VecDeque::new(),
                tick: 0,
                stats: CacheStats::default(),
            }),
            capacity: capacity.max(1),
            default_ttl,
        }
    }

    /// Returns the live value for `k`, promoting it to most-recently-used.
    /// Expired entries are removed on the way out and count as misses.
    pub fn get(&self, key: &K) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&self, key: &K, now: Instant) -> Option<V> {
        let mut inner = self.lock();

        let expired = match inner.map.get(key) {
            None => {
                inner.stats.misses += 1;
                return None;
            }
            Some(slot) => slot.expires_at.is_some_and(|at| at <= now),
        };

        if expired {
            inner.map.remove(key);
            inner.stats.expirations += 1;
            inner.stats.misses += 1;
            return None;
        }

        inner.stats.hits += 1;
        let stamp = inner.next_stamp();
        let slot = inner.map.get_mut(key)?;
        slot.stamp = stamp;
        let value = slot.value.clone();
        inner.order.push_back((key.clone(), stamp));
        Some(value)
    }

    /// Inserts or refreshes `key`. `ttl` overrides the cache default for
    /// this entry; when over capacity the least-recently-used live entry is
    /// evicted.
    pub fn set(&self, key: K, value: V, ttl: Option<Duration>) {
        self.set_at(key, value, ttl, Instant::now())
    }

    pub fn set_at(&self, key: K, value: V, ttl: Option<Duration>, now: Instant) {
        let mut inner = self.lock();
        let stamp = inner.next_stamp();
        let expires_at = ttl.or(self.default_ttl).map(|d| now + d);

        inner.map.insert(
            key.clone(),
            Slot {
                value,
                stamp,
                expires_at,
            },
        );
        inner.order.push_back((key, stamp));

        while inner.map.len() > self.capacity {
            let Some((old_key, old_stamp)) = inner.order.pop_front() else {
                break;
            };
            let current = inner.map.get(&old_key).map(|s| s.stamp);
            if current != Some(old_stamp) {
                // stale recency record, the entry was touched since
                continue;
            }
            inner.map.remove(&old_key);
            inner.stats.evictions += 1;
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.map.clear();
        inner.order.clear();
    }

    /// Removes every entry whose TTL has elapsed.
    pub fn cleanup_expired(&self) {
        self.cleanup_expired_at(Instant::now())
    }

    pub fn cleanup_expired_at(&self, now: Instant) {
        let mut inner = self.lock();
        let before = inner.map.len();
        inner
            .map
            .retain(|_, slot| !slot.expires_at.is_some_and(|at| at <= now));
        inner.stats.expirations += (before - inner.map.len()) as u64;
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().stats
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<K, V>> {
        // a poisoned cache is still structurally sound; keep serving
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<K, V> Inner<K, V> {
    fn next_stamp(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}
