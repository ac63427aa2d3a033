use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use lru::LruCache;
use regex::Regex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::cache::{CacheStrategy, DefaultCacheStrategy};
use crate::context::PermissionContext;

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheStats {
    /// `hits / (hits + misses)`, or 0 before the first lookup.
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    granted: bool,
    stored_at: Instant,
    ttl: Duration,
    access_order: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) > self.ttl
    }
}

#[derive(Debug)]
struct CacheState {
    // `None` when the capacity is zero, which disables caching.
    entries: Option<LruCache<String, CacheEntry>>,
    stats: CacheStats,
    clock: u64,
}

impl CacheState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// Bounded store of boolean decisions with per-entry TTL.
///
/// Capacity is enforced by evicting exactly one least-recently-used entry
/// when a new key is inserted into a full cache. Expired entries are dropped
/// lazily on lookup and proactively by [`EvaluationCache::purge_expired`],
/// which the background sweeper calls periodically.
pub struct EvaluationCache {
    state: Mutex<CacheState>,
    default_ttl: Duration,
    strategy: Box<dyn CacheStrategy>,
}

impl EvaluationCache {
    /// Creates a cache holding at most `max_size` decisions.
    ///
    /// A capacity of zero disables caching.
    pub fn new(max_size: usize, default_ttl: Duration) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: NonZeroUsize::new(max_size).map(LruCache::new),
                stats: CacheStats::default(),
                clock: 0,
            }),
            default_ttl,
            strategy: Box::new(DefaultCacheStrategy),
        }
    }

    /// Installs a strategy that may veto caching or override TTLs.
    pub fn with_strategy(mut self, strategy: impl CacheStrategy + 'static) -> Self {
        self.strategy = Box::new(strategy);
        self
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        // Every mutation completes before the guard drops, so a poisoned
        // state is still consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Looks up a decision, refreshing its recency on hit.
    pub fn get(&self, key: &str) -> Option<bool> {
        let now = Instant::now();
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(entries) = state.entries.as_mut() else {
            state.stats.misses += 1;
            return None;
        };

        let expired = match entries.get(key) {
            Some(entry) => entry.is_expired(now),
            None => {
                state.stats.misses += 1;
                return None;
            }
        };
        if expired {
            entries.pop(key);
            state.stats.misses += 1;
            state.stats.expirations += 1;
            return None;
        }

        state.clock += 1;
        let entry = entries.get_mut(key)?;
        entry.access_order = state.clock;
        state.stats.hits += 1;
        Some(entry.granted)
    }

    /// Stores a decision. Returns `false` when caching is disabled or the
    /// strategy vetoed it.
    pub fn set(
        &self,
        key: impl Into<String>,
        granted: bool,
        ttl: Option<Duration>,
        context: Option<&PermissionContext>,
    ) -> bool {
        let key = key.into();
        if !self.strategy.admit(&key, granted, context) {
            debug!(key = %key, granted, "cache strategy declined decision");
            return false;
        }
        let ttl = self
            .strategy
            .ttl(&key, granted, context, ttl.unwrap_or(self.default_ttl));

        let mut guard = self.lock();
        let order = guard.tick();
        let state = &mut *guard;
        let Some(entries) = state.entries.as_mut() else {
            return false;
        };

        let entry = CacheEntry {
            granted,
            stored_at: Instant::now(),
            ttl,
            access_order: order,
        };
        if let Some((evicted, _)) = entries.push(key.clone(), entry)
            && evicted != key
        {
            debug!(evicted = %evicted, "evicted least recently used decision");
            state.stats.evictions += 1;
        }
        state.stats.sets += 1;
        true
    }

    /// Removes one key.
    pub fn delete(&self, key: &str) -> bool {
        let mut guard = self.lock();
        let state = &mut *guard;
        let removed = state
            .entries
            .as_mut()
            .and_then(|entries| entries.pop(key))
            .is_some();
        if removed {
            state.stats.deletes += 1;
        }
        removed
    }

    /// Removes every key matching `pattern`.
    pub fn delete_by_pattern(&self, pattern: &Regex) -> usize {
        self.delete_where(|key| pattern.is_match(key))
    }

    /// Removes every key starting with `prefix`.
    pub fn delete_by_prefix(&self, prefix: &str) -> usize {
        self.delete_where(|key| key.starts_with(prefix))
    }

    fn delete_where(&self, matches: impl Fn(&str) -> bool) -> usize {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(entries) = state.entries.as_mut() else {
            return 0;
        };
        let keys: Vec<String> = entries
            .iter()
            .filter(|(key, _)| matches(key.as_str()))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            entries.pop(key);
        }
        state.stats.deletes += keys.len() as u64;
        keys.len()
    }

    /// Removes every entry; counters are kept.
    pub fn clear(&self) -> usize {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(entries) = state.entries.as_mut() else {
            return 0;
        };
        let removed = entries.len();
        entries.clear();
        state.stats.deletes += removed as u64;
        removed
    }

    /// Drops all expired entries in one pass under the lock.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(entries) = state.entries.as_mut() else {
            return 0;
        };
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        state.stats.expirations += expired.len() as u64;
        expired.len()
    }

    /// Number of stored entries, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.lock().entries.as_ref().map_or(0, LruCache::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of entries; zero when caching is disabled.
    pub fn capacity(&self) -> usize {
        self.lock()
            .entries
            .as_ref()
            .map_or(0, |entries| entries.cap().get())
    }

    /// TTL applied when `set` is given none.
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> CacheStats {
        self.lock().stats
    }

    /// Keys from least to most recently used.
    pub fn keys_by_recency(&self) -> Vec<String> {
        let guard = self.lock();
        let Some(entries) = guard.entries.as_ref() else {
            return Vec::new();
        };
        let mut keyed: Vec<(u64, String)> = entries
            .iter()
            .map(|(key, entry)| (entry.access_order, key.clone()))
            .collect();
        keyed.sort_unstable();
        keyed.into_iter().map(|(_, key)| key).collect()
    }

    /// Spawns a task that purges expired entries every `every`.
    ///
    /// The task holds a weak reference and stops once the cache is dropped.
    /// Must be called from within a tokio runtime.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);
        let every = every.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let purged = cache.purge_expired();
                if purged > 0 {
                    debug!(purged, "cache sweep purged expired decisions");
                }
            }
        })
    }
}

impl fmt::Debug for EvaluationCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvaluationCache")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("default_ttl", &self.default_ttl)
            .finish_non_exhaustive()
    }
}
