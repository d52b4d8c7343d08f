// In-process expiring cache — hash map with lazy expiry, a periodic sweeper and token watchers.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::traits::{CachePriority, EntryOptions, EvictionCallback, EvictionReason, ExpiringCache};
use crate::config::StoreConfig;

#[derive(Debug, Clone)]
pub struct MemoryCacheOptions {
    /// Upper bound on the summed entry sizes. `None` disables capacity eviction.
    pub size_limit: Option<u64>,
    /// How often the sweeper drops expired entries.
    pub scan_interval: Duration,
}

impl Default for MemoryCacheOptions {
    fn default() -> Self {
        Self {
            size_limit: None,
            scan_interval: Duration::from_secs(1),
        }
    }
}

impl MemoryCacheOptions {
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            size_limit: config.cache_size_limit,
            scan_interval: config.expiration_scan_interval(),
        }
    }
}

struct Entry<K, V> {
    id: u64,
    value: V,
    sliding: Option<Duration>,
    deadline: Option<Instant>,
    last_access: Instant,
    priority: CachePriority,
    size: u64,
    tokens: Vec<CancellationToken>,
    callbacks: Vec<EvictionCallback<K, V>>,
    watchers: Vec<AbortHandle>,
}

impl<K, V> Entry<K, V> {
    fn expiry(&self, now: Instant) -> Option<EvictionReason> {
        if self.tokens.iter().any(|t| t.is_cancelled()) {
            return Some(EvictionReason::TokenExpired);
        }
        if self.deadline.is_some_and(|d| now >= d) {
            return Some(EvictionReason::Expired);
        }
        if self
            .sliding
            .is_some_and(|s| now.duration_since(self.last_access) >= s)
        {
            return Some(EvictionReason::Expired);
        }
        None
    }
}

struct Evicted<K, V> {
    key: K,
    entry: Entry<K, V>,
    reason: EvictionReason,
}

impl<K, V> Evicted<K, V> {
    /// Stop watchers and run callbacks. Must be called without the cache lock held.
    fn notify(self) {
        for watcher in &self.entry.watchers {
            watcher.abort();
        }
        for callback in &self.entry.callbacks {
            callback(&self.key, &self.entry.value, self.reason);
        }
    }
}

struct State<K, V> {
    entries: HashMap<K, Entry<K, V>>,
    total_size: u64,
}

impl<K: Eq + Hash + Clone, V> State<K, V> {
    fn take(&mut self, key: &K, reason: EvictionReason) -> Option<Evicted<K, V>> {
        let entry = self.entries.remove(key)?;
        self.total_size = self.total_size.saturating_sub(entry.size);
        Some(Evicted {
            key: key.clone(),
            entry,
            reason,
        })
    }

    fn take_expired(&mut self, now: Instant) -> Vec<Evicted<K, V>> {
        let expired: Vec<(K, EvictionReason)> = self
            .entries
            .iter()
            .filter_map(|(k, e)| e.expiry(now).map(|r| (k.clone(), r)))
            .collect();
        expired
            .into_iter()
            .filter_map(|(k, reason)| self.take(&k, reason))
            .collect()
    }

    /// Evict lowest-priority, least recently used entries until `incoming` fits.
    fn make_room(&mut self, incoming: u64, limit: u64, out: &mut Vec<Evicted<K, V>>) {
        if self.total_size + incoming <= limit {
            return;
        }
        let mut candidates: Vec<(CachePriority, Instant, K)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.priority != CachePriority::NeverRemove)
            .map(|(k, e)| (e.priority, e.last_access, k.clone()))
            .collect();
        candidates.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

        for (_, _, key) in candidates {
            if self.total_size + incoming <= limit {
                break;
            }
            if let Some(evicted) = self.take(&key, EvictionReason::Capacity) {
                out.push(evicted);
            }
        }
    }
}

struct Inner<K, V> {
    state: Mutex<State<K, V>>,
    next_id: AtomicU64,
    size_limit: Option<u64>,
}

impl<K, V> Inner<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn sweep(&self) {
        let evicted = self.state.lock().take_expired(Instant::now());
        if !evicted.is_empty() {
            debug!("cache sweep evicted {} entries", evicted.len());
        }
        evicted.into_iter().for_each(Evicted::notify);
    }

    /// Evict `key` only if it still holds the entry `id` (the watcher's own entry).
    fn evict_if_current(&self, key: &K, id: u64, reason: EvictionReason) {
        let evicted = {
            let mut state = self.state.lock();
            match state.entries.get(key) {
                Some(entry) if entry.id == id => state.take(key, reason),
                _ => None,
            }
        };
        if let Some(evicted) = evicted {
            evicted.notify();
        }
    }
}

/// Expiring cache held in process memory.
///
/// Expiration is checked lazily on access and by a sweeper task on the tokio
/// clock, so paused-time tests can drive it with `tokio::time::advance`.
/// Must be created inside a tokio runtime.
pub struct MemoryCache<K, V> {
    inner: Arc<Inner<K, V>>,
    sweeper: AbortHandle,
}

impl<K, V> MemoryCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(options: MemoryCacheOptions) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                entries: HashMap::new(),
                total_size: 0,
            }),
            next_id: AtomicU64::new(1),
            size_limit: options.size_limit,
        });

        let weak: Weak<Inner<K, V>> = Arc::downgrade(&inner);
        let period = options.scan_interval.max(Duration::from_millis(1));
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                inner.sweep();
            }
        })
        .abort_handle();

        Self { inner, sweeper }
    }

    /// Drop every expired entry now.
    pub fn sweep(&self) {
        self.inner.sweep();
    }

    /// Sum of the sizes of the cached entries.
    pub fn total_size(&self) -> u64 {
        self.inner.state.lock().total_size
    }

    fn watch(&self, key: &K, id: u64, token: &CancellationToken) -> AbortHandle {
        let weak = Arc::downgrade(&self.inner);
        let key = key.clone();
        let token = token.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            if let Some(inner) = weak.upgrade() {
                inner.evict_if_current(&key, id, EvictionReason::TokenExpired);
            }
        })
        .abort_handle()
    }
}

impl<K, V> ExpiringCache<K, V> for MemoryCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn try_get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let (value, evicted) = {
            let mut state = self.inner.state.lock();
            let reason = state.entries.get(key)?.expiry(now);
            match reason {
                Some(reason) => (None, state.take(key, reason)),
                None => {
                    let entry = state.entries.get_mut(key)?;
                    entry.last_access = now;
                    (Some(entry.value.clone()), None)
                }
            }
        };
        if let Some(evicted) = evicted {
            evicted.notify();
        }
        value
    }

    fn insert(&self, key: K, value: V, options: EntryOptions<K, V>) -> bool {
        let now = Instant::now();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut entry = Entry {
            id,
            value,
            sliding: options.sliding_expiration,
            deadline: options.deadline(now),
            last_access: now,
            priority: options.priority,
            size: options.size,
            tokens: options.invalidation_tokens,
            callbacks: options.eviction_callbacks,
            watchers: Vec::new(),
        };

        let mut evicted = Vec::new();
        let stored = {
            let mut state = self.inner.state.lock();
            if let Some(old) = state.take(&key, EvictionReason::Replaced) {
                evicted.push(old);
            }
            let fits = match self.inner.size_limit {
                Some(limit) if entry.size > limit => false,
                Some(limit) => {
                    evicted.extend(state.take_expired(now));
                    state.make_room(entry.size, limit, &mut evicted);
                    state.total_size + entry.size <= limit
                }
                None => true,
            };
            if fits {
                entry.watchers = entry.tokens.iter().map(|t| self.watch(&key, id, t)).collect();
                state.total_size += entry.size;
                state.entries.insert(key, entry);
            } else {
                debug!("cache refused entry of size {}: over size limit", entry.size);
                evicted.push(Evicted {
                    key,
                    entry,
                    reason: EvictionReason::Capacity,
                });
            }
            fits
        };

        evicted.into_iter().for_each(Evicted::notify);
        stored
    }

    fn remove(&self, key: &K) -> Option<V> {
        let evicted = self.inner.state.lock().take(key, EvictionReason::Removed)?;
        let value = evicted.entry.value.clone();
        evicted.notify();
        Some(value)
    }

    fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }
}

impl<K, V> Drop for MemoryCache<K, V> {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}
