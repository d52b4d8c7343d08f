// Expiring cache contract — what the session store needs from a cache backend.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why an entry left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// Explicit `remove`.
    Removed,
    /// Overwritten by a later `insert` for the same key.
    Replaced,
    /// Sliding or absolute expiration elapsed.
    Expired,
    /// One of the entry's invalidation tokens was cancelled.
    TokenExpired,
    /// Evicted, or refused, to stay under the size limit.
    Capacity,
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Removed => "removed",
            Self::Replaced => "replaced",
            Self::Expired => "expired",
            Self::TokenExpired => "token_expired",
            Self::Capacity => "capacity",
        };
        f.write_str(s)
    }
}

/// Capacity eviction order: lowest priority first. `NeverRemove` entries are
/// only dropped by expiration, tokens or explicit removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum CachePriority {
    Low,
    #[default]
    Normal,
    High,
    NeverRemove,
}

/// Post-eviction callback. Runs after the entry is gone, outside any cache lock.
pub type EvictionCallback<K, V> = Arc<dyn Fn(&K, &V, EvictionReason) + Send + Sync>;

/// Policy attached to one cache entry.
pub struct EntryOptions<K, V> {
    pub sliding_expiration: Option<Duration>,
    pub absolute_expiration_relative_to_now: Option<Duration>,
    pub absolute_expiration: Option<Instant>,
    pub priority: CachePriority,
    pub size: u64,
    pub invalidation_tokens: Vec<CancellationToken>,
    pub eviction_callbacks: Vec<EvictionCallback<K, V>>,
}

impl<K, V> Default for EntryOptions<K, V> {
    fn default() -> Self {
        Self {
            sliding_expiration: None,
            absolute_expiration_relative_to_now: None,
            absolute_expiration: None,
            priority: CachePriority::Normal,
            size: 1,
            invalidation_tokens: Vec::new(),
            eviction_callbacks: Vec::new(),
        }
    }
}

impl<K, V> EntryOptions<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sliding(mut self, after: Duration) -> Self {
        self.sliding_expiration = Some(after);
        self
    }

    pub fn absolute_in(mut self, after: Duration) -> Self {
        self.absolute_expiration_relative_to_now = Some(after);
        self
    }

    pub fn absolute_at(mut self, at: Instant) -> Self {
        self.absolute_expiration = Some(at);
        self
    }

    pub fn priority(mut self, priority: CachePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn invalidate_on(mut self, token: CancellationToken) -> Self {
        self.invalidation_tokens.push(token);
        self
    }

    pub fn on_evicted(mut self, callback: impl Fn(&K, &V, EvictionReason) + Send + Sync + 'static) -> Self {
        self.eviction_callbacks.push(Arc::new(callback));
        self
    }

    /// Earliest absolute deadline, resolving the relative form against `now`.
    pub fn deadline(&self, now: Instant) -> Option<Instant> {
        let relative = self.absolute_expiration_relative_to_now.map(|d| now + d);
        match (self.absolute_expiration, relative) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Key/value cache with per-entry expiration and eviction callbacks.
pub trait ExpiringCache<K, V>: Send + Sync {
    /// Returns the live value for `key`, refreshing its sliding window.
    fn try_get(&self, key: &K) -> Option<V>;

    /// Store `value` under `key`, replacing any previous entry.
    ///
    /// Returns `false` if the entry was refused; its eviction callbacks have
    /// already run with [`EvictionReason::Capacity`] in that case.
    fn insert(&self, key: K, value: V, options: EntryOptions<K, V>) -> bool;

    /// Remove `key`, running its eviction callbacks with [`EvictionReason::Removed`].
    fn remove(&self, key: &K) -> Option<V>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
