// Store statistics — live session/runner population and accounted cache size.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

/// Point-in-time view of the store population.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreStatistics {
    pub session_count: u64,
    pub runner_count: u64,
    /// Sum of the configured entry sizes of everything the store has cached.
    pub store_size: u64,
}

/// Counters owned by one store instance, updated on create and on eviction.
#[derive(Default)]
pub struct StatsCollector {
    sessions: AtomicU64,
    runners: AtomicU64,
    size: AtomicI64,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_added(&self, size: u64) {
        self.sessions.fetch_add(1, Ordering::Relaxed);
        self.size.fetch_add(size as i64, Ordering::Relaxed);
    }

    pub fn session_removed(&self, size: u64) {
        Self::decrement(&self.sessions);
        self.size.fetch_sub(size as i64, Ordering::Relaxed);
    }

    pub fn runner_added(&self, size: u64) {
        self.runners.fetch_add(1, Ordering::Relaxed);
        self.size.fetch_add(size as i64, Ordering::Relaxed);
    }

    pub fn runner_removed(&self, size: u64) {
        Self::decrement(&self.runners);
        self.size.fetch_sub(size as i64, Ordering::Relaxed);
    }

    fn decrement(counter: &AtomicU64) {
        let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn snapshot(&self) -> StoreStatistics {
        StoreStatistics {
            session_count: self.sessions.load(Ordering::Relaxed),
            runner_count: self.runners.load(Ordering::Relaxed),
            store_size: self.size.load(Ordering::Relaxed).max(0) as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_population_and_size() {
        let stats = StatsCollector::new();
        stats.session_added(1);
        stats.runner_added(4);
        stats.runner_added(4);
        stats.runner_removed(4);

        let snap = stats.snapshot();
        assert_eq!(snap.session_count, 1);
        assert_eq!(snap.runner_count, 1);
        assert_eq!(snap.store_size, 5);

        stats.session_removed(1);
        stats.session_removed(1);
        assert_eq!(stats.snapshot().session_count, 0);
    }
}
