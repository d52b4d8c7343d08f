use std::time::Duration;

use serde::Deserialize;

/// Default capacity of a streaming runner's bounded queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Sessions idle for this long are evicted from the cache (20 minutes).
pub const DEFAULT_SESSION_SLIDING_EXPIRATION_MS: u64 = 20 * 60 * 1000;

/// Runners idle for this long are evicted and aborted (5 minutes).
pub const DEFAULT_RUNNER_SLIDING_EXPIRATION_MS: u64 = 5 * 60 * 1000;

/// How often the in-process cache scans for expired entries.
pub const DEFAULT_EXPIRATION_SCAN_MS: u64 = 1000;

/// Maximum wait for live sessions to finish cleanup during store disposal.
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 10_000;

/// Eviction cleanup slower than this is reported at warn level.
pub const DEFAULT_CLEANUP_LOG_TIMEOUT_MS: u64 = 5_000;

/// Prefix for marker keys written to the per-request session state.
pub const DEFAULT_MARKER_PREFIX: &str = "Runner";

/// Store configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Sliding expiration of cached sessions.
    pub session_sliding_expiration_ms: u64,
    /// Sliding expiration of cached runners.
    pub runner_sliding_expiration_ms: u64,
    /// Optional hard lifetime of a runner cache entry, relative to its creation.
    pub runner_absolute_expiration_ms: Option<u64>,
    /// Lower bound (inclusive) of runner numbers handed out per session.
    pub runner_number_min: u32,
    /// Upper bound (exclusive) of runner numbers handed out per session.
    pub runner_number_max: u32,
    /// Serialize session creation per base id. When `false` one store-wide lock is used.
    pub per_group_locks: bool,
    /// Total size budget of the in-process cache; `None` means unbounded.
    pub cache_size_limit: Option<u64>,
    /// Expiration scan interval of the in-process cache.
    pub expiration_scan_ms: u64,
    /// Cache size charged per session entry.
    pub session_entry_size: u64,
    /// Cache size charged per runner entry.
    pub runner_entry_size: u64,
    /// Maintain session/runner counters for `current_statistics`.
    pub track_statistics: bool,
    /// Log whether eviction cleanup finished inside this window. `None` disables it.
    pub cleanup_log_timeout_ms: Option<u64>,
    /// Bound on the wait performed by `SessionStore::dispose`.
    pub shutdown_timeout_ms: u64,
    /// Prefix of marker keys in the per-request session state.
    pub marker_prefix: String,
}

impl StoreConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn session_sliding_expiration(&self) -> Duration {
        Duration::from_millis(self.session_sliding_expiration_ms)
    }

    pub fn runner_sliding_expiration(&self) -> Duration {
        Duration::from_millis(self.runner_sliding_expiration_ms)
    }

    pub fn runner_absolute_expiration(&self) -> Option<Duration> {
        self.runner_absolute_expiration_ms.map(Duration::from_millis)
    }

    pub fn expiration_scan_interval(&self) -> Duration {
        Duration::from_millis(self.expiration_scan_ms.max(1))
    }

    pub fn cleanup_log_timeout(&self) -> Option<Duration> {
        self.cleanup_log_timeout_ms.map(Duration::from_millis)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            session_sliding_expiration_ms: DEFAULT_SESSION_SLIDING_EXPIRATION_MS,
            runner_sliding_expiration_ms: DEFAULT_RUNNER_SLIDING_EXPIRATION_MS,
            runner_absolute_expiration_ms: None,
            runner_number_min: 0,
            runner_number_max: i32::MAX as u32,
            per_group_locks: true,
            cache_size_limit: None,
            expiration_scan_ms: DEFAULT_EXPIRATION_SCAN_MS,
            session_entry_size: 1,
            runner_entry_size: 1,
            track_statistics: false,
            cleanup_log_timeout_ms: Some(DEFAULT_CLEANUP_LOG_TIMEOUT_MS),
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            marker_prefix: DEFAULT_MARKER_PREFIX.to_string(),
        }
    }
}

/// Per-runner options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunnerOptions {
    /// Capacity of the bounded queue between the background task and consumers.
    pub queue_capacity: usize,
}

impl RunnerOptions {
    pub fn with_queue_capacity(queue_capacity: usize) -> Self {
        Self { queue_capacity }
    }
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = StoreConfig::from_json(
            r#"{ "per_group_locks": false, "runner_number_max": 2, "track_statistics": true }"#,
        )
        .unwrap();
        assert!(!config.per_group_locks);
        assert_eq!(config.runner_number_max, 2);
        assert!(config.track_statistics);
        assert_eq!(config.marker_prefix, DEFAULT_MARKER_PREFIX);
        assert_eq!(
            config.session_sliding_expiration(),
            Duration::from_millis(DEFAULT_SESSION_SLIDING_EXPIRATION_MS)
        );
    }

    #[test]
    fn invalid_json_is_an_error() {
        assert!(StoreConfig::from_json("{ not json").is_err());
    }
}
